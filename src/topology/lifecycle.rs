//! Host lifecycle state machine
//!
//! Strict sequencing of the seven host phases using the state-machines
//! crate in dynamic dispatch mode. Startup walks
//! `Uncreated -> Created -> Booted -> NetUp -> NetFinalized`, shutdown walks
//! `NetFinalized -> NetDown -> ShutDown -> Removed`. Nothing else is allowed.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use state_machines::state_machine;

state_machine! {
    name: HostMachine,
    dynamic: true,
    initial: Uncreated,
    states: [Uncreated, Created, Booted, NetUp, NetFinalized, NetDown, ShutDown, Removed],
    events {
        create {
            transition: { from: Uncreated, to: Created }
        }
        boot {
            transition: { from: Created, to: Booted }
        }
        up {
            transition: { from: Booted, to: NetUp }
        }
        finalize {
            transition: { from: NetUp, to: NetFinalized }
        }
        down {
            transition: { from: NetFinalized, to: NetDown }
        }
        shutdown {
            transition: { from: NetDown, to: ShutDown }
        }
        remove {
            transition: { from: ShutDown, to: Removed }
        }
    }
}

/// Host lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostState {
    Uncreated,
    Created,
    Booted,
    NetUp,
    NetFinalized,
    NetDown,
    ShutDown,
    Removed,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Uncreated => "Uncreated",
            HostState::Created => "Created",
            HostState::Booted => "Booted",
            HostState::NetUp => "NetUp",
            HostState::NetFinalized => "NetFinalized",
            HostState::NetDown => "NetDown",
            HostState::ShutDown => "ShutDown",
            HostState::Removed => "Removed",
        }
    }

    /// Whether network objects may still be reconfigured
    pub fn before_net_up(&self) -> bool {
        matches!(
            self,
            HostState::Uncreated | HostState::Created | HostState::Booted
        )
    }
}

impl FromStr for HostState {
    type Err = Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        Ok(match s {
            "Uncreated" => HostState::Uncreated,
            "Created" => HostState::Created,
            "Booted" => HostState::Booted,
            "NetUp" => HostState::NetUp,
            "NetFinalized" => HostState::NetFinalized,
            "NetDown" => HostState::NetDown,
            "ShutDown" => HostState::ShutDown,
            "Removed" => HostState::Removed,
            other => {
                return Err(Error::ArgumentMismatch(format!(
                    "Unknown host state '{}'",
                    other
                )));
            }
        })
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Create,
    Boot,
    NetUp,
    NetFinalize,
    NetDown,
    Shutdown,
    Remove,
}

impl Phase {
    /// Forward phases in execution order
    pub const STARTUP: [Phase; 4] = [Phase::Create, Phase::Boot, Phase::NetUp, Phase::NetFinalize];

    /// Reverse phases in execution order
    pub const SHUTDOWN: [Phase; 3] = [Phase::NetDown, Phase::Shutdown, Phase::Remove];

    /// State a host must be in to run this phase
    pub fn required_state(&self) -> HostState {
        match self {
            Phase::Create => HostState::Uncreated,
            Phase::Boot => HostState::Created,
            Phase::NetUp => HostState::Booted,
            Phase::NetFinalize => HostState::NetUp,
            Phase::NetDown => HostState::NetFinalized,
            Phase::Shutdown => HostState::NetDown,
            Phase::Remove => HostState::ShutDown,
        }
    }

    /// State a host is in after this phase completes
    pub fn target_state(&self) -> HostState {
        match self {
            Phase::Create => HostState::Created,
            Phase::Boot => HostState::Booted,
            Phase::NetUp => HostState::NetUp,
            Phase::NetFinalize => HostState::NetFinalized,
            Phase::NetDown => HostState::NetDown,
            Phase::Shutdown => HostState::ShutDown,
            Phase::Remove => HostState::Removed,
        }
    }

    /// Startup phases run in start order, shutdown phases in reverse
    pub fn is_forward(&self) -> bool {
        matches!(
            self,
            Phase::Create | Phase::Boot | Phase::NetUp | Phase::NetFinalize
        )
    }

    fn event(&self) -> HostMachineEvent {
        match self {
            Phase::Create => HostMachineEvent::Create,
            Phase::Boot => HostMachineEvent::Boot,
            Phase::NetUp => HostMachineEvent::Up,
            Phase::NetFinalize => HostMachineEvent::Finalize,
            Phase::NetDown => HostMachineEvent::Down,
            Phase::Shutdown => HostMachineEvent::Shutdown,
            Phase::Remove => HostMachineEvent::Remove,
        }
    }

    /// All phases from `Uncreated` up to `state`
    fn path_to(state: HostState) -> impl Iterator<Item = Phase> {
        Phase::STARTUP
            .into_iter()
            .chain(Phase::SHUTDOWN)
            .take_while(move |p| p.required_state() < state)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Create => "create",
            Phase::Boot => "boot",
            Phase::NetUp => "net_up",
            Phase::NetFinalize => "net_finalize",
            Phase::NetDown => "net_down",
            Phase::Shutdown => "shutdown",
            Phase::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// Lifecycle tracking for one host
pub struct Lifecycle {
    machine: DynamicHostMachine<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: HostMachine::new(()).into_dynamic(),
        }
    }

    /// Current state
    pub fn state(&self) -> HostState {
        // The machine only ever reports the states declared above
        self.machine
            .current_state()
            .parse()
            .unwrap_or(HostState::Uncreated)
    }

    /// Check that `phase` may run now, before any side effect happens
    pub fn begin(&self, host: &str, phase: Phase) -> crate::error::Result<()> {
        let state = self.state();
        if state != phase.required_state() {
            return Err(Error::InvalidTransition {
                host: host.to_string(),
                event: phase.to_string(),
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Record that `phase` finished
    pub fn complete(&mut self, host: &str, phase: Phase) -> crate::error::Result<()> {
        self.machine
            .handle(phase.event())
            .map_err(|_| Error::InvalidTransition {
                host: host.to_string(),
                event: phase.to_string(),
                state: self.machine.current_state().to_string(),
            })
    }

    /// Fast-forward a fresh machine to `target` without side effects
    pub fn resume(&mut self, host: &str, target: HostState) -> crate::error::Result<()> {
        for phase in Phase::path_to(target) {
            self.begin(host, phase)?;
            self.complete(host, phase)?;
        }
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = HostMachine::new(()).into_dynamic();
        assert_eq!(machine.current_state(), "Uncreated");
    }

    #[test]
    fn test_full_lifecycle() {
        let mut lc = Lifecycle::new();
        for phase in Phase::STARTUP.into_iter().chain(Phase::SHUTDOWN) {
            lc.begin("h", phase).unwrap();
            lc.complete("h", phase).unwrap();
            assert_eq!(lc.state(), phase.target_state());
        }
        assert_eq!(lc.state(), HostState::Removed);
    }

    #[test]
    fn test_out_of_order_is_rejected() {
        let lc = Lifecycle::new();
        let err = lc.begin("h", Phase::NetUp).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let mut lc = Lifecycle::new();
        lc.resume("h", HostState::NetFinalized).unwrap();
        assert!(lc.begin("h", Phase::Create).is_err());
    }

    #[test]
    fn test_removed_is_terminal() {
        let mut lc = Lifecycle::new();
        lc.resume("h", HostState::Removed).unwrap();
        for phase in Phase::STARTUP.into_iter().chain(Phase::SHUTDOWN) {
            assert!(lc.begin("h", phase).is_err());
        }
    }

    #[test]
    fn test_resume_to_each_state() {
        for target in [
            HostState::Uncreated,
            HostState::Booted,
            HostState::NetFinalized,
            HostState::ShutDown,
        ] {
            let mut lc = Lifecycle::new();
            lc.resume("h", target).unwrap();
            assert_eq!(lc.state(), target);
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::NetFinalize.to_string(), "net_finalize");
        assert!(Phase::Boot.is_forward());
        assert!(!Phase::Remove.is_forward());
    }
}
