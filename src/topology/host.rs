//! Hosts: units of topology owning interfaces, bridges and applications
//!
//! Every host variant implements the [`Host`] capability trait. The shared
//! phase logic lives in [`HostCore`]; a variant only decides how its
//! isolation context is allocated and released.

use crate::app::{AppContext, Application};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::net::{NetContext, NetOp, Resource};
use crate::topology::{Bridge, HostState, Interface, InterfaceKind, Lifecycle, PeerRef, Phase};
use std::collections::BTreeMap;
use std::fmt;

/// Which family a host implementation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    Root,
    Namespace,
    Vm,
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostKind::Root => "root",
            HostKind::Namespace => "netns",
            HostKind::Vm => "vm",
        };
        f.write_str(s)
    }
}

/// State shared by every host variant
pub struct HostCore {
    pub name: String,
    pub depends_on: Vec<String>,
    /// Network context the host's objects live in
    pub net: NetContext,
    pub interfaces: BTreeMap<String, Interface>,
    pub bridges: BTreeMap<String, Bridge>,
    pub applications: Vec<Box<dyn Application>>,
    lifecycle: Lifecycle,
}

impl HostCore {
    pub fn new(name: impl Into<String>, net: NetContext) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            net,
            interfaces: BTreeMap::new(),
            bridges: BTreeMap::new(),
            applications: Vec::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn state(&self) -> HostState {
        self.lifecycle.state()
    }

    /// Run a phase body between the lifecycle check and the transition
    fn step(&mut self, phase: Phase, body: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        self.lifecycle.begin(&self.name, phase)?;
        tracing::info!(host = %self.name, %phase, "phase start");
        body(self)?;
        self.lifecycle.complete(&self.name, phase)?;
        tracing::debug!(host = %self.name, state = %self.state(), "phase done");
        Ok(())
    }

    fn boot(&mut self, run: &RunContext) -> Result<()> {
        self.step(Phase::Boot, |core| {
            let HostCore {
                name,
                net,
                applications,
                ..
            } = core;
            let ctx = AppContext {
                host: name.as_str(),
                net: &*net,
                run,
            };
            for app in applications.iter_mut() {
                app.prepare_environment(&ctx)?;
                app.control_start(&ctx)?;
            }
            Ok(())
        })
    }

    fn net_up(&mut self, run: &RunContext) -> Result<()> {
        self.step(Phase::NetUp, |core| {
            let HostCore {
                net,
                interfaces,
                bridges,
                ..
            } = core;
            // Bridges first, interfaces attach to them
            for bridge in bridges.values_mut() {
                bridge.create(run, net)?;
            }
            for iface in interfaces.values_mut() {
                iface.create(run, net, bridges)?;
            }
            Ok(())
        })
    }

    fn net_finalize(&mut self, run: &RunContext) -> Result<()> {
        self.step(Phase::NetFinalize, |core| {
            for iface in core.interfaces.values() {
                iface.finalize(run, &core.net)?;
            }
            Ok(())
        })
    }

    fn net_down(&mut self, run: &RunContext) -> Result<()> {
        self.step(Phase::NetDown, |core| {
            let HostCore {
                net,
                interfaces,
                bridges,
                ..
            } = core;
            for iface in interfaces.values().rev() {
                iface.down(run, net, bridges)?;
            }
            Ok(())
        })
    }

    fn shutdown(&mut self, run: &RunContext) -> Result<()> {
        self.step(Phase::Shutdown, |core| {
            let HostCore {
                name,
                net,
                applications,
                ..
            } = core;
            let ctx = AppContext {
                host: name.as_str(),
                net: &*net,
                run,
            };
            for app in applications.iter_mut().rev() {
                app.control_stop(&ctx)?;
                app.cleanup_environment(&ctx)?;
            }
            Ok(())
        })
    }

    /// Destroy interfaces, then bridges
    fn teardown_network(&mut self, run: &RunContext) -> Result<()> {
        for iface in self.interfaces.values_mut().rev() {
            iface.destroy(run, &self.net)?;
        }
        for bridge in self.bridges.values_mut().rev() {
            bridge.destroy(run, &self.net)?;
        }
        Ok(())
    }

    /// Set one side of a peer relation
    pub fn link_interface(&mut self, local: &str, peer: PeerRef) -> Result<()> {
        let state = self.state();
        if !state.before_net_up() {
            return Err(Error::InvalidTransition {
                host: self.name.clone(),
                event: "link_interface".to_string(),
                state: state.to_string(),
            });
        }
        let iface = self
            .interfaces
            .get_mut(local)
            .ok_or_else(|| Error::InterfaceNotFound {
                host: self.name.clone(),
                interface: local.to_string(),
            })?;

        match iface.kind {
            InterfaceKind::Veth => {}
            // Peering turns an isolated endpoint into a veth endpoint
            InterfaceKind::Dummy => iface.kind = InterfaceKind::Veth,
            InterfaceKind::Tap => {
                return Err(Error::ArgumentMismatch(format!(
                    "Tap interface '{}' on host '{}' cannot be peered",
                    local, self.name
                )));
            }
        }
        iface.peer = Some(peer);
        Ok(())
    }

    /// Adopt a persisted lifecycle state without touching the OS
    pub fn resume(&mut self, state: HostState) -> Result<()> {
        self.lifecycle.resume(&self.name, state)?;

        let realized = matches!(
            state,
            HostState::NetUp | HostState::NetFinalized | HostState::NetDown | HostState::ShutDown
        );
        let attached = matches!(state, HostState::NetUp | HostState::NetFinalized);

        for bridge in self.bridges.values_mut() {
            bridge.mark_realized(realized);
            bridge.members.clear();
        }
        for iface in self.interfaces.values_mut() {
            iface.mark_realized(realized);
            if attached {
                if let Some(bridge) = iface.linked_bridge.as_ref().and_then(|b| self.bridges.get_mut(b)) {
                    bridge.members.insert(iface.name.clone());
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HostCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCore")
            .field("name", &self.name)
            .field("net", &self.net)
            .field("state", &self.state())
            .field("interfaces", &self.interfaces.keys().collect::<Vec<_>>())
            .field("bridges", &self.bridges.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Lifecycle capability shared by every host variant
///
/// Phase operations must be called once each, in lifecycle order; anything
/// else fails with [`Error::InvalidTransition`] before any side effect.
pub trait Host: Send {
    fn core(&self) -> &HostCore;

    fn core_mut(&mut self) -> &mut HostCore;

    fn kind(&self) -> HostKind;

    /// Allocate the isolation context
    fn create_context(&mut self, run: &RunContext) -> Result<()>;

    /// Release the isolation context
    fn remove_context(&mut self, run: &RunContext) -> Result<()>;

    /// Extra lines for `print_config`
    fn describe(&self) -> Vec<String> {
        Vec::new()
    }

    fn name(&self) -> &str {
        &self.core().name
    }

    fn state(&self) -> HostState {
        self.core().state()
    }

    fn create(&mut self, run: &RunContext) -> Result<()> {
        let name = self.core().name.clone();
        self.core().lifecycle.begin(&name, Phase::Create)?;
        tracing::info!(host = %name, phase = %Phase::Create, "phase start");
        self.create_context(run)?;
        self.core_mut().lifecycle.complete(&name, Phase::Create)
    }

    fn boot(&mut self, run: &RunContext) -> Result<()> {
        self.core_mut().boot(run)
    }

    fn net_up(&mut self, run: &RunContext) -> Result<()> {
        self.core_mut().net_up(run)
    }

    fn net_finalize(&mut self, run: &RunContext) -> Result<()> {
        self.core_mut().net_finalize(run)
    }

    fn net_down(&mut self, run: &RunContext) -> Result<()> {
        self.core_mut().net_down(run)
    }

    fn shutdown(&mut self, run: &RunContext) -> Result<()> {
        self.core_mut().shutdown(run)
    }

    fn remove(&mut self, run: &RunContext) -> Result<()> {
        let name = self.core().name.clone();
        self.core().lifecycle.begin(&name, Phase::Remove)?;
        tracing::info!(host = %name, phase = %Phase::Remove, "phase start");
        self.core_mut().teardown_network(run)?;
        self.remove_context(run)?;
        self.core_mut().lifecycle.complete(&name, Phase::Remove)
    }

    /// Set one side of a peer relation; only allowed before net_up
    fn link_interface(&mut self, local: &str, peer: PeerRef) -> Result<()> {
        self.core_mut().link_interface(local, peer)
    }

    /// Dispatch a phase by value
    fn run_phase(&mut self, run: &RunContext, phase: Phase) -> Result<()> {
        match phase {
            Phase::Create => self.create(run),
            Phase::Boot => self.boot(run),
            Phase::NetUp => self.net_up(run),
            Phase::NetFinalize => self.net_finalize(run),
            Phase::NetDown => self.net_down(run),
            Phase::Shutdown => self.shutdown(run),
            Phase::Remove => self.remove(run),
        }
    }
}

/// Create a namespace and bring its loopback up
fn add_namespace(run: &RunContext, netns: &str) -> Result<()> {
    let backend = run.backend();
    backend.apply(&NetOp::NetnsAdd {
        name: netns.to_string(),
    })?;
    run.record(Resource::Namespace {
        name: netns.to_string(),
    });
    backend.apply(&NetOp::LinkSetUp {
        ctx: NetContext::Namespace(netns.to_string()),
        name: "lo".to_string(),
        up: true,
    })
}

/// Delete a namespace if it still exists
fn del_namespace(run: &RunContext, netns: &str) -> Result<()> {
    let backend = run.backend();
    if backend.netns_exists(netns)? {
        backend.apply(&NetOp::NetnsDel {
            name: netns.to_string(),
        })?;
    }
    run.inventory().forget_namespace(netns);
    Ok(())
}

/// Host sharing the ambient network context
pub struct RootHost {
    core: HostCore,
}

impl RootHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: HostCore::new(name, NetContext::Root),
        }
    }
}

impl Host for RootHost {
    fn core(&self) -> &HostCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HostCore {
        &mut self.core
    }

    fn kind(&self) -> HostKind {
        HostKind::Root
    }

    fn create_context(&mut self, _run: &RunContext) -> Result<()> {
        Ok(())
    }

    fn remove_context(&mut self, _run: &RunContext) -> Result<()> {
        Ok(())
    }
}

/// Host isolated in its own network namespace
pub struct NamespaceHost {
    core: HostCore,
    netns: String,
}

impl NamespaceHost {
    pub fn new(name: impl Into<String>, netns: impl Into<String>) -> Self {
        let netns = netns.into();
        Self {
            core: HostCore::new(name, NetContext::Namespace(netns.clone())),
            netns,
        }
    }

    pub fn netns(&self) -> &str {
        &self.netns
    }
}

impl Host for NamespaceHost {
    fn core(&self) -> &HostCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HostCore {
        &mut self.core
    }

    fn kind(&self) -> HostKind {
        HostKind::Namespace
    }

    fn create_context(&mut self, run: &RunContext) -> Result<()> {
        add_namespace(run, &self.netns)
    }

    fn remove_context(&mut self, run: &RunContext) -> Result<()> {
        del_namespace(run, &self.netns)
    }

    fn describe(&self) -> Vec<String> {
        vec![format!("Namespace: {}", self.netns)]
    }
}

/// VM emulated by a namespace, running under a hypervisor host
pub struct VmHost {
    core: HostCore,
    netns: String,
    hypervisor: String,
    /// Context of the hypervisor host
    parent: NetContext,
}

impl VmHost {
    pub fn new(
        name: impl Into<String>,
        netns: impl Into<String>,
        hypervisor: impl Into<String>,
        parent: NetContext,
    ) -> Self {
        let netns = netns.into();
        Self {
            core: HostCore::new(name, NetContext::Namespace(netns.clone())),
            netns,
            hypervisor: hypervisor.into(),
            parent,
        }
    }

    pub fn hypervisor(&self) -> &str {
        &self.hypervisor
    }
}

impl Host for VmHost {
    fn core(&self) -> &HostCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HostCore {
        &mut self.core
    }

    fn kind(&self) -> HostKind {
        HostKind::Vm
    }

    fn create_context(&mut self, run: &RunContext) -> Result<()> {
        if let Some(parent) = self.parent.namespace() {
            if !run.backend().netns_exists(parent)? {
                return Err(Error::NamespaceNotFound(parent.to_string()));
            }
        }
        add_namespace(run, &self.netns)
    }

    fn remove_context(&mut self, run: &RunContext) -> Result<()> {
        del_namespace(run, &self.netns)
    }

    fn describe(&self) -> Vec<String> {
        vec![
            format!("Namespace: {}", self.netns),
            format!("Hypervisor: {}", self.hypervisor),
        ]
    }
}

/// Everything a host constructor needs
#[derive(Debug, Clone)]
pub struct HostInit {
    pub name: String,
    /// Scoped namespace name (unused by root hosts)
    pub netns: String,
    pub hypervisor: Option<String>,
    /// Context of the hypervisor host, for VM hosts
    pub parent: Option<NetContext>,
}

/// Constructor for a host implementation
pub type HostConstructor = fn(HostInit) -> Result<Box<dyn Host>>;

fn build_root(init: HostInit) -> Result<Box<dyn Host>> {
    Ok(Box::new(RootHost::new(init.name)))
}

fn build_namespace(init: HostInit) -> Result<Box<dyn Host>> {
    Ok(Box::new(NamespaceHost::new(init.name, init.netns)))
}

fn build_vm(init: HostInit) -> Result<Box<dyn Host>> {
    let (Some(hypervisor), Some(parent)) = (init.hypervisor, init.parent) else {
        return Err(Error::ConfigValidation(format!(
            "VM host '{}' requires a hypervisor",
            init.name
        )));
    };
    Ok(Box::new(VmHost::new(init.name, init.netns, hypervisor, parent)))
}

/// Maps implementation identifiers to host constructors
pub struct HostRegistry {
    constructors: BTreeMap<String, (HostKind, HostConstructor)>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the built-in implementations and their aliases
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for id in ["root", "RootHost"] {
            registry.register(id, HostKind::Root, build_root);
        }
        for id in ["netns", "NamespaceHost", "IPNetNSHost"] {
            registry.register(id, HostKind::Namespace, build_namespace);
        }
        for id in ["vm", "VMHost"] {
            registry.register(id, HostKind::Vm, build_vm);
        }
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, kind: HostKind, constructor: HostConstructor) {
        self.constructors.insert(id.into(), (kind, constructor));
    }

    /// Kind of an implementation id
    pub fn kind_of(&self, id: &str) -> Result<HostKind> {
        self.constructors
            .get(id)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| Error::UnknownImplementation(id.to_string()))
    }

    pub fn build(&self, id: &str, init: HostInit) -> Result<Box<dyn Host>> {
        let (_, constructor) = self
            .constructors
            .get(id)
            .ok_or_else(|| Error::UnknownImplementation(id.to_string()))?;
        constructor(init)
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetBackend, RunScope, SimKernel};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<SimKernel>, RunContext) {
        let kernel = Arc::new(SimKernel::new());
        let scope = RunScope::new("", Some("ab12".into())).unwrap();
        let backend: Arc<dyn NetBackend> = kernel.clone();
        (kernel, RunContext::new(backend, scope, Duration::from_secs(1)))
    }

    fn startup(host: &mut dyn Host, run: &RunContext) {
        for phase in Phase::STARTUP {
            host.run_phase(run, phase).unwrap();
        }
    }

    fn teardown(host: &mut dyn Host, run: &RunContext) {
        for phase in Phase::SHUTDOWN {
            host.run_phase(run, phase).unwrap();
        }
    }

    #[test]
    fn test_namespace_host_with_dummy() {
        let (kernel, mut run) = setup();
        let serial = run.register_interface("zoo1", "eth0");
        let mut host = NamespaceHost::new("zoo1", "zoo1");
        host.core_mut().interfaces.insert(
            "eth0".into(),
            Interface::new("eth0", "zoo1", InterfaceKind::Dummy, serial),
        );

        startup(&mut host, &run);
        let ns = NetContext::Namespace("zoo1".into());
        assert_eq!(kernel.namespaces(), vec!["zoo1".to_string()]);
        assert!(kernel.link(&ns, "eth0").is_some());
        assert!(kernel.link(&ns, "lo").unwrap().up);

        teardown(&mut host, &run);
        assert!(kernel.namespaces().is_empty());
        assert_eq!(host.state(), HostState::Removed);
        assert!(run.inventory().is_empty());
    }

    #[test]
    fn test_bridge_membership_across_net_down() {
        let (kernel, mut run) = setup();
        let serial = run.register_interface("test", "testi");
        let mut host = RootHost::new("test");
        let mut iface = Interface::new("testi", "test", InterfaceKind::Dummy, serial);
        iface.linked_bridge = Some("br0".into());
        host.core_mut().interfaces.insert("testi".into(), iface);
        host.core_mut()
            .bridges
            .insert("br0".into(), Bridge::new("br0"));

        let root = NetContext::Root;
        for phase in [Phase::Create, Phase::Boot, Phase::NetUp] {
            host.run_phase(&run, phase).unwrap();
        }
        assert_eq!(
            kernel.bridge_members(&root, "br0").unwrap(),
            vec!["testi".to_string()]
        );
        assert!(host.core().bridges["br0"].members.contains("testi"));

        host.run_phase(&run, Phase::NetFinalize).unwrap();
        host.run_phase(&run, Phase::NetDown).unwrap();
        assert!(kernel.link(&root, "br0").is_some());
        assert!(kernel.bridge_members(&root, "br0").unwrap().is_empty());
        assert!(host.core().bridges["br0"].members.is_empty());

        host.run_phase(&run, Phase::Shutdown).unwrap();
        host.run_phase(&run, Phase::Remove).unwrap();
        assert!(kernel.link(&root, "br0").is_none());
        assert!(kernel.link(&root, "testi").is_none());
    }

    #[test]
    fn test_phase_out_of_order_has_no_side_effects() {
        let (kernel, run) = setup();
        let mut host = NamespaceHost::new("zoo1", "zoo1");
        let err = host.net_up(&run).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(kernel.journal().is_empty());
    }

    #[test]
    fn test_failed_phase_keeps_state() {
        let (kernel, run) = setup();
        kernel.fail_on("netns add zoo1");
        let mut host = NamespaceHost::new("zoo1", "zoo1");
        assert!(host.create(&run).is_err());
        assert_eq!(host.state(), HostState::Uncreated);
    }

    #[test]
    fn test_vm_requires_parent_namespace() {
        let (kernel, run) = setup();
        let mut vm = VmHost::new("vm1", "vm1", "cmp1", NetContext::Namespace("cmp1".into()));
        let err = vm.create(&run).unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(_)));

        kernel
            .apply(&NetOp::NetnsAdd { name: "cmp1".into() })
            .unwrap();
        vm.create(&run).unwrap();
        assert!(kernel.namespaces().contains(&"vm1".to_string()));
    }

    #[test]
    fn test_link_interface_only_before_net_up() {
        let (_kernel, mut run) = setup();
        let serial = run.register_interface("h", "eth0");
        run.register_interface("p", "eth0");
        let mut host = RootHost::new("h");
        host.core_mut().interfaces.insert(
            "eth0".into(),
            Interface::new("eth0", "h", InterfaceKind::Dummy, serial),
        );

        host.link_interface("eth0", PeerRef::new("p", "eth0")).unwrap();
        assert_eq!(host.core().interfaces["eth0"].kind, InterfaceKind::Veth);
        assert!(matches!(
            host.link_interface("nope", PeerRef::new("p", "eth0")),
            Err(Error::InterfaceNotFound { .. })
        ));

        for phase in [Phase::Create, Phase::Boot, Phase::NetUp] {
            host.run_phase(&run, phase).unwrap();
        }
        assert!(matches!(
            host.link_interface("eth0", PeerRef::new("p", "eth1")),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_resume_restores_membership() {
        let mut core = HostCore::new("h", NetContext::Root);
        let mut iface = Interface::new("testi", "h", InterfaceKind::Dummy, 0);
        iface.linked_bridge = Some("br0".into());
        core.interfaces.insert("testi".into(), iface);
        core.bridges.insert("br0".into(), Bridge::new("br0"));

        core.resume(HostState::NetFinalized).unwrap();
        assert_eq!(core.state(), HostState::NetFinalized);
        assert!(core.interfaces["testi"].is_realized());
        assert!(core.bridges["br0"].members.contains("testi"));
    }

    #[test]
    fn test_registry_aliases() {
        let registry = HostRegistry::with_builtins();
        assert_eq!(registry.kind_of("IPNetNSHost").unwrap(), HostKind::Namespace);
        assert_eq!(registry.kind_of("RootHost").unwrap(), HostKind::Root);
        assert_eq!(registry.kind_of("vm").unwrap(), HostKind::Vm);
        assert!(matches!(
            registry.kind_of("PhysicalHost"),
            Err(Error::UnknownImplementation(_))
        ));

        let init = HostInit {
            name: "vm1".into(),
            netns: "vm1".into(),
            hypervisor: None,
            parent: None,
        };
        assert!(registry.build("vm", init).is_err());
    }
}
