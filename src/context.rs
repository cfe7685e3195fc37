//! Per-run context shared by every lifecycle operation
//!
//! One `RunContext` exists per topology run. It carries the network backend,
//! the run's naming scope, the inventory of allocated OS objects and the
//! lookup table used to resolve peer references at use time.

use crate::error::{Error, Result};
use crate::net::{Inventory, NetBackend, Resource, RunScope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Context handed to every Host, Interface and Bridge operation
pub struct RunContext {
    backend: Arc<dyn NetBackend>,
    scope: RunScope,
    inventory: Mutex<Inventory>,
    /// Serializes patch bridge establishment between peered hosts
    patches: Mutex<()>,
    /// (host, interface) -> serial
    serials: HashMap<(String, String), u32>,
    command_timeout: Duration,
}

impl RunContext {
    pub fn new(backend: Arc<dyn NetBackend>, scope: RunScope, command_timeout: Duration) -> Self {
        Self {
            backend,
            scope,
            inventory: Mutex::new(Inventory::new()),
            patches: Mutex::new(()),
            serials: HashMap::new(),
            command_timeout,
        }
    }

    pub fn backend(&self) -> &dyn NetBackend {
        self.backend.as_ref()
    }

    pub fn backend_arc(&self) -> Arc<dyn NetBackend> {
        Arc::clone(&self.backend)
    }

    pub fn scope(&self) -> &RunScope {
        &self.scope
    }

    /// Adopt the scope of a persisted run
    pub(crate) fn set_scope(&mut self, scope: RunScope) {
        self.scope = scope;
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Register an interface and return its serial
    pub(crate) fn register_interface(&mut self, host: &str, interface: &str) -> u32 {
        let next = self.serials.len() as u32;
        *self
            .serials
            .entry((host.to_string(), interface.to_string()))
            .or_insert(next)
    }

    /// Serial of an interface, looked up by key
    pub fn serial(&self, host: &str, interface: &str) -> Result<u32> {
        self.serials
            .get(&(host.to_string(), interface.to_string()))
            .copied()
            .ok_or_else(|| Error::InterfaceNotFound {
                host: host.to_string(),
                interface: interface.to_string(),
            })
    }

    pub fn record(&self, resource: Resource) {
        self.inventory().record(resource);
    }

    pub fn forget(&self, resource: &Resource) {
        self.inventory().forget(resource);
    }

    pub fn inventory(&self) -> MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn replace_inventory(&self, inventory: Inventory) {
        *self.inventory() = inventory;
    }

    pub(crate) fn lock_patches(&self) -> MutexGuard<'_, ()> {
        self.patches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SimKernel;

    #[test]
    fn test_serials_are_stable() {
        let scope = RunScope::new("", Some("ab12".into())).unwrap();
        let mut run = RunContext::new(Arc::new(SimKernel::new()), scope, Duration::from_secs(1));

        let a = run.register_interface("h1", "eth0");
        let b = run.register_interface("h2", "eth0");
        assert_ne!(a, b);
        assert_eq!(run.register_interface("h1", "eth0"), a);
        assert_eq!(run.serial("h2", "eth0").unwrap(), b);
        assert!(matches!(
            run.serial("h3", "eth0"),
            Err(Error::InterfaceNotFound { .. })
        ));
    }
}
