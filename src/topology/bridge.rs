//! Software bridges owned by a host

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::net::{NetContext, NetOp, Resource};
use crate::topology::{Interface, device_name};
use std::collections::BTreeSet;

/// A layer-2 bridge and the interfaces attached to it
#[derive(Debug, Clone)]
pub struct Bridge {
    pub name: String,
    /// Names of attached interfaces on the same host
    pub members: BTreeSet<String>,
    realized: bool,
}

impl Bridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
            realized: false,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub(crate) fn mark_realized(&mut self, realized: bool) {
        self.realized = realized;
    }

    pub fn device(&self, run: &RunContext, net: &NetContext) -> String {
        device_name(run, net, &self.name)
    }

    /// Create the bridge device and bring it up
    pub fn create(&mut self, run: &RunContext, net: &NetContext) -> Result<()> {
        let device = self.device(run, net);
        run.backend().apply(&NetOp::BridgeAdd {
            ctx: net.clone(),
            name: device.clone(),
        })?;
        run.record(Resource::Bridge {
            ctx: net.clone(),
            name: device.clone(),
        });
        self.realized = true;

        run.backend().apply(&NetOp::LinkSetUp {
            ctx: net.clone(),
            name: device,
            up: true,
        })
    }

    /// Delete the bridge device; attached interfaces survive as standalone links
    pub fn destroy(&mut self, run: &RunContext, net: &NetContext) -> Result<()> {
        if !self.realized {
            return Ok(());
        }
        let backend = run.backend();
        let device = self.device(run, net);

        let present = match net.namespace() {
            Some(ns) => backend.netns_exists(ns)? && backend.link_exists(net, &device)?,
            None => backend.link_exists(net, &device)?,
        };
        if present {
            backend.apply(&NetOp::LinkDel {
                ctx: net.clone(),
                name: device.clone(),
            })?;
        }
        run.forget(&Resource::Bridge {
            ctx: net.clone(),
            name: device,
        });
        self.members.clear();
        self.realized = false;
        Ok(())
    }

    /// Attach an interface as a bridge port
    pub fn link_interface(&mut self, run: &RunContext, net: &NetContext, iface: &Interface) -> Result<()> {
        if !self.realized {
            return Err(Error::BridgeNotRealized(self.name.clone()));
        }
        run.backend().apply(&NetOp::LinkSetMaster {
            ctx: net.clone(),
            name: iface.device(run, net),
            master: Some(self.device(run, net)),
        })?;
        self.members.insert(iface.name.clone());
        Ok(())
    }

    /// Detach an interface; the interface itself is left alone
    pub fn unlink_interface(&mut self, run: &RunContext, net: &NetContext, iface: &Interface) -> Result<()> {
        if !self.members.remove(&iface.name) {
            return Ok(());
        }
        let device = iface.device(run, net);
        if run.backend().link_exists(net, &device)? {
            run.backend().apply(&NetOp::LinkSetMaster {
                ctx: net.clone(),
                name: device,
                master: None,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetBackend, RunScope, SimKernel};
    use crate::topology::InterfaceKind;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<SimKernel>, RunContext) {
        let kernel = Arc::new(SimKernel::new());
        let scope = RunScope::new("", Some("ab12".into())).unwrap();
        let backend: Arc<dyn NetBackend> = kernel.clone();
        (kernel, RunContext::new(backend, scope, Duration::from_secs(1)))
    }

    #[test]
    fn test_attach_before_create_fails() {
        let (_kernel, run) = setup();
        let mut bridge = Bridge::new("br0");
        let iface = Interface::new("testi", "h", InterfaceKind::Dummy, 0);

        let err = bridge
            .link_interface(&run, &NetContext::Root, &iface)
            .unwrap_err();
        assert!(matches!(err, Error::BridgeNotRealized(_)));
        assert!(bridge.members.is_empty());
    }

    #[test]
    fn test_attach_after_create_updates_members() {
        let (kernel, run) = setup();
        let root = NetContext::Root;
        let mut bridge = Bridge::new("br0");
        let mut iface = Interface::new("testi", "h", InterfaceKind::Dummy, 0);

        bridge.create(&run, &root).unwrap();
        iface.create(&run, &root, &mut BTreeMap::new()).unwrap();
        bridge.link_interface(&run, &root, &iface).unwrap();

        assert!(bridge.members.contains("testi"));
        assert_eq!(
            kernel.bridge_members(&root, "br0").unwrap(),
            vec!["testi".to_string()]
        );

        bridge.unlink_interface(&run, &root, &iface).unwrap();
        assert!(bridge.members.is_empty());
        assert!(kernel.bridge_members(&root, "br0").unwrap().is_empty());
        assert!(kernel.link(&root, "testi").is_some());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (kernel, run) = setup();
        let mut bridge = Bridge::new("br0");
        bridge.create(&run, &NetContext::Root).unwrap();
        bridge.destroy(&run, &NetContext::Root).unwrap();
        bridge.destroy(&run, &NetContext::Root).unwrap();
        assert!(kernel.link(&NetContext::Root, "br0").is_none());
    }
}
