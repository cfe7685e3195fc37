//! Virtual network endpoints owned by a host

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::net::{NetContext, NetOp, Resource, Route};
use crate::topology::{Bridge, device_name, patch};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Interface variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// Veth pair endpoint, patchable to a peer on another host
    Veth,
    /// Isolated endpoint
    Dummy,
    /// Hypervisor-facing tap device
    Tap,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterfaceKind::Veth => "veth",
            InterfaceKind::Dummy => "dummy",
            InterfaceKind::Tap => "tap",
        };
        f.write_str(s)
    }
}

/// Key of an interface on another host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerRef {
    pub host: String,
    pub interface: String,
}

impl PeerRef {
    pub fn new(host: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.interface)
    }
}

/// A network interface on a host
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    /// Owning host
    pub host: String,
    pub kind: InterfaceKind,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<Route>,
    pub mac_address: Option<String>,
    /// Bridge on the same host this interface is a port of
    pub linked_bridge: Option<String>,
    pub peer: Option<PeerRef>,
    /// Run-unique number used for hidden object names
    pub serial: u32,
    realized: bool,
}

impl Interface {
    pub fn new(name: impl Into<String>, host: impl Into<String>, kind: InterfaceKind, serial: u32) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            kind,
            addresses: Vec::new(),
            routes: Vec::new(),
            mac_address: None,
            linked_bridge: None,
            peer: None,
            serial,
            realized: false,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub(crate) fn mark_realized(&mut self, realized: bool) {
        self.realized = realized;
    }

    /// Kernel device name in the owning host's context
    pub fn device(&self, run: &RunContext, net: &NetContext) -> String {
        device_name(run, net, &self.name)
    }

    /// Root-context stub of this interface's veth pair
    pub fn stub(&self, run: &RunContext) -> Option<String> {
        match self.kind {
            InterfaceKind::Veth => Some(run.scope().stub(self.serial)),
            _ => None,
        }
    }

    /// Realize the device, attach it to its linked bridge and patch it to its peer
    pub fn create(
        &mut self,
        run: &RunContext,
        net: &NetContext,
        bridges: &mut BTreeMap<String, Bridge>,
    ) -> Result<()> {
        let backend = run.backend();
        let device = self.device(run, net);

        match self.kind {
            InterfaceKind::Veth => self.create_veth(run, net, &device)?,
            InterfaceKind::Dummy => {
                backend.apply(&NetOp::DummyAdd {
                    ctx: net.clone(),
                    name: device.clone(),
                })?;
            }
            InterfaceKind::Tap => {
                backend.apply(&NetOp::TapAdd {
                    ctx: net.clone(),
                    name: device.clone(),
                })?;
            }
        }
        run.record(Resource::Link {
            ctx: net.clone(),
            name: device.clone(),
        });
        self.realized = true;

        if let Some(mac) = &self.mac_address {
            backend.apply(&NetOp::LinkSetAddress {
                ctx: net.clone(),
                name: device.clone(),
                mac: mac.clone(),
            })?;
        }

        if let Some(bridge_name) = &self.linked_bridge {
            let bridge = bridges
                .get_mut(bridge_name)
                .ok_or_else(|| Error::BridgeNotFound {
                    host: self.host.clone(),
                    bridge: bridge_name.clone(),
                })?;
            bridge.link_interface(run, net, self)?;
        }

        backend.apply(&NetOp::LinkSetUp {
            ctx: net.clone(),
            name: device,
            up: true,
        })?;

        if self.peer.is_some() {
            patch::join(run, self)?;
        }

        tracing::debug!(host = %self.host, interface = %self.name, kind = %self.kind, "interface up");
        Ok(())
    }

    /// Create the veth pair with the visible end in `net` and the stub in root
    fn create_veth(&self, run: &RunContext, net: &NetContext, device: &str) -> Result<()> {
        let backend = run.backend();
        let stub = run.scope().stub(self.serial);

        match net {
            NetContext::Root => {
                backend.apply(&NetOp::VethAdd {
                    ctx: NetContext::Root,
                    name: device.to_string(),
                    peer: stub.clone(),
                })?;
                run.record(Resource::Link {
                    ctx: NetContext::Root,
                    name: stub.clone(),
                });
            }
            NetContext::Namespace(ns) => {
                // Built in root under a temporary name, then moved and renamed
                let temp = run.scope().temp(self.serial);
                backend.apply(&NetOp::VethAdd {
                    ctx: NetContext::Root,
                    name: temp.clone(),
                    peer: stub.clone(),
                })?;
                run.record(Resource::Link {
                    ctx: NetContext::Root,
                    name: stub.clone(),
                });
                backend.apply(&NetOp::LinkSetNetns {
                    ctx: NetContext::Root,
                    name: temp.clone(),
                    netns: ns.clone(),
                })?;
                backend.apply(&NetOp::LinkRename {
                    ctx: net.clone(),
                    name: temp,
                    new_name: device.to_string(),
                })?;
            }
        }

        backend.apply(&NetOp::LinkSetUp {
            ctx: NetContext::Root,
            name: stub,
            up: true,
        })
    }

    /// Assign addresses, then routes
    pub fn finalize(&self, run: &RunContext, net: &NetContext) -> Result<()> {
        let backend = run.backend();
        let device = self.device(run, net);

        for addr in &self.addresses {
            backend.apply(&NetOp::AddrAdd {
                ctx: net.clone(),
                dev: device.clone(),
                addr: *addr,
            })?;
        }
        for route in &self.routes {
            backend.apply(&NetOp::RouteAdd {
                ctx: net.clone(),
                dev: device.clone(),
                route: route.clone(),
            })?;
        }
        Ok(())
    }

    /// Remove routes and addresses, leave the bridge, bring the link down
    pub fn down(
        &self,
        run: &RunContext,
        net: &NetContext,
        bridges: &mut BTreeMap<String, Bridge>,
    ) -> Result<()> {
        if !self.realized {
            return Ok(());
        }
        let backend = run.backend();
        let device = self.device(run, net);

        for route in self.routes.iter().rev() {
            backend.apply(&NetOp::RouteDel {
                ctx: net.clone(),
                dev: device.clone(),
                route: route.clone(),
            })?;
        }
        for addr in self.addresses.iter().rev() {
            backend.apply(&NetOp::AddrDel {
                ctx: net.clone(),
                dev: device.clone(),
                addr: *addr,
            })?;
        }

        if let Some(bridge) = self.linked_bridge.as_ref().and_then(|b| bridges.get_mut(b)) {
            bridge.unlink_interface(run, net, self)?;
        }

        backend.apply(&NetOp::LinkSetUp {
            ctx: net.clone(),
            name: device,
            up: false,
        })
    }

    /// Remove the device (and with it the hidden stub)
    ///
    /// Only this interface's own objects are destroyed. A peered interface on
    /// another host keeps its device; the shared patch bridge goes away once
    /// its last member is gone.
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
        run.forget(&Resource::Link {
            ctx: net.clone(),
            name: device,
        });
        if let Some(stub) = self.stub(run) {
            run.forget(&Resource::Link {
                ctx: NetContext::Root,
                name: stub,
            });
        }
        self.realized = false;

        if self.peer.is_some() {
            patch::release(run, self)?;
        }
        Ok(())
    }
}
