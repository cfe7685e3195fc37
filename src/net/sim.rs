//! In-memory model of the kernel's network state
//!
//! `SimKernel` implements [`NetBackend`] without touching the host. It keeps
//! enough of the kernel's rules to catch ordering mistakes: veth ends die
//! together, deleting a namespace destroys everything inside it, bridge ports
//! must be enslaved to an existing bridge in the same context, and routes
//! need a live device with a reachable gateway. Every operation is journaled,
//! which is what `ptm-ctl startup --dry-run` prints.

use crate::error::{Error, Result};
use crate::exec::{self, CommandOutput};
use crate::net::{NetBackend, NetContext, NetOp, Route};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Kind of a simulated link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Loopback,
    Veth,
    Dummy,
    Tap,
    Bridge,
}

/// A simulated link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLink {
    pub kind: LinkKind,
    pub up: bool,
    pub master: Option<String>,
    pub addresses: BTreeSet<IpNet>,
    pub mac: Option<String>,
    /// Other end of a veth pair
    pub peer: Option<(NetContext, String)>,
}

impl SimLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            up: false,
            master: None,
            addresses: BTreeSet::new(),
            mac: None,
            peer: None,
        }
    }
}

type LinkKey = (NetContext, String);

/// Comparable view of OS-visible state (journal excluded)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSnapshot {
    pub namespaces: BTreeSet<String>,
    pub links: BTreeMap<LinkKey, SimLink>,
    pub routes: BTreeSet<(NetContext, String, Route)>,
}

#[derive(Debug)]
struct SimState {
    namespaces: BTreeSet<String>,
    links: BTreeMap<LinkKey, SimLink>,
    routes: BTreeSet<(NetContext, String, Route)>,
    journal: Vec<String>,
    failures: Vec<String>,
}

impl Default for SimState {
    fn default() -> Self {
        let mut links = BTreeMap::new();
        links.insert(
            (NetContext::Root, "lo".to_string()),
            SimLink {
                up: true,
                ..SimLink::new(LinkKind::Loopback)
            },
        );
        Self {
            namespaces: BTreeSet::new(),
            links,
            routes: BTreeSet::new(),
            journal: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Simulated kernel backend
#[derive(Debug, Default)]
pub struct SimKernel {
    state: Mutex<SimState>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every operation whose command line contains `pattern` fail
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.lock().failures.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Command lines of every operation attempted so far
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    /// Link names in a context
    pub fn links(&self, ctx: &NetContext) -> Vec<String> {
        self.lock()
            .links
            .keys()
            .filter(|(c, _)| c == ctx)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn link(&self, ctx: &NetContext, name: &str) -> Option<SimLink> {
        self.lock()
            .links
            .get(&(ctx.clone(), name.to_string()))
            .cloned()
    }

    /// Routes in a context as (device, route)
    pub fn routes(&self, ctx: &NetContext) -> Vec<(String, Route)> {
        self.lock()
            .routes
            .iter()
            .filter(|(c, _, _)| c == ctx)
            .map(|(_, dev, route)| (dev.clone(), route.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> SimSnapshot {
        let state = self.lock();
        SimSnapshot {
            namespaces: state.namespaces.clone(),
            links: state.links.clone(),
            routes: state.routes.clone(),
        }
    }
}

fn failed(command: &str, message: impl Into<String>) -> Error {
    Error::CommandFailed {
        command: command.to_string(),
        message: message.into(),
    }
}

impl SimState {
    fn check_injected(&self, command: &str) -> Result<()> {
        if self.failures.iter().any(|p| command.contains(p.as_str())) {
            return Err(failed(command, "injected failure"));
        }
        Ok(())
    }

    fn check_ctx(&self, command: &str, ctx: &NetContext) -> Result<()> {
        match ctx.namespace() {
            Some(ns) if !self.namespaces.contains(ns) => Err(failed(
                command,
                format!("Cannot open network namespace \"{}\": No such file or directory", ns),
            )),
            _ => Ok(()),
        }
    }

    fn key(ctx: &NetContext, name: &str) -> LinkKey {
        (ctx.clone(), name.to_string())
    }

    fn link_mut(&mut self, command: &str, ctx: &NetContext, name: &str) -> Result<&mut SimLink> {
        self.links
            .get_mut(&Self::key(ctx, name))
            .ok_or_else(|| failed(command, format!("Cannot find device \"{}\"", name)))
    }

    fn insert_new(&mut self, command: &str, ctx: &NetContext, name: &str, link: SimLink) -> Result<()> {
        let key = Self::key(ctx, name);
        if self.links.contains_key(&key) {
            return Err(failed(command, "RTNETLINK answers: File exists"));
        }
        self.links.insert(key, link);
        Ok(())
    }

    /// Remove a link along with whatever the kernel removes with it
    fn remove_link(&mut self, key: &LinkKey) {
        let Some(link) = self.links.remove(key) else {
            return;
        };
        let (ctx, name) = key;

        self.routes.retain(|(c, dev, _)| !(c == ctx && dev == name));

        if link.kind == LinkKind::Bridge {
            for (k, member) in self.links.iter_mut() {
                if &k.0 == ctx && member.master.as_deref() == Some(name.as_str()) {
                    member.master = None;
                }
            }
        }

        if let Some(peer) = link.peer {
            self.remove_link(&peer);
        }
    }

    /// Move a link to a new key, keeping its veth peer pointing at it
    fn rekey(&mut self, from: &LinkKey, to: LinkKey, command: &str) -> Result<()> {
        if self.links.contains_key(&to) {
            return Err(failed(command, "RTNETLINK answers: File exists"));
        }
        let mut link = self
            .links
            .remove(from)
            .ok_or_else(|| failed(command, format!("Cannot find device \"{}\"", from.1)))?;

        if let Some(peer_key) = &link.peer {
            if let Some(peer) = self.links.get_mut(peer_key) {
                peer.peer = Some(to.clone());
            }
        }
        self.routes.retain(|(c, dev, _)| !(c == &from.0 && dev == &from.1));

        if from.0 != to.0 {
            // Moving across namespaces resets the device
            link.up = false;
            link.master = None;
            link.addresses.clear();
        }
        self.links.insert(to, link);
        Ok(())
    }

    fn apply(&mut self, op: &NetOp) -> Result<()> {
        let command = op.to_string();
        self.journal.push(command.clone());
        self.check_injected(&command)?;
        if let Some(ctx) = op.context() {
            self.check_ctx(&command, ctx)?;
        }

        match op {
            NetOp::NetnsAdd { name } => {
                if !self.namespaces.insert(name.clone()) {
                    return Err(failed(
                        &command,
                        format!("Cannot create namespace file \"/var/run/netns/{}\": File exists", name),
                    ));
                }
                let ctx = NetContext::Namespace(name.clone());
                self.links
                    .insert(Self::key(&ctx, "lo"), SimLink::new(LinkKind::Loopback));
            }
            NetOp::NetnsDel { name } => {
                if !self.namespaces.remove(name) {
                    return Err(failed(
                        &command,
                        format!("Cannot remove namespace file \"/var/run/netns/{}\": No such file or directory", name),
                    ));
                }
                let inside: Vec<LinkKey> = self
                    .links
                    .keys()
                    .filter(|(c, _)| c.namespace() == Some(name.as_str()))
                    .cloned()
                    .collect();
                for key in inside {
                    self.remove_link(&key);
                }
                self.routes
                    .retain(|(c, _, _)| c.namespace() != Some(name.as_str()));
            }
            NetOp::VethAdd { ctx, name, peer } => {
                if name == peer {
                    return Err(failed(&command, "RTNETLINK answers: File exists"));
                }
                if self.links.contains_key(&Self::key(ctx, peer)) {
                    return Err(failed(&command, "RTNETLINK answers: File exists"));
                }
                self.insert_new(
                    &command,
                    ctx,
                    name,
                    SimLink {
                        peer: Some(Self::key(ctx, peer)),
                        ..SimLink::new(LinkKind::Veth)
                    },
                )?;
                self.links.insert(
                    Self::key(ctx, peer),
                    SimLink {
                        peer: Some(Self::key(ctx, name)),
                        ..SimLink::new(LinkKind::Veth)
                    },
                );
            }
            NetOp::DummyAdd { ctx, name } => {
                self.insert_new(&command, ctx, name, SimLink::new(LinkKind::Dummy))?;
            }
            NetOp::TapAdd { ctx, name } => {
                self.insert_new(&command, ctx, name, SimLink::new(LinkKind::Tap))?;
            }
            NetOp::BridgeAdd { ctx, name } => {
                self.insert_new(&command, ctx, name, SimLink::new(LinkKind::Bridge))?;
            }
            NetOp::LinkDel { ctx, name } => {
                let key = Self::key(ctx, name);
                if !self.links.contains_key(&key) {
                    return Err(failed(&command, format!("Cannot find device \"{}\"", name)));
                }
                self.remove_link(&key);
            }
            NetOp::LinkSetUp { ctx, name, up } => {
                let link = self.link_mut(&command, ctx, name)?;
                link.up = *up;
                if !*up {
                    let dev = name.clone();
                    let ctx = ctx.clone();
                    self.routes.retain(|(c, d, _)| !(c == &ctx && d == &dev));
                }
            }
            NetOp::LinkSetNetns { ctx, name, netns } => {
                if !self.namespaces.contains(netns) {
                    return Err(failed(
                        &command,
                        format!("Invalid \"netns\" value \"{}\"", netns),
                    ));
                }
                let from = Self::key(ctx, name);
                let to = Self::key(&NetContext::Namespace(netns.clone()), name);
                self.rekey(&from, to, &command)?;
            }
            NetOp::LinkRename { ctx, name, new_name } => {
                let from = Self::key(ctx, name);
                let to = Self::key(ctx, new_name);
                self.rekey(&from, to, &command)?;
            }
            NetOp::LinkSetMaster { ctx, name, master } => {
                if let Some(master) = master {
                    match self.links.get(&Self::key(ctx, master)) {
                        Some(l) if l.kind == LinkKind::Bridge => {}
                        Some(_) => {
                            return Err(failed(
                                &command,
                                "RTNETLINK answers: Operation not supported",
                            ));
                        }
                        None => {
                            return Err(failed(
                                &command,
                                format!("Device does not exist: \"{}\"", master),
                            ));
                        }
                    }
                }
                let link = self.link_mut(&command, ctx, name)?;
                link.master = master.clone();
            }
            NetOp::LinkSetAddress { ctx, name, mac } => {
                let link = self.link_mut(&command, ctx, name)?;
                link.mac = Some(mac.clone());
            }
            NetOp::AddrAdd { ctx, dev, addr } => {
                let link = self.link_mut(&command, ctx, dev)?;
                if !link.addresses.insert(*addr) {
                    return Err(failed(&command, "RTNETLINK answers: File exists"));
                }
            }
            NetOp::AddrDel { ctx, dev, addr } => {
                let link = self.link_mut(&command, ctx, dev)?;
                if !link.addresses.remove(addr) {
                    return Err(failed(
                        &command,
                        "RTNETLINK answers: Cannot assign requested address",
                    ));
                }
            }
            NetOp::RouteAdd { ctx, dev, route } => {
                let link = self.link_mut(&command, ctx, dev)?;
                if !link.up {
                    return Err(failed(&command, "RTNETLINK answers: Network is down"));
                }
                if let Some(gw) = route.gateway {
                    if !link.addresses.iter().any(|net| net.contains(&gw)) {
                        return Err(failed(
                            &command,
                            "RTNETLINK answers: Nexthop has invalid gateway",
                        ));
                    }
                }
                if !self
                    .routes
                    .insert((ctx.clone(), dev.clone(), route.clone()))
                {
                    return Err(failed(&command, "RTNETLINK answers: File exists"));
                }
            }
            NetOp::RouteDel { ctx, dev, route } => {
                if !self
                    .routes
                    .remove(&(ctx.clone(), dev.clone(), route.clone()))
                {
                    return Err(failed(&command, "RTNETLINK answers: No such process"));
                }
            }
        }
        Ok(())
    }
}

impl NetBackend for SimKernel {
    fn apply(&self, op: &NetOp) -> Result<()> {
        tracing::debug!(command = %op, "sim");
        self.lock().apply(op)
    }

    fn netns_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().namespaces.contains(name))
    }

    fn link_exists(&self, ctx: &NetContext, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .links
            .contains_key(&(ctx.clone(), name.to_string())))
    }

    fn bridge_members(&self, ctx: &NetContext, bridge: &str) -> Result<Vec<String>> {
        let state = self.lock();
        match state.links.get(&(ctx.clone(), bridge.to_string())) {
            Some(l) if l.kind == LinkKind::Bridge => {}
            _ => return Err(Error::LinkNotFound(bridge.to_string())),
        }
        Ok(state
            .links
            .iter()
            .filter(|((c, _), l)| c == ctx && l.master.as_deref() == Some(bridge))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    fn link_addresses(&self, ctx: &NetContext, name: &str) -> Result<Vec<IpNet>> {
        self.lock()
            .links
            .get(&(ctx.clone(), name.to_string()))
            .map(|l| l.addresses.iter().copied().collect())
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))
    }

    fn exec(
        &self,
        ctx: &NetContext,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        let command = match ctx.namespace() {
            Some(ns) => {
                let mut full = vec!["netns".to_string(), "exec".to_string(), ns.to_string()];
                full.push(program.to_string());
                full.extend(args.iter().cloned());
                exec::render("ip", &full)
            }
            None => exec::render(program, args),
        };

        let mut state = self.lock();
        state.journal.push(command.clone());
        state.check_ctx(&command, ctx)?;
        if state.check_injected(&command).is_err() {
            // Injected failures look like the program exiting non-zero
            return Ok(CommandOutput {
                success: false,
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(CommandOutput::ok(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(name: &str) -> NetContext {
        NetContext::Namespace(name.to_string())
    }

    fn veth(ctx: NetContext, name: &str, peer: &str) -> NetOp {
        NetOp::VethAdd {
            ctx,
            name: name.into(),
            peer: peer.into(),
        }
    }

    #[test]
    fn test_namespace_gets_loopback() {
        let k = SimKernel::new();
        k.apply(&NetOp::NetnsAdd { name: "zoo1".into() }).unwrap();
        assert_eq!(k.links(&ns("zoo1")), vec!["lo".to_string()]);
        assert!(k.apply(&NetOp::NetnsAdd { name: "zoo1".into() }).is_err());
    }

    #[test]
    fn test_veth_ends_die_together() {
        let k = SimKernel::new();
        k.apply(&veth(NetContext::Root, "a", "b")).unwrap();
        k.apply(&NetOp::LinkDel {
            ctx: NetContext::Root,
            name: "b".into(),
        })
        .unwrap();
        assert!(!k.link_exists(&NetContext::Root, "a").unwrap());
    }

    #[test]
    fn test_namespace_delete_takes_moved_veth_peer() {
        let k = SimKernel::new();
        k.apply(&NetOp::NetnsAdd { name: "h".into() }).unwrap();
        k.apply(&veth(NetContext::Root, "t0", "stub")).unwrap();
        k.apply(&NetOp::LinkSetNetns {
            ctx: NetContext::Root,
            name: "t0".into(),
            netns: "h".into(),
        })
        .unwrap();
        k.apply(&NetOp::LinkRename {
            ctx: ns("h"),
            name: "t0".into(),
            new_name: "eth0".into(),
        })
        .unwrap();

        let stub = k.link(&NetContext::Root, "stub").unwrap();
        assert_eq!(stub.peer, Some((ns("h"), "eth0".to_string())));

        k.apply(&NetOp::NetnsDel { name: "h".into() }).unwrap();
        assert!(!k.link_exists(&NetContext::Root, "stub").unwrap());
    }

    #[test]
    fn test_enslave_requires_bridge() {
        let k = SimKernel::new();
        k.apply(&NetOp::DummyAdd {
            ctx: NetContext::Root,
            name: "d0".into(),
        })
        .unwrap();
        let attach = NetOp::LinkSetMaster {
            ctx: NetContext::Root,
            name: "d0".into(),
            master: Some("br0".into()),
        };
        assert!(k.apply(&attach).is_err());

        k.apply(&NetOp::BridgeAdd {
            ctx: NetContext::Root,
            name: "br0".into(),
        })
        .unwrap();
        k.apply(&attach).unwrap();
        assert_eq!(
            k.bridge_members(&NetContext::Root, "br0").unwrap(),
            vec!["d0".to_string()]
        );

        k.apply(&NetOp::LinkDel {
            ctx: NetContext::Root,
            name: "br0".into(),
        })
        .unwrap();
        assert_eq!(k.link(&NetContext::Root, "d0").unwrap().master, None);
    }

    #[test]
    fn test_route_needs_reachable_gateway() {
        let k = SimKernel::new();
        let root = NetContext::Root;
        k.apply(&NetOp::DummyAdd {
            ctx: root.clone(),
            name: "d0".into(),
        })
        .unwrap();
        k.apply(&NetOp::LinkSetUp {
            ctx: root.clone(),
            name: "d0".into(),
            up: true,
        })
        .unwrap();

        let route = Route {
            destination: "default".parse().unwrap(),
            gateway: Some("10.0.0.1".parse().unwrap()),
        };
        let add = NetOp::RouteAdd {
            ctx: root.clone(),
            dev: "d0".into(),
            route,
        };
        assert!(k.apply(&add).is_err());

        k.apply(&NetOp::AddrAdd {
            ctx: root.clone(),
            dev: "d0".into(),
            addr: "10.0.0.2/24".parse().unwrap(),
        })
        .unwrap();
        k.apply(&add).unwrap();
        assert_eq!(k.routes(&root).len(), 1);
    }

    #[test]
    fn test_missing_namespace_context_fails() {
        let k = SimKernel::new();
        let err = k
            .apply(&NetOp::DummyAdd {
                ctx: ns("nope"),
                name: "d0".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_failure_injection_is_journaled() {
        let k = SimKernel::new();
        k.fail_on("netns add bad");
        assert!(k.apply(&NetOp::NetnsAdd { name: "bad".into() }).is_err());
        assert!(k.namespaces().is_empty());
        assert_eq!(k.journal(), vec!["ip netns add bad".to_string()]);

        k.clear_failures();
        k.apply(&NetOp::NetnsAdd { name: "bad".into() }).unwrap();
    }

    #[test]
    fn test_exec_in_namespace() {
        let k = SimKernel::new();
        k.apply(&NetOp::NetnsAdd { name: "h".into() }).unwrap();
        k.exec(&ns("h"), "true", &[], Duration::from_secs(1)).unwrap();
        assert!(k.exec(&ns("x"), "true", &[], Duration::from_secs(1)).is_err());
        assert!(k.journal().contains(&"ip netns exec h true".to_string()));

        k.fail_on("exec h false");
        let out = k.exec(&ns("h"), "false", &[], Duration::from_secs(1)).unwrap();
        assert!(!out.success);
    }
}
