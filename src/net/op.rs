//! Network operations and their iproute2 rendering

use crate::error::{Error, Result};
use crate::net::NetContext;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Route destination: the default route or a prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RouteDestination {
    Default,
    Prefix(IpNet),
}

impl FromStr for RouteDestination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "default" {
            return Ok(RouteDestination::Default);
        }
        s.parse::<IpNet>()
            .map(RouteDestination::Prefix)
            .map_err(|e| Error::ConfigValidation(format!("Invalid route destination '{}': {}", s, e)))
    }
}

impl TryFrom<String> for RouteDestination {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RouteDestination> for String {
    fn from(dest: RouteDestination) -> Self {
        dest.to_string()
    }
}

impl fmt::Display for RouteDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDestination::Default => write!(f, "default"),
            RouteDestination::Prefix(net) => write!(f, "{}", net),
        }
    }
}

/// A static route bound to an interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    /// "default" or a CIDR prefix
    pub destination: RouteDestination,
    /// Next hop, if any
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl Route {
    fn args(&self, dev: &str) -> Vec<String> {
        let mut args = vec![self.destination.to_string()];
        if let Some(gw) = self.gateway {
            args.push("via".into());
            args.push(gw.to_string());
        }
        args.push("dev".into());
        args.push(dev.to_string());
        args
    }
}

/// A single mutating operation against the kernel's network state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetOp {
    NetnsAdd { name: String },
    NetnsDel { name: String },
    VethAdd { ctx: NetContext, name: String, peer: String },
    DummyAdd { ctx: NetContext, name: String },
    TapAdd { ctx: NetContext, name: String },
    BridgeAdd { ctx: NetContext, name: String },
    LinkDel { ctx: NetContext, name: String },
    LinkSetUp { ctx: NetContext, name: String, up: bool },
    LinkSetNetns { ctx: NetContext, name: String, netns: String },
    LinkRename { ctx: NetContext, name: String, new_name: String },
    LinkSetMaster { ctx: NetContext, name: String, master: Option<String> },
    LinkSetAddress { ctx: NetContext, name: String, mac: String },
    AddrAdd { ctx: NetContext, dev: String, addr: IpNet },
    AddrDel { ctx: NetContext, dev: String, addr: IpNet },
    RouteAdd { ctx: NetContext, dev: String, route: Route },
    RouteDel { ctx: NetContext, dev: String, route: Route },
}

impl NetOp {
    /// Context the operation runs in (`None` for namespace table operations)
    pub fn context(&self) -> Option<&NetContext> {
        match self {
            NetOp::NetnsAdd { .. } | NetOp::NetnsDel { .. } => None,
            NetOp::VethAdd { ctx, .. }
            | NetOp::DummyAdd { ctx, .. }
            | NetOp::TapAdd { ctx, .. }
            | NetOp::BridgeAdd { ctx, .. }
            | NetOp::LinkDel { ctx, .. }
            | NetOp::LinkSetUp { ctx, .. }
            | NetOp::LinkSetNetns { ctx, .. }
            | NetOp::LinkRename { ctx, .. }
            | NetOp::LinkSetMaster { ctx, .. }
            | NetOp::LinkSetAddress { ctx, .. }
            | NetOp::AddrAdd { ctx, .. }
            | NetOp::AddrDel { ctx, .. }
            | NetOp::RouteAdd { ctx, .. }
            | NetOp::RouteDel { ctx, .. } => Some(ctx),
        }
    }

    /// Arguments for the `ip` binary
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if let Some(NetContext::Namespace(ns)) = self.context() {
            args.push("-n".into());
            args.push(ns.clone());
        }

        let tail: Vec<String> = match self {
            NetOp::NetnsAdd { name } => strings(&["netns", "add", name]),
            NetOp::NetnsDel { name } => strings(&["netns", "del", name]),
            NetOp::VethAdd { name, peer, .. } => {
                strings(&["link", "add", name, "type", "veth", "peer", "name", peer])
            }
            NetOp::DummyAdd { name, .. } => strings(&["link", "add", name, "type", "dummy"]),
            NetOp::TapAdd { name, .. } => strings(&["tuntap", "add", "dev", name, "mode", "tap"]),
            NetOp::BridgeAdd { name, .. } => strings(&["link", "add", name, "type", "bridge"]),
            NetOp::LinkDel { name, .. } => strings(&["link", "del", name]),
            NetOp::LinkSetUp { name, up, .. } => {
                strings(&["link", "set", name, if *up { "up" } else { "down" }])
            }
            NetOp::LinkSetNetns { name, netns, .. } => {
                strings(&["link", "set", name, "netns", netns])
            }
            NetOp::LinkRename { name, new_name, .. } => {
                strings(&["link", "set", name, "name", new_name])
            }
            NetOp::LinkSetMaster { name, master, .. } => match master {
                Some(master) => strings(&["link", "set", name, "master", master]),
                None => strings(&["link", "set", name, "nomaster"]),
            },
            NetOp::LinkSetAddress { name, mac, .. } => {
                strings(&["link", "set", name, "address", mac])
            }
            NetOp::AddrAdd { dev, addr, .. } => {
                strings(&["addr", "add", &addr.to_string(), "dev", dev])
            }
            NetOp::AddrDel { dev, addr, .. } => {
                strings(&["addr", "del", &addr.to_string(), "dev", dev])
            }
            NetOp::RouteAdd { dev, route, .. } => {
                let mut v = strings(&["route", "add"]);
                v.extend(route.args(dev));
                v
            }
            NetOp::RouteDel { dev, route, .. } => {
                let mut v = strings(&["route", "del"]);
                v.extend(route.args(dev));
                v
            }
        };

        args.extend(tail);
        args
    }
}

impl fmt::Display for NetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::exec::render("ip", &self.args()))
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(name: &str) -> NetContext {
        NetContext::Namespace(name.to_string())
    }

    #[test]
    fn test_render_netns_ops() {
        let op = NetOp::NetnsAdd { name: "zoo1".into() };
        assert_eq!(op.to_string(), "ip netns add zoo1");
        assert!(op.context().is_none());
    }

    #[test]
    fn test_render_namespaced_op() {
        let op = NetOp::DummyAdd {
            ctx: ns("zoo1"),
            name: "eth0".into(),
        };
        assert_eq!(op.to_string(), "ip -n zoo1 link add eth0 type dummy");
    }

    #[test]
    fn test_render_veth_and_master() {
        let op = NetOp::VethAdd {
            ctx: NetContext::Root,
            name: "testi".into(),
            peer: "v1a2b-0".into(),
        };
        assert_eq!(op.to_string(), "ip link add testi type veth peer name v1a2b-0");

        let op = NetOp::LinkSetMaster {
            ctx: NetContext::Root,
            name: "testi".into(),
            master: None,
        };
        assert_eq!(op.to_string(), "ip link set testi nomaster");
    }

    #[test]
    fn test_render_route() {
        let route = Route {
            destination: "default".parse().unwrap(),
            gateway: Some("10.0.0.1".parse().unwrap()),
        };
        let op = NetOp::RouteAdd {
            ctx: ns("h1"),
            dev: "eth0".into(),
            route,
        };
        assert_eq!(
            op.to_string(),
            "ip -n h1 route add default via 10.0.0.1 dev eth0"
        );
    }

    #[test]
    fn test_route_destination_parse() {
        assert_eq!(
            "default".parse::<RouteDestination>().unwrap(),
            RouteDestination::Default
        );
        assert!(matches!(
            "10.1.0.0/16".parse::<RouteDestination>().unwrap(),
            RouteDestination::Prefix(_)
        ));
        assert!("nonsense".parse::<RouteDestination>().is_err());
    }

    #[test]
    fn test_route_deserialize() {
        let route: Route = toml::from_str(
            r#"
destination = "172.16.0.0/12"
gateway = "10.0.0.254"
"#,
        )
        .unwrap();
        assert_eq!(route.destination.to_string(), "172.16.0.0/12");
        assert_eq!(route.gateway, Some("10.0.0.254".parse().unwrap()));
    }
}
