//! Topology description parsing for PTM
//!
//! Parses topology files (TOML by default, JSON when the file ends in
//! `.json`) using serde, then normalizes and validates them.

use crate::error::{Error, Result};
use crate::net::Route;
use crate::net::naming::validate_ifname;
use crate::topology::{InterfaceKind, PeerRef};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Load a topology description from a file
pub fn load(path: &Path) -> Result<TopologyConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let mut config: TopologyConfig = if is_json {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    };

    config.normalize()?;
    config.validate()?;

    Ok(config)
}

/// Root of a topology description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Global settings
    #[serde(default)]
    pub config: GlobalConfig,

    /// Host definitions, in declaration order
    #[serde(default)]
    pub hosts: Vec<HostDef>,
}

impl FromStr for TopologyConfig {
    type Err = Error;

    /// Parse and validate a TOML description
    fn from_str(s: &str) -> Result<Self> {
        let mut config: TopologyConfig = toml::from_str(s)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }
}

impl TopologyConfig {
    pub fn get_host(&self, name: &str) -> Option<&HostDef> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Mirror one-sided peer declarations onto the other end
    ///
    /// Conflicting declarations are left for [`validate`](Self::validate).
    pub fn normalize(&mut self) -> Result<()> {
        let index: HashMap<String, usize> = self
            .hosts
            .iter()
            .enumerate()
            .map(|(i, h)| (h.name.clone(), i))
            .collect();

        let mut mirrors = Vec::new();
        for host in &self.hosts {
            for iface in &host.interfaces {
                if let Some(peer) = &iface.peer {
                    mirrors.push((
                        peer.clone(),
                        PeerRef::new(host.name.clone(), iface.name.clone()),
                    ));
                }
            }
        }

        for (target, back) in mirrors {
            let Some(&hi) = index.get(&target.host) else {
                continue;
            };
            if let Some(remote) = self.hosts[hi]
                .interfaces
                .iter_mut()
                .find(|i| i.name == target.interface)
            {
                if remote.peer.is_none() {
                    remote.peer = Some(back);
                }
            }
        }
        Ok(())
    }

    /// Validate the description
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;

        // Check for duplicate host names
        let mut names = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() || host.name.chars().any(|c| c.is_whitespace() || c == '/') {
                return Err(Error::ConfigValidation(format!(
                    "Invalid host name '{}'",
                    host.name
                )));
            }
            if !names.insert(host.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate host name: {}",
                    host.name
                )));
            }
        }

        for host in &self.hosts {
            // Check that all dependencies exist
            for dep in &host.depends_on {
                if dep == &host.name {
                    return Err(Error::ConfigValidation(format!(
                        "Host '{}' depends on itself",
                        host.name
                    )));
                }
                if !names.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        host: host.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            if let Some(hv) = &host.hypervisor {
                if hv == &host.name || !names.contains(hv.as_str()) {
                    return Err(Error::ConfigValidation(format!(
                        "Host '{}' names unknown hypervisor '{}'",
                        host.name, hv
                    )));
                }
            }

            host.validate()?;
        }

        self.validate_peers()
    }

    /// Every peer must point at an existing interface on another host that
    /// points back
    fn validate_peers(&self) -> Result<()> {
        for host in &self.hosts {
            for iface in &host.interfaces {
                let Some(peer) = &iface.peer else {
                    continue;
                };
                if peer.host == host.name {
                    return Err(Error::ConfigValidation(format!(
                        "Interface '{}/{}' cannot peer with its own host",
                        host.name, iface.name
                    )));
                }
                let remote = self
                    .get_host(&peer.host)
                    .and_then(|h| h.get_interface(&peer.interface))
                    .ok_or_else(|| {
                        Error::ConfigValidation(format!(
                            "Interface '{}/{}' peers with unknown interface '{}'",
                            host.name, iface.name, peer
                        ))
                    })?;

                let back = PeerRef::new(host.name.clone(), iface.name.clone());
                if remote.peer.as_ref() != Some(&back) {
                    return Err(Error::ConfigValidation(format!(
                        "Asymmetric peer: '{}' -> '{}' but '{}' -> '{}'",
                        back,
                        peer,
                        peer,
                        remote
                            .peer
                            .as_ref()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "none".to_string())
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Prefix applied to namespace names and root-context device names
    #[serde(default)]
    pub prefix: String,

    /// Run id carried by hidden objects; random when unset
    pub run_id: Option<String>,

    /// Concurrent host operations per phase
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Upper bound in seconds for every spawned command
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Where run state is persisted between `startup` and `shutdown`
    pub state_file: Option<PathBuf>,
}

fn default_workers() -> usize {
    1
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            run_id: None,
            workers: default_workers(),
            command_timeout: default_command_timeout(),
            state_file: None,
        }
    }
}

impl GlobalConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigValidation("workers must be at least 1".into()));
        }
        if self.command_timeout == 0 {
            return Err(Error::ConfigValidation(
                "command_timeout must be at least 1 second".into(),
            ));
        }
        Ok(())
    }
}

fn default_implementation() -> String {
    "netns".to_string()
}

/// A host definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDef {
    /// Unique host name
    pub name: String,

    /// Registry id of the host implementation
    #[serde(default = "default_implementation")]
    pub implementation: String,

    /// Hosts that must be started before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Hypervisor host (VM hosts only)
    pub hypervisor: Option<String>,

    #[serde(default)]
    pub bridges: Vec<BridgeDef>,

    #[serde(default)]
    pub interfaces: Vec<InterfaceDef>,

    #[serde(default)]
    pub applications: Vec<ApplicationDef>,
}

impl HostDef {
    pub fn get_interface(&self, name: &str) -> Option<&InterfaceDef> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn get_bridge(&self, name: &str) -> Option<&BridgeDef> {
        self.bridges.iter().find(|b| b.name == name)
    }

    fn validate(&self) -> Result<()> {
        let mut bridges = HashSet::new();
        for bridge in &self.bridges {
            validate_ifname(&bridge.name)?;
            if !bridges.insert(bridge.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate bridge '{}' on host '{}'",
                    bridge.name, self.name
                )));
            }
        }

        let mut interfaces = HashSet::new();
        for iface in &self.interfaces {
            validate_ifname(&iface.name)?;
            if iface.name == "lo" {
                return Err(Error::ConfigValidation(format!(
                    "Interface name 'lo' is reserved (host '{}')",
                    self.name
                )));
            }
            if !interfaces.insert(iface.name.as_str()) || bridges.contains(iface.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate device name '{}' on host '{}'",
                    iface.name, self.name
                )));
            }

            if let Some(bridge) = &iface.linked_bridge {
                if self.get_bridge(bridge).is_none() {
                    return Err(Error::ConfigValidation(format!(
                        "Interface '{}' on host '{}' links to bridge '{}' not owned by the host",
                        iface.name, self.name, bridge
                    )));
                }
            }

            if iface.peer.is_some() && iface.effective_kind() != InterfaceKind::Veth {
                return Err(Error::ConfigValidation(format!(
                    "Interface '{}' on host '{}' has a peer but is of kind {}",
                    iface.name,
                    self.name,
                    iface.effective_kind()
                )));
            }

            iface.parsed_addresses()?;
        }

        for app in &self.applications {
            if app.kind.trim().is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Application without kind on host '{}'",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// A bridge definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeDef {
    pub name: String,
}

/// An interface definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDef {
    pub name: String,

    /// Defaults to veth when a peer is set, dummy otherwise
    pub kind: Option<InterfaceKind>,

    /// CIDR addresses; a bare address gets a host prefix
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Same-host bridge this interface is a port of
    pub linked_bridge: Option<String>,

    pub mac_address: Option<String>,

    pub peer: Option<PeerRef>,

    #[serde(default)]
    pub routes: Vec<Route>,
}

impl InterfaceDef {
    pub fn effective_kind(&self) -> InterfaceKind {
        match (self.kind, &self.peer) {
            (Some(kind), _) => kind,
            (None, Some(_)) => InterfaceKind::Veth,
            (None, None) => InterfaceKind::Dummy,
        }
    }

    pub fn parsed_addresses(&self) -> Result<Vec<IpNet>> {
        self.addresses.iter().map(|a| parse_address(a)).collect()
    }
}

/// Parse "10.0.0.1/24" or a bare "10.0.0.1" (host prefix)
pub fn parse_address(s: &str) -> Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::ConfigValidation(format!("Invalid address '{}'", s)))
}

/// A resident application definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDef {
    /// Registry kind
    pub kind: String,

    /// Optional unique id
    pub id: Option<String>,

    /// Free-form settings handed to the application
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let config: TopologyConfig = r#"
[[hosts]]
name = "zoo1"

[[hosts.interfaces]]
name = "eth0"
"#
        .parse()
        .unwrap();

        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].implementation, "netns");
        assert_eq!(config.config.workers, 1);
        assert_eq!(config.config.command_timeout, 30);
        assert_eq!(
            config.hosts[0].interfaces[0].effective_kind(),
            InterfaceKind::Dummy
        );
    }

    #[test]
    fn test_parse_full_config() {
        let config: TopologyConfig = r#"
[config]
prefix = "t1-"
run_id = "ab12"
workers = 4

[[hosts]]
name = "root"
implementation = "root"

[[hosts.bridges]]
name = "br0"

[[hosts.interfaces]]
name = "zoo1eth0"
linked_bridge = "br0"
addresses = ["10.0.0.1/24"]

[[hosts]]
name = "zoo1"
depends_on = ["root"]

[[hosts.interfaces]]
name = "eth0"
addresses = ["10.0.0.2/24"]
mac_address = "02:00:00:00:00:01"
peer = { host = "root", interface = "zoo1eth0" }
routes = [{ destination = "default", gateway = "10.0.0.1" }]

[[hosts.applications]]
kind = "command"
id = "fwd"
hooks = [{ phase = "control_start", command = "true" }]
"#
        .parse()
        .unwrap();

        assert_eq!(config.config.prefix, "t1-");
        let zoo1 = config.get_host("zoo1").unwrap();
        assert_eq!(zoo1.interfaces[0].routes.len(), 1);
        assert!(zoo1.applications[0].settings.contains_key("hooks"));
        assert_eq!(zoo1.applications[0].id.as_deref(), Some("fwd"));

        // The root side got the mirrored peer
        let root_if = config.get_host("root").unwrap().get_interface("zoo1eth0").unwrap();
        assert_eq!(root_if.peer, Some(PeerRef::new("zoo1", "eth0")));
        assert_eq!(root_if.effective_kind(), InterfaceKind::Veth);
        assert!(config.get_host("root").unwrap().get_bridge("br0").is_some());
        assert!(zoo1.get_bridge("br0").is_none());
    }

    #[test]
    fn test_duplicate_name_error() {
        let result: Result<TopologyConfig> = r#"
[[hosts]]
name = "test"

[[hosts]]
name = "test"
"#
        .parse();
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_unknown_dependency_error() {
        let result: Result<TopologyConfig> = r#"
[[hosts]]
name = "web"
depends_on = ["nonexistent"]
"#
        .parse();
        assert!(matches!(result, Err(Error::UnknownDependency { .. })));
    }

    #[test]
    fn test_foreign_bridge_rejected() {
        let result: Result<TopologyConfig> = r#"
[[hosts]]
name = "a"
[[hosts.bridges]]
name = "br0"

[[hosts]]
name = "b"
[[hosts.interfaces]]
name = "eth0"
linked_bridge = "br0"
"#
        .parse();
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_asymmetric_peer_rejected() {
        let result: Result<TopologyConfig> = r#"
[[hosts]]
name = "a"
[[hosts.interfaces]]
name = "x"
peer = { host = "b", interface = "y" }

[[hosts]]
name = "b"
[[hosts.interfaces]]
name = "y"
peer = { host = "c", interface = "z" }

[[hosts]]
name = "c"
[[hosts.interfaces]]
name = "z"
"#
        .parse();
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_missing_peer_target_rejected() {
        let result: Result<TopologyConfig> = r#"
[[hosts]]
name = "a"
[[hosts.interfaces]]
name = "x"
peer = { host = "b", interface = "nope" }

[[hosts]]
name = "b"
"#
        .parse();
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_peered_dummy_rejected() {
        let result: Result<TopologyConfig> = r#"
[[hosts]]
name = "a"
[[hosts.interfaces]]
name = "x"
kind = "dummy"
peer = { host = "b", interface = "y" }

[[hosts]]
name = "b"
[[hosts.interfaces]]
name = "y"
"#
        .parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("192.168.1.1").unwrap().to_string(), "192.168.1.1/32");
        assert_eq!(parse_address("10.0.0.2/24").unwrap().prefix_len(), 24);
        assert!(parse_address("10.0.0.300").is_err());
    }

    #[test]
    fn test_load_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"hosts": [{{"name": "zoo1", "interfaces": [{{"name": "eth0", "addresses": ["10.0.0.2/24"]}}]}}]}}"#
        )
        .unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.hosts[0].name, "zoo1");
        assert_eq!(config.hosts[0].interfaces[0].addresses, vec!["10.0.0.2/24"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/topology.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
