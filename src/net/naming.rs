//! Per-run naming of OS-level objects
//!
//! The namespace table and the root link namespace are host-wide, so two
//! topologies started side by side must never pick the same names. Visible
//! names get the configured prefix; hidden objects (veth stubs, patch
//! bridges) always carry the run id, then `-`, then a hex serial. Run ids
//! are alphanumeric, so the separator keeps names from different runs apart.

use crate::error::{Error, Result};
use rand::Rng;

/// Kernel limit for interface names (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// Name scope for a single topology run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    prefix: String,
    run_id: String,
}

impl RunScope {
    /// Create a scope, generating a random run id if none is given
    pub fn new(prefix: impl Into<String>, run_id: Option<String>) -> Result<Self> {
        let run_id = match run_id {
            Some(id) => {
                if id.is_empty() || id.len() > 4 || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(Error::ConfigValidation(format!(
                        "run_id '{}' must be 1-4 alphanumeric characters",
                        id
                    )));
                }
                id.to_ascii_lowercase()
            }
            None => generate_run_id(),
        };

        let prefix = prefix.into();
        if prefix.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::ConfigValidation(format!(
                "prefix '{}' contains invalid characters",
                prefix
            )));
        }

        Ok(Self { prefix, run_id })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Namespace name for a host
    pub fn netns(&self, host: &str) -> String {
        format!("{}{}", self.prefix, host)
    }

    /// Device name for a visible object in the root context
    pub fn root_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Root-context stub end of an interface's veth pair
    pub fn stub(&self, serial: u32) -> String {
        format!("v{}-{:x}", self.run_id, serial)
    }

    /// Transient root-context name used before a device moves into its namespace
    pub fn temp(&self, serial: u32) -> String {
        format!("t{}-{:x}", self.run_id, serial)
    }

    /// Patch bridge joining a peered pair of stubs
    pub fn patch(&self, pair: u32) -> String {
        format!("p{}-{:x}", self.run_id, pair)
    }
}

/// Random 4-hex-digit run id
pub fn generate_run_id() -> String {
    let n: u16 = rand::rng().random();
    format!("{:04x}", n)
}

/// Check that `name` is usable as a kernel interface name
pub fn validate_ifname(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::ConfigValidation("Interface name cannot be empty".into()));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(Error::ConfigValidation(format!(
            "Interface name '{}' exceeds {} characters",
            name, MAX_IFNAME_LEN
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
        return Err(Error::ConfigValidation(format!(
            "Interface name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_names() {
        let scope = RunScope::new("t1-", Some("ab12".into())).unwrap();
        assert_eq!(scope.netns("zoo1"), "t1-zoo1");
        assert_eq!(scope.root_name("br0"), "t1-br0");
        assert_eq!(scope.stub(10), "vab12-a");
        assert_eq!(scope.temp(10), "tab12-a");
        assert_eq!(scope.patch(3), "pab12-3");
    }

    #[test]
    fn test_hidden_names_fit_ifnamsiz() {
        let scope = RunScope::new("", Some("ffff".into())).unwrap();
        assert!(validate_ifname(&scope.stub(u32::MAX)).is_ok());
        assert!(validate_ifname(&scope.patch(u32::MAX)).is_ok());
    }

    #[test]
    fn test_run_ids_never_share_hidden_names() {
        let short = RunScope::new("", Some("a".into())).unwrap();
        let long = RunScope::new("", Some("a1".into())).unwrap();
        assert_ne!(short.stub(0x11), long.stub(1));
        assert_ne!(short.temp(0x11), long.temp(1));
        assert_ne!(short.patch(0x11), long.patch(1));
        assert_eq!(short.stub(0x11), "va-11");
        assert_eq!(long.stub(1), "va1-1");
    }

    #[test]
    fn test_generated_run_id() {
        let scope = RunScope::new("", None).unwrap();
        assert_eq!(scope.run_id().len(), 4);
        assert!(scope.run_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_invalid_run_id() {
        assert!(RunScope::new("", Some("toolong".into())).is_err());
        assert!(RunScope::new("", Some("a b".into())).is_err());
    }

    #[test]
    fn test_validate_ifname() {
        assert!(validate_ifname("eth0").is_ok());
        assert!(validate_ifname("").is_err());
        assert!(validate_ifname("averyveryverylongname").is_err());
        assert!(validate_ifname("eth/0").is_err());
    }
}
