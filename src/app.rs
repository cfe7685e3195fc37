//! Resident applications and their lifecycle callbacks
//!
//! A host invokes these callbacks on its applications:
//! - `prepare_environment` then `control_start` during boot, in declaration order
//! - `control_stop` then `cleanup_environment` during shutdown, in reverse order
//!
//! Applications are constructed by kind through [`ApplicationRegistry`].

pub mod command;
pub mod netns_hv;

pub use command::CommandApp;
pub use netns_hv::NetnsHv;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::manifest::{ApplicationDef, HostDef};
use crate::net::NetContext;
use std::collections::BTreeMap;
use std::fmt;

/// Broad role of an application on its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppType {
    Unknown,
    NetworkOverlay,
    Hypervisor,
    Nsdb,
    Api,
    ResourceRetrieval,
    Supplementary,
}

impl AppType {
    /// Whether a host may carry more than one application of this type
    pub fn multi_allowed(&self) -> bool {
        matches!(self, AppType::ResourceRetrieval | AppType::Supplementary)
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppType::Unknown => "Unknown",
            AppType::NetworkOverlay => "Network-Overlay",
            AppType::Hypervisor => "Hypervisor-Service",
            AppType::Nsdb => "NSDB",
            AppType::Api => "API",
            AppType::ResourceRetrieval => "Resource Retrieval",
            AppType::Supplementary => "Supplementary-Application",
        };
        f.write_str(s)
    }
}

/// What an application sees of its host during a callback
pub struct AppContext<'a> {
    pub host: &'a str,
    pub net: &'a NetContext,
    pub run: &'a RunContext,
}

/// Lifecycle callback contract for resident applications
pub trait Application: Send {
    /// Registry kind this application was built from
    fn kind(&self) -> &'static str;

    /// Display name (configured id, or the kind)
    fn name(&self) -> &str;

    fn app_type(&self) -> AppType {
        AppType::Unknown
    }

    /// Apply the host and application definitions
    fn configure(&mut self, host: &HostDef, app: &ApplicationDef) -> Result<()>;

    fn prepare_environment(&mut self, _ctx: &AppContext<'_>) -> Result<()> {
        Ok(())
    }

    fn control_start(&mut self, _ctx: &AppContext<'_>) -> Result<()> {
        Ok(())
    }

    fn control_stop(&mut self, _ctx: &AppContext<'_>) -> Result<()> {
        Ok(())
    }

    fn cleanup_environment(&mut self, _ctx: &AppContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Detail lines for `print_config`
    fn describe(&self) -> Vec<String> {
        Vec::new()
    }

    /// Accept a VM host as a guest (hypervisors only)
    fn register_guest(&mut self, vm: &str) -> Result<()> {
        Err(Error::ArgumentMismatch(format!(
            "Application '{}' cannot host VM '{}'",
            self.name(),
            vm
        )))
    }
}

/// Constructor for an application kind
pub type AppConstructor = fn() -> Box<dyn Application>;

/// Maps application kinds to constructors
pub struct ApplicationRegistry {
    constructors: BTreeMap<String, AppConstructor>,
}

impl ApplicationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the built-in kinds
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("command", || Box::new(CommandApp::new()));
        registry.register("netns_hv", || Box::new(NetnsHv::new()));
        registry.register("NetnsHV", || Box::new(NetnsHv::new()));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: AppConstructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Build and configure an application
    pub fn build(&self, host: &HostDef, def: &ApplicationDef) -> Result<Box<dyn Application>> {
        let constructor = self
            .constructors
            .get(&def.kind)
            .ok_or_else(|| Error::UnknownApplication(def.kind.clone()))?;
        let mut app = constructor();
        app.configure(host, def)?;
        Ok(app)
    }
}

impl Default for ApplicationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_def() -> HostDef {
        toml::from_str(r#"name = "h1""#).unwrap()
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = ApplicationRegistry::with_builtins();
        assert!(registry.contains("command"));
        assert!(registry.contains("netns_hv"));
        assert!(registry.contains("NetnsHV"));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ApplicationRegistry::with_builtins();
        let def: ApplicationDef = toml::from_str(r#"kind = "quagga""#).unwrap();
        let err = registry.build(&host_def(), &def).err().unwrap();
        assert!(matches!(err, Error::UnknownApplication(_)));
    }

    #[test]
    fn test_build_hypervisor() {
        let registry = ApplicationRegistry::with_builtins();
        let def: ApplicationDef = toml::from_str(r#"kind = "netns_hv""#).unwrap();
        let app = registry.build(&host_def(), &def).unwrap();
        assert_eq!(app.app_type(), AppType::Hypervisor);
        assert_eq!(app.name(), "netns_hv");
    }

    #[test]
    fn test_multi_allowed_types() {
        assert!(AppType::Supplementary.multi_allowed());
        assert!(!AppType::Hypervisor.multi_allowed());
        assert_eq!(AppType::Hypervisor.to_string(), "Hypervisor-Service");
    }
}
