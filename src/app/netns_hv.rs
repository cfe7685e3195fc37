//! Hypervisor application for VM hosts backed by network namespaces

use crate::app::{AppContext, AppType, Application};
use crate::error::{Error, Result};
use crate::manifest::{ApplicationDef, HostDef};
use std::collections::BTreeSet;

/// Tracks the VM hosts running under a hypervisor host
#[derive(Debug, Default)]
pub struct NetnsHv {
    name: String,
    host: String,
    guests: BTreeSet<String>,
}

impl NetnsHv {
    pub fn new() -> Self {
        Self {
            name: "netns_hv".to_string(),
            ..Self::default()
        }
    }

    pub fn guests(&self) -> impl Iterator<Item = &str> {
        self.guests.iter().map(String::as_str)
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }
}

impl Application for NetnsHv {
    fn kind(&self) -> &'static str {
        "netns_hv"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn app_type(&self) -> AppType {
        AppType::Hypervisor
    }

    fn configure(&mut self, host: &HostDef, app: &ApplicationDef) -> Result<()> {
        self.host = host.name.clone();
        if let Some(id) = &app.id {
            self.name = id.clone();
        }
        Ok(())
    }

    fn control_start(&mut self, ctx: &AppContext<'_>) -> Result<()> {
        tracing::debug!(host = ctx.host, guests = self.guests.len(), "hypervisor ready");
        Ok(())
    }

    fn control_stop(&mut self, ctx: &AppContext<'_>) -> Result<()> {
        tracing::debug!(host = ctx.host, "hypervisor stopping");
        Ok(())
    }

    fn describe(&self) -> Vec<String> {
        if self.guests.is_empty() {
            return vec!["VMs: none".to_string()];
        }
        let names: Vec<&str> = self.guests().collect();
        vec![format!("VMs: {}", names.join(", "))]
    }

    fn register_guest(&mut self, vm: &str) -> Result<()> {
        if !self.guests.insert(vm.to_string()) {
            return Err(Error::ConfigValidation(format!(
                "VM '{}' registered twice on hypervisor '{}'",
                vm, self.host
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_guests() {
        let mut hv = NetnsHv::new();
        hv.register_guest("vm1").unwrap();
        hv.register_guest("vm2").unwrap();
        assert_eq!(hv.guest_count(), 2);
        assert!(hv.register_guest("vm1").is_err());
        assert_eq!(hv.describe(), vec!["VMs: vm1, vm2".to_string()]);
    }

    #[test]
    fn test_configured_id_becomes_name() {
        let host: HostDef = toml::from_str(r#"name = "cmp1""#).unwrap();
        let def: ApplicationDef = toml::from_str(
            r#"
kind = "netns_hv"
id = "hv0"
"#,
        )
        .unwrap();
        let mut hv = NetnsHv::new();
        hv.configure(&host, &def).unwrap();
        assert_eq!(hv.name(), "hv0");
    }
}
