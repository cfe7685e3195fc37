//! Command hooks bound to application callbacks
//!
//! Provides:
//! - Hook definitions per lifecycle callback
//! - Variable substitution in hook commands
//! - Execution inside the host's network context
//! - Configurable failure handling

use crate::app::{AppContext, AppType, Application};
use crate::error::{Error, Result};
use crate::manifest::{ApplicationDef, HostDef};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Application callbacks a hook can run at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    PrepareEnvironment,
    ControlStart,
    ControlStop,
    CleanupEnvironment,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPhase::PrepareEnvironment => "prepare_environment",
            HookPhase::ControlStart => "control_start",
            HookPhase::ControlStop => "control_stop",
            HookPhase::CleanupEnvironment => "cleanup_environment",
        };
        write!(f, "{}", s)
    }
}

/// What to do when a hook fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the phase (default)
    #[default]
    Abort,
    /// Log and continue with the next hook
    Continue,
}

/// A single hook command
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    pub phase: HookPhase,

    /// Program to run
    pub command: String,

    /// Arguments (supports variable substitution)
    #[serde(default)]
    pub args: Vec<String>,

    /// Timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub on_failure: OnFailure,

    pub description: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

/// Settings table of a `command` application
#[derive(Debug, Default, Deserialize)]
struct CommandSettings {
    #[serde(default)]
    hooks: Vec<Hook>,
    /// Extra variables for substitution
    #[serde(default)]
    vars: HashMap<String, String>,
}

/// Variables available to hook commands
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub host_name: String,
    /// Namespace name, empty for the root context
    pub netns: String,
    pub extra: HashMap<String, String>,
}

impl HookContext {
    /// Substitute variables in a string
    ///
    /// Supported variables:
    /// - ${host_name} - Host name
    /// - ${netns} - Network namespace of the host (empty for root)
    /// - ${custom_var} - Custom variables from `vars`
    pub fn substitute(&self, input: &str) -> String {
        let mut result = input.replace("${host_name}", &self.host_name);
        result = result.replace("${netns}", &self.netns);

        for (name, value) in &self.extra {
            result = result.replace(&format!("${{{}}}", name), value);
        }

        result
    }
}

/// Application running configured commands at each callback
#[derive(Debug, Default)]
pub struct CommandApp {
    name: String,
    hooks: Vec<Hook>,
    vars: HashMap<String, String>,
}

impl CommandApp {
    pub fn new() -> Self {
        Self {
            name: "command".to_string(),
            ..Self::default()
        }
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    fn hook_context(&self, ctx: &AppContext<'_>) -> HookContext {
        HookContext {
            host_name: ctx.host.to_string(),
            netns: ctx.net.namespace().unwrap_or_default().to_string(),
            extra: self.vars.clone(),
        }
    }

    /// Execute all hooks for a given phase
    fn execute_phase(&self, phase: HookPhase, ctx: &AppContext<'_>) -> Result<()> {
        let phase_hooks: Vec<&Hook> = self.hooks.iter().filter(|h| h.phase == phase).collect();
        if phase_hooks.is_empty() {
            return Ok(());
        }

        tracing::debug!(app = %self.name, host = ctx.host, %phase, count = phase_hooks.len(), "running hooks");
        let vars = self.hook_context(ctx);

        for hook in phase_hooks {
            let command = vars.substitute(&hook.command);
            let args: Vec<String> = hook.args.iter().map(|a| vars.substitute(a)).collect();

            let output = ctx.run.backend().exec(
                ctx.net,
                &command,
                &args,
                Duration::from_secs(hook.timeout),
            )?;

            if !output.success {
                let desc = hook.description.as_deref().unwrap_or(&command);
                match hook.on_failure {
                    OnFailure::Abort => {
                        return Err(Error::ApplicationFailed {
                            app: self.name.clone(),
                            phase: phase.to_string(),
                            message: format!("'{}': {}", desc, output.diagnostic()),
                        });
                    }
                    OnFailure::Continue => {
                        tracing::warn!(
                            app = %self.name,
                            %phase,
                            hook = desc,
                            error = %output.diagnostic(),
                            "hook failed, continuing"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

impl Application for CommandApp {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn app_type(&self) -> AppType {
        AppType::Supplementary
    }

    fn configure(&mut self, host: &HostDef, app: &ApplicationDef) -> Result<()> {
        let settings: CommandSettings =
            serde_json::from_value(serde_json::Value::Object(app.settings.clone())).map_err(|e| {
                Error::ConfigValidation(format!(
                    "Invalid settings for application '{}' on host '{}': {}",
                    app.kind, host.name, e
                ))
            })?;

        for hook in &settings.hooks {
            if hook.command.trim().is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Empty hook command on host '{}'",
                    host.name
                )));
            }
        }

        if let Some(id) = &app.id {
            self.name = id.clone();
        }
        self.hooks = settings.hooks;
        self.vars = settings.vars;
        Ok(())
    }

    fn prepare_environment(&mut self, ctx: &AppContext<'_>) -> Result<()> {
        self.execute_phase(HookPhase::PrepareEnvironment, ctx)
    }

    fn control_start(&mut self, ctx: &AppContext<'_>) -> Result<()> {
        self.execute_phase(HookPhase::ControlStart, ctx)
    }

    fn control_stop(&mut self, ctx: &AppContext<'_>) -> Result<()> {
        self.execute_phase(HookPhase::ControlStop, ctx)
    }

    fn cleanup_environment(&mut self, ctx: &AppContext<'_>) -> Result<()> {
        self.execute_phase(HookPhase::CleanupEnvironment, ctx)
    }

    fn describe(&self) -> Vec<String> {
        self.hooks
            .iter()
            .map(|h| {
                let line = std::iter::once(h.command.as_str())
                    .chain(h.args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{}: {}", h.phase, line)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::net::{NetBackend, NetContext, NetOp, RunScope, SimKernel};
    use std::sync::Arc;

    fn configured(settings: &str) -> CommandApp {
        let host: HostDef = toml::from_str(r#"name = "h1""#).unwrap();
        let def: ApplicationDef = toml::from_str(settings).unwrap();
        let mut app = CommandApp::new();
        app.configure(&host, &def).unwrap();
        app
    }

    fn run(kernel: &Arc<SimKernel>) -> RunContext {
        let scope = RunScope::new("", Some("ab12".into())).unwrap();
        let backend: Arc<dyn NetBackend> = kernel.clone();
        RunContext::new(backend, scope, Duration::from_secs(1))
    }

    #[test]
    fn test_substitute() {
        let mut extra = HashMap::new();
        extra.insert("zone".to_string(), "east".to_string());
        let ctx = HookContext {
            host_name: "zoo1".into(),
            netns: "t-zoo1".into(),
            extra,
        };
        assert_eq!(
            ctx.substitute("${host_name}/${netns}/${zone}"),
            "zoo1/t-zoo1/east"
        );
    }

    #[test]
    fn test_hooks_parse_from_settings() {
        let app = configured(
            r#"
kind = "command"
id = "forwarding"

[[hooks]]
phase = "control_start"
command = "sysctl"
args = ["-w", "net.ipv4.ip_forward=1"]

[[hooks]]
phase = "cleanup_environment"
command = "true"
on_failure = "continue"
timeout = 5
"#,
        );
        assert_eq!(app.name(), "forwarding");
        assert_eq!(app.hooks().len(), 2);
        assert_eq!(app.hooks()[1].on_failure, OnFailure::Continue);
        assert_eq!(app.hooks()[1].timeout, 5);
    }

    #[test]
    fn test_hooks_run_inside_namespace() {
        let kernel = Arc::new(SimKernel::new());
        let run = run(&kernel);
        kernel
            .apply(&NetOp::NetnsAdd { name: "zoo1".into() })
            .unwrap();
        let net = NetContext::Namespace("zoo1".into());
        let ctx = AppContext {
            host: "zoo1",
            net: &net,
            run: &run,
        };

        let mut app = configured(
            r#"
kind = "command"
[[hooks]]
phase = "control_start"
command = "echo"
args = ["${host_name}"]
"#,
        );
        app.prepare_environment(&ctx).unwrap();
        app.control_start(&ctx).unwrap();
        assert!(kernel
            .journal()
            .contains(&"ip netns exec zoo1 echo zoo1".to_string()));
    }

    #[test]
    fn test_abort_on_failure() {
        let kernel = Arc::new(SimKernel::new());
        let run = run(&kernel);
        kernel.fail_on("false");
        let net = NetContext::Root;
        let ctx = AppContext {
            host: "h1",
            net: &net,
            run: &run,
        };

        let mut app = configured(
            r#"
kind = "command"
[[hooks]]
phase = "control_stop"
command = "false"
"#,
        );
        let err = app.control_stop(&ctx).unwrap_err();
        assert!(matches!(err, Error::ApplicationFailed { .. }));
    }

    #[test]
    fn test_continue_on_failure() {
        let kernel = Arc::new(SimKernel::new());
        let run = run(&kernel);
        kernel.fail_on("false");
        let net = NetContext::Root;
        let ctx = AppContext {
            host: "h1",
            net: &net,
            run: &run,
        };

        let mut app = configured(
            r#"
kind = "command"
[[hooks]]
phase = "cleanup_environment"
command = "false"
on_failure = "continue"

[[hooks]]
phase = "cleanup_environment"
command = "true"
"#,
        );
        app.cleanup_environment(&ctx).unwrap();
        assert!(kernel.journal().contains(&"true".to_string()));
    }

    #[test]
    fn test_invalid_settings() {
        let host: HostDef = toml::from_str(r#"name = "h1""#).unwrap();
        let def: ApplicationDef = toml::from_str(
            r#"
kind = "command"
hooks = "not a list"
"#,
        )
        .unwrap();
        let err = CommandApp::new().configure(&host, &def).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
    }
}
