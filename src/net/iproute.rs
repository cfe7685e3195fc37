//! iproute2 backend
//!
//! Drives the kernel through the `ip` binary. Queries parse the one-line
//! (`-o`) output format.

use crate::error::{Error, Result};
use crate::exec::{CommandOutput, CommandRunner, DEFAULT_COMMAND_TIMEOUT, ProcessRunner};
use crate::net::{NetBackend, NetContext, NetOp};
use ipnet::IpNet;
use std::time::Duration;

const IP: &str = "ip";

/// Backend issuing iproute2 commands
pub struct IpRoute2 {
    runner: Box<dyn CommandRunner>,
    timeout: Duration,
}

impl IpRoute2 {
    /// Backend running real processes
    pub fn new(timeout: Duration) -> Self {
        Self::with_runner(Box::new(ProcessRunner), timeout)
    }

    pub fn with_runner(runner: Box<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn ip(&self, args: Vec<String>) -> Result<CommandOutput> {
        self.runner.run(IP, &args, self.timeout)
    }

    fn ctx_args(ctx: &NetContext, tail: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ns) = ctx.namespace() {
            args.push("-n".to_string());
            args.push(ns.to_string());
        }
        args.extend(tail.iter().map(|s| s.to_string()));
        args
    }
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl NetBackend for IpRoute2 {
    fn apply(&self, op: &NetOp) -> Result<()> {
        tracing::debug!(command = %op, "ip");
        let output = self.ip(op.args())?;
        if !output.success {
            return Err(Error::CommandFailed {
                command: op.to_string(),
                message: output.diagnostic(),
            });
        }
        Ok(())
    }

    fn netns_exists(&self, name: &str) -> Result<bool> {
        let output = self.ip(vec!["netns".into(), "list".into()])?;
        if !output.success {
            return Err(Error::CommandFailed {
                command: "ip netns list".into(),
                message: output.diagnostic(),
            });
        }
        Ok(parse_netns_list(&output.stdout).iter().any(|n| n == name))
    }

    fn link_exists(&self, ctx: &NetContext, name: &str) -> Result<bool> {
        let output = self.ip(Self::ctx_args(ctx, &["link", "show", "dev", name]))?;
        Ok(output.success)
    }

    fn bridge_members(&self, ctx: &NetContext, bridge: &str) -> Result<Vec<String>> {
        let args = Self::ctx_args(ctx, &["-o", "link", "show", "master", bridge]);
        let output = self.ip(args)?;
        if !output.success {
            return Err(Error::LinkNotFound(bridge.to_string()));
        }
        Ok(parse_link_names(&output.stdout))
    }

    fn link_addresses(&self, ctx: &NetContext, name: &str) -> Result<Vec<IpNet>> {
        let args = Self::ctx_args(ctx, &["-o", "addr", "show", "dev", name]);
        let output = self.ip(args)?;
        if !output.success {
            return Err(Error::LinkNotFound(name.to_string()));
        }
        Ok(parse_addresses(&output.stdout))
    }

    fn exec(
        &self,
        ctx: &NetContext,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        match ctx.namespace() {
            Some(ns) => {
                let mut full = vec!["netns".to_string(), "exec".to_string(), ns.to_string()];
                full.push(program.to_string());
                full.extend(args.iter().cloned());
                self.runner.run(IP, &full, timeout)
            }
            None => self.runner.run(program, args, timeout),
        }
    }
}

/// Names from `ip netns list` ("name (id: 3)" or bare "name")
fn parse_netns_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// Link names from `ip -o link show` ("4: eth0@if5: <...> ...")
fn parse_link_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name).trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Addresses from `ip -o addr show` ("2: eth0    inet 10.0.0.2/24 brd ...")
fn parse_addresses(stdout: &str) -> Vec<IpNet> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "inet" || *w == "inet6")?;
            words.next()?.parse().ok()
        })
        .collect()
}
