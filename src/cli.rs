//! Command-line interface for ptm-ctl
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// ptm-ctl - emulated multi-host networks on Linux network namespaces
#[derive(Parser)]
#[command(name = "ptm-ctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Topology description (TOML, or JSON with a .json extension)
    #[arg(short = 'c', long, default_value = "topology.toml", global = true)]
    pub config_file: PathBuf,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Build the topology: create, boot, net_up, net_finalize on every host
    Startup {
        /// Run against a simulated kernel and print the commands instead
        #[arg(long)]
        dry_run: bool,
    },

    /// Tear the topology down: net_down, shutdown, remove in reverse order
    Shutdown,

    /// Print the configured topology
    #[command(visible_alias = "config")]
    Print {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Validate the topology description and show the start order
    Check,

    /// Delete every OS object recorded for the last run
    Reap,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "ptm-ctl", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_alias() {
        let cli = Cli::try_parse_from(["ptm-ctl", "-c", "lab.toml", "config", "--json"]).unwrap();
        assert_eq!(cli.config_file, PathBuf::from("lab.toml"));
        assert!(matches!(cli.command, Commands::Print { json: true }));
    }

    #[test]
    fn test_startup_dry_run() {
        let cli = Cli::try_parse_from(["ptm-ctl", "startup", "--dry-run", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Startup { dry_run: true }));
        assert_eq!(cli.config_file, PathBuf::from("topology.toml"));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["ptm-ctl", "install"]).is_err());
    }
}
