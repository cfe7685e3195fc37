//! ptm-ctl - physical topology manager
//!
//! Builds emulated multi-host networks from a topology description and
//! tears them down again.

mod cli;

use cli::{Cli, Commands};
use ptm::error::{Error, Result};
use ptm::manager::PhysicalTopologyManager;
use ptm::manifest::{self, TopologyConfig};
use ptm::net::{IpRoute2, NetBackend, SimKernel};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let config = manifest::load(&cli.config_file)?;
    let state_file = config
        .config
        .state_file
        .clone()
        .unwrap_or_else(|| cli.config_file.with_extension("state.json"));

    match cli.command {
        Commands::Startup { dry_run: true } => {
            let kernel = Arc::new(SimKernel::new());
            let backend: Arc<dyn NetBackend> = kernel.clone();
            let mut manager = PhysicalTopologyManager::configure(config, backend)?;
            manager.startup()?;

            for command in kernel.journal() {
                println!("{}", command);
            }
            println!("\nDry run: {} commands, nothing was changed.", kernel.journal().len());
        }
        Commands::Startup { dry_run: false } => {
            if state_file.exists() {
                return Err(Error::ArgumentMismatch(format!(
                    "Run state '{}' exists; run 'ptm-ctl shutdown' or 'ptm-ctl reap' first",
                    state_file.display()
                )));
            }
            warn_unprivileged();
            let mut manager = live_manager(config, state_file)?;
            if let Err(e) = manager.startup() {
                eprintln!("Startup failed; run 'ptm-ctl reap' to remove what was created.");
                return Err(e);
            }
            println!(
                "Topology started ({} hosts, run {}).",
                manager.host_by_start_order().len(),
                manager.run_context().scope().run_id()
            );
        }
        Commands::Shutdown => {
            warn_unprivileged();
            let mut manager = live_manager(config, state_file.clone())?;
            if !manager.resume()? {
                return Err(Error::ArgumentMismatch(format!(
                    "No run state at '{}'; nothing to shut down",
                    state_file.display()
                )));
            }
            manager.shutdown()?;
            println!("Topology shut down.");
        }
        Commands::Print { json } => {
            let mut manager = live_manager(config, state_file)?;
            manager.resume()?;
            if json {
                println!("{}", manager.config_json()?);
            } else {
                manager.print_config();
            }
        }
        Commands::Check => {
            let manager = PhysicalTopologyManager::configure(config, Arc::new(SimKernel::new()))?;
            manager.check();
        }
        Commands::Reap => {
            warn_unprivileged();
            let mut manager = live_manager(config, state_file)?;
            if !manager.resume()? {
                println!("Nothing to reap.");
                return Ok(());
            }
            let removed = manager.reap()?;
            println!("Removed {} objects.", removed);
        }
        Commands::Completion { .. } => {}
    }

    Ok(())
}

/// Manager backed by iproute2, persisting run state to `state_file`
fn live_manager(config: TopologyConfig, state_file: PathBuf) -> Result<PhysicalTopologyManager> {
    let timeout = Duration::from_secs(config.config.command_timeout);
    let backend: Arc<dyn NetBackend> = Arc::new(IpRoute2::new(timeout));
    let mut manager = PhysicalTopologyManager::configure(config, backend)?;
    manager.set_state_file(Some(state_file));
    Ok(manager)
}

fn warn_unprivileged() {
    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("not running as root; namespace and link operations will likely fail");
    }
}
