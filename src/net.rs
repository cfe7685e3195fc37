//! OS-level network plumbing
//!
//! Provides:
//! - The operation vocabulary issued against the kernel ([`NetOp`])
//! - A backend seam ([`NetBackend`]) with an iproute2 implementation and an
//!   in-memory simulated kernel
//! - Per-run naming of OS objects and an inventory of everything allocated

pub mod inventory;
pub mod iproute;
pub mod naming;
pub mod op;
pub mod sim;

pub use inventory::{Inventory, Resource};
pub use iproute::IpRoute2;
pub use naming::RunScope;
pub use op::{NetOp, Route, RouteDestination};
pub use sim::SimKernel;

use crate::error::Result;
use crate::exec::CommandOutput;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where a network operation takes effect
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetContext {
    /// The ambient (initial) network namespace
    Root,
    /// A named network namespace
    Namespace(String),
}

impl NetContext {
    /// Namespace name, if any
    pub fn namespace(&self) -> Option<&str> {
        match self {
            NetContext::Root => None,
            NetContext::Namespace(name) => Some(name),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, NetContext::Root)
    }
}

impl fmt::Display for NetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetContext::Root => write!(f, "root"),
            NetContext::Namespace(name) => write!(f, "netns:{}", name),
        }
    }
}

/// Backend that realizes network operations
///
/// Implementations must be usable from several phase workers at once.
pub trait NetBackend: Send + Sync {
    /// Apply a mutating operation
    fn apply(&self, op: &NetOp) -> Result<()>;

    /// Check whether a named network namespace exists
    fn netns_exists(&self, name: &str) -> Result<bool>;

    /// Check whether a link exists in the given context
    fn link_exists(&self, ctx: &NetContext, name: &str) -> Result<bool>;

    /// List the ports enslaved to a bridge
    fn bridge_members(&self, ctx: &NetContext, bridge: &str) -> Result<Vec<String>>;

    /// List the addresses configured on a link
    fn link_addresses(&self, ctx: &NetContext, name: &str) -> Result<Vec<IpNet>>;

    /// Run an arbitrary program inside the given context
    fn exec(
        &self,
        ctx: &NetContext,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput>;
}
