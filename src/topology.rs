//! Topology objects and their lifecycle
//!
//! Provides:
//! - Interfaces (veth, dummy, tap) and their peer references
//! - Bridges with their member sets
//! - The per-host lifecycle state machine
//! - Host variants (root, network namespace, VM) and the host registry
//! - Patch bridges joining peered interfaces across hosts

pub mod bridge;
pub mod host;
pub mod interface;
pub mod lifecycle;
pub mod patch;

pub use bridge::Bridge;
pub use host::{Host, HostCore, HostRegistry, NamespaceHost, RootHost, VmHost};
pub use interface::{Interface, InterfaceKind, PeerRef};
pub use lifecycle::{HostState, Lifecycle, Phase};

use crate::context::RunContext;
use crate::net::NetContext;

/// Kernel device name for a host-local object name
///
/// Inside a namespace the configured name is used as is. In the root
/// context names are shared with everything else on the machine, so the
/// run prefix is applied.
pub fn device_name(run: &RunContext, net: &NetContext, name: &str) -> String {
    match net {
        NetContext::Root => run.scope().root_name(name),
        NetContext::Namespace(_) => name.to_string(),
    }
}
