//! PTM - physical topology manager
//!
//! Builds and tears down emulated multi-host networks on Linux using network
//! namespaces, veth pairs and bridges, driven by a declarative topology
//! description and a per-host lifecycle state machine.

pub mod app;
pub mod context;
pub mod error;
pub mod exec;
pub mod manager;
pub mod manifest;
pub mod net;
pub mod topology;

pub use error::{Error, ErrorKind, Result};
pub use manager::PhysicalTopologyManager;
