//! Inventory of OS objects allocated by a run
//!
//! Every namespace, link and bridge the engine creates is recorded here in
//! allocation order, so [`Inventory::reap`] can take everything down again no
//! matter how far startup got.

use crate::error::Result;
use crate::net::{NetBackend, NetContext, NetOp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single allocated OS object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    Namespace { name: String },
    Link { ctx: NetContext, name: String },
    Bridge { ctx: NetContext, name: String },
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Namespace { name } => write!(f, "netns {}", name),
            Resource::Link { ctx, name } => write!(f, "link {} ({})", name, ctx),
            Resource::Bridge { ctx, name } => write!(f, "bridge {} ({})", name, ctx),
        }
    }
}

/// Ordered record of allocated resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    resources: Vec<Resource>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation (no-op if already recorded)
    pub fn record(&mut self, resource: Resource) {
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
    }

    /// Forget a resource that was released normally
    pub fn forget(&mut self, resource: &Resource) {
        self.resources.retain(|r| r != resource);
    }

    /// Forget every resource living inside a namespace, plus the namespace
    pub fn forget_namespace(&mut self, name: &str) {
        self.resources.retain(|r| match r {
            Resource::Namespace { name: n } => n != name,
            Resource::Link { ctx, .. } | Resource::Bridge { ctx, .. } => {
                ctx.namespace() != Some(name)
            }
        });
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Tear down everything, newest first
    ///
    /// Objects that are already gone are skipped. Failures do not stop the
    /// sweep; the first one is returned once every resource was attempted.
    /// Resources that could not be removed stay recorded.
    pub fn reap(&mut self, backend: &dyn NetBackend) -> Result<usize> {
        let mut first_error = None;
        let mut removed = 0;
        let mut remaining = Vec::new();

        for resource in self.resources.drain(..).rev() {
            match reap_one(backend, &resource) {
                Ok(true) => {
                    tracing::debug!(%resource, "reaped");
                    removed += 1;
                }
                Ok(false) => {
                    tracing::debug!(%resource, "already gone");
                }
                Err(e) => {
                    tracing::warn!(%resource, error = %e, "failed to reap");
                    remaining.push(resource);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        remaining.reverse();
        self.resources = remaining;

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}

fn reap_one(backend: &dyn NetBackend, resource: &Resource) -> Result<bool> {
    match resource {
        Resource::Namespace { name } => {
            if !backend.netns_exists(name)? {
                return Ok(false);
            }
            backend.apply(&NetOp::NetnsDel { name: name.clone() })?;
        }
        Resource::Link { ctx, name } | Resource::Bridge { ctx, name } => {
            if let Some(ns) = ctx.namespace() {
                if !backend.netns_exists(ns)? {
                    return Ok(false);
                }
            }
            if !backend.link_exists(ctx, name)? {
                return Ok(false);
            }
            backend.apply(&NetOp::LinkDel {
                ctx: ctx.clone(),
                name: name.clone(),
            })?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SimKernel;

    #[test]
    fn test_record_is_deduplicated() {
        let mut inv = Inventory::new();
        inv.record(Resource::Namespace { name: "zoo1".into() });
        inv.record(Resource::Namespace { name: "zoo1".into() });
        assert_eq!(inv.len(), 1);
    }

    #[test]
    fn test_forget_namespace_drops_contained_links() {
        let mut inv = Inventory::new();
        inv.record(Resource::Namespace { name: "zoo1".into() });
        inv.record(Resource::Link {
            ctx: NetContext::Namespace("zoo1".into()),
            name: "eth0".into(),
        });
        inv.record(Resource::Link {
            ctx: NetContext::Root,
            name: "vab12-1".into(),
        });

        inv.forget_namespace("zoo1");
        assert_eq!(inv.len(), 1);
    }

    #[test]
    fn test_reap_is_idempotent() {
        let kernel = SimKernel::new();
        kernel
            .apply(&NetOp::NetnsAdd { name: "zoo1".into() })
            .unwrap();
        kernel
            .apply(&NetOp::BridgeAdd {
                ctx: NetContext::Root,
                name: "br0".into(),
            })
            .unwrap();

        let mut inv = Inventory::new();
        inv.record(Resource::Namespace { name: "zoo1".into() });
        inv.record(Resource::Bridge {
            ctx: NetContext::Root,
            name: "br0".into(),
        });
        // Never created; must be skipped
        inv.record(Resource::Link {
            ctx: NetContext::Root,
            name: "ghost".into(),
        });

        assert_eq!(inv.reap(&kernel).unwrap(), 2);
        assert!(inv.is_empty());
        assert!(kernel.namespaces().is_empty());

        assert_eq!(inv.reap(&kernel).unwrap(), 0);
    }

    #[test]
    fn test_reap_continues_past_failures() {
        let kernel = SimKernel::new();
        kernel
            .apply(&NetOp::NetnsAdd { name: "a".into() })
            .unwrap();
        kernel
            .apply(&NetOp::NetnsAdd { name: "b".into() })
            .unwrap();
        kernel.fail_on("netns del b");

        let mut inv = Inventory::new();
        inv.record(Resource::Namespace { name: "a".into() });
        inv.record(Resource::Namespace { name: "b".into() });

        assert!(inv.reap(&kernel).is_err());
        assert_eq!(kernel.namespaces(), vec!["b".to_string()]);
        assert_eq!(inv.resources(), &[Resource::Namespace { name: "b".into() }]);
    }
}
