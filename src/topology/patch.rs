//! Patch bridges joining peered interfaces
//!
//! Each veth interface owns one veth pair: the visible end in its host's
//! context and a stub in the root context. Two peered interfaces are joined
//! by a small bridge in the root context that both stubs are ports of.
//! Whichever side comes up second builds the patch; whichever side goes away
//! last deletes it. Neither side ever deletes the other's devices.

use crate::context::RunContext;
use crate::error::Result;
use crate::net::{NetContext, NetOp, Resource};
use crate::topology::Interface;

/// Patch bridge name for a peered interface
fn patch_name(run: &RunContext, iface: &Interface, peer_serial: u32) -> String {
    run.scope().patch(iface.serial.min(peer_serial))
}

/// Connect `iface` to its peer if the peer's stub already exists
///
/// Idempotent: repeated calls and calls from both sides converge on one
/// patch bridge with both stubs attached.
pub fn join(run: &RunContext, iface: &Interface) -> Result<()> {
    let Some(peer) = &iface.peer else {
        return Ok(());
    };
    let peer_serial = run.serial(&peer.host, &peer.interface)?;
    let backend = run.backend();
    let root = NetContext::Root;

    let own_stub = run.scope().stub(iface.serial);
    let peer_stub = run.scope().stub(peer_serial);

    let _guard = run.lock_patches();

    if !backend.link_exists(&root, &peer_stub)? {
        tracing::debug!(interface = %iface.name, peer = %peer, "peer not up yet, deferring patch");
        return Ok(());
    }

    let patch = patch_name(run, iface, peer_serial);
    if !backend.link_exists(&root, &patch)? {
        backend.apply(&NetOp::BridgeAdd {
            ctx: root.clone(),
            name: patch.clone(),
        })?;
        run.record(Resource::Bridge {
            ctx: root.clone(),
            name: patch.clone(),
        });
        backend.apply(&NetOp::LinkSetUp {
            ctx: root.clone(),
            name: patch.clone(),
            up: true,
        })?;
    }

    let members = backend.bridge_members(&root, &patch)?;
    for stub in [own_stub, peer_stub] {
        if !members.contains(&stub) {
            backend.apply(&NetOp::LinkSetMaster {
                ctx: root.clone(),
                name: stub,
                master: Some(patch.clone()),
            })?;
        }
    }

    tracing::info!(interface = %iface.name, host = %iface.host, peer = %peer, %patch, "peer link established");
    Ok(())
}

/// Drop the patch bridge once neither stub is attached anymore
pub fn release(run: &RunContext, iface: &Interface) -> Result<()> {
    let Some(peer) = &iface.peer else {
        return Ok(());
    };
    let peer_serial = run.serial(&peer.host, &peer.interface)?;
    let backend = run.backend();
    let root = NetContext::Root;
    let patch = patch_name(run, iface, peer_serial);

    let _guard = run.lock_patches();

    if !backend.link_exists(&root, &patch)? {
        return Ok(());
    }
    if backend.bridge_members(&root, &patch)?.is_empty() {
        backend.apply(&NetOp::LinkDel {
            ctx: root.clone(),
            name: patch.clone(),
        })?;
        run.forget(&Resource::Bridge { ctx: root, name: patch });
    }
    Ok(())
}
