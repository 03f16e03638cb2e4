//! Topology synchronization.
//!
//! The admin resets its graph to its direct links, offers its map to each
//! direct peer, and merges the replies. Agents answer recursively: merge
//! the inbound map, fan out to their own direct peers except the requester,
//! merge those replies, then answer with the merged map. Every node
//! recomputes routes and rebuilds indirect records when its round ends, so
//! nodes that dropped off the overlay fall out of the table.

use crate::context::OverlayContext;
use crate::error::Result;
use crate::peer::Peer;
use crate::topology::Topology;
use crate::wire::{CmdTag, Frame, SyncBody};
use std::sync::Arc;
use std::time::Duration;

/// Deadline for one peer's SYNC reply; a slow subtree falls out of this
/// round and is retried on the next.
const SYNC_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Run one admin-initiated synchronization round.
///
/// Per-peer failures are logged and skipped; the round always completes
/// with whatever subset of the overlay answered.
///
/// # Errors
///
/// Currently none beyond panics-by-contract; the signature leaves room for
/// callers to treat a failed round as fatal.
pub async fn admin_sync(ctx: &Arc<OverlayContext>) -> Result<()> {
    let _gate = ctx.sync_gate().lock().await;

    let directs: Vec<Arc<Peer>> = ctx
        .registry()
        .iter_direct()
        .into_iter()
        .filter(|p| !p.is_closed())
        .collect();
    let direct_ids: Vec<_> = directs.iter().map(|p| p.id()).collect();

    ctx.topology_write(|topo| topo.reset_to_direct(&direct_ids));

    for peer in &directs {
        if let Err(e) = sync_one(ctx, peer).await {
            tracing::warn!(peer = %peer.id().short(), error = %e, "sync round skipped peer");
        }
    }

    ctx.topology_write(Topology::recompute_routes);
    ctx.rebuild_indirect();
    ctx.gc_unroutable();

    let nodes = ctx.topology_read(|t| t.nodes().len());
    tracing::info!(nodes, "topology synchronized");
    Ok(())
}

async fn sync_one(ctx: &Arc<OverlayContext>, peer: &Arc<Peer>) -> Result<()> {
    let slot = peer.expect_reply(CmdTag::Sync)?;

    let map = ctx.topology_read(Topology::encode_map);
    peer.send(ctx.sealer(), ctx.local_id(), CmdTag::Sync, &SyncBody { map })
        .await?;

    let reply = slot.recv(Some(SYNC_REPLY_TIMEOUT)).await?;
    let body: SyncBody = reply.parse()?;
    ctx.topology_write(|topo| topo.merge_map(&body.map))?;
    Ok(())
}

/// Agent-side SYNC handler: merge, fan out, answer.
pub(crate) async fn handle_sync(
    ctx: &Arc<OverlayContext>,
    from: Arc<Peer>,
    frame: Frame,
) -> Result<()> {
    let _gate = ctx.sync_gate().lock().await;

    let req: SyncBody = frame.parse()?;

    let directs: Vec<Arc<Peer>> = ctx
        .registry()
        .iter_direct()
        .into_iter()
        .filter(|p| !p.is_closed())
        .collect();
    let direct_ids: Vec<_> = directs.iter().map(|p| p.id()).collect();

    ctx.topology_write(|topo| {
        topo.reset_to_direct(&direct_ids);
        topo.merge_map(&req.map)
    })?;

    for peer in directs.iter().filter(|p| p.id() != from.id()) {
        if let Err(e) = sync_one(ctx, peer).await {
            tracing::warn!(peer = %peer.id().short(), error = %e, "downstream sync skipped");
        }
    }

    ctx.topology_write(Topology::recompute_routes);
    ctx.rebuild_indirect();
    ctx.gc_unroutable();

    let map = ctx.topology_read(Topology::encode_map);
    ctx.send_to(frame.header.src, CmdTag::Sync, &SyncBody { map })
        .await
}
