//! Per-link frame reader and demultiplexer.
//!
//! One reader task owns the read half of each direct peer's stream. For
//! every decoded frame it decides "for me" versus "forward": local frames
//! are demultiplexed into a command mailbox or a per-session byte queue;
//! transit frames are re-framed onto the next hop with source and
//! destination preserved. An unknown next hop drops the frame with a logged
//! error and never aborts the process.
//!
//! The reader's life is `Handshaking → Running → Draining → Dead`: it is
//! spawned only after admission succeeds, and any transport, framing or
//! authentication error on its link moves it to draining, which closes every
//! session attached to the peer, fails its mailbox readers, removes it from
//! the registry, prunes the graph and (admin role) triggers a resync.

use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::services;
use crate::session::ServiceKind;
use crate::wire::{CmdTag, DataBody, Frame};
use std::sync::Arc;

/// Start the reader task for a freshly admitted direct peer.
pub(crate) fn spawn_link_reader(ctx: Arc<OverlayContext>, peer: Arc<Peer>) {
    tokio::spawn(run_link_reader(ctx, peer));
}

async fn wait_closed(closed: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

async fn run_link_reader(ctx: Arc<OverlayContext>, peer: Arc<Peer>) {
    let link = peer.link();
    let mut closed = peer.closed_signal();

    let reason = loop {
        tokio::select! {
            frame = link.read_frame(ctx.sealer()) => {
                match frame {
                    Ok(frame) => {
                        if let Err(e) = handle_frame(&ctx, &peer, frame).await {
                            if e.is_link_fatal() {
                                break e;
                            }
                            tracing::debug!(peer = %peer.id().short(), error = %e, "frame dropped");
                        }
                    }
                    Err(e) => break e,
                }
            }
            () = wait_closed(&mut closed) => {
                break Error::Transport("link closed locally".into());
            }
        }
    };

    tracing::warn!(peer = %peer.id().short(), error = %reason, "link draining");
    ctx.drop_peer(peer.id()).await;
}

async fn handle_frame(ctx: &Arc<OverlayContext>, from: &Arc<Peer>, frame: Frame) -> Result<()> {
    let header = frame.header;

    if header.dst != ctx.local_id() {
        forward(ctx, frame).await;
        return Ok(());
    }
    if header.src == ctx.local_id() {
        return Err(Error::Protocol("frame looped back to its originator".into()));
    }

    match header.tag {
        CmdTag::Init => Err(Error::Protocol("INIT after admission".into())),
        tag if tag.is_session_data() => {
            let body: DataBody = frame.parse()?;
            let service = ServiceKind::from_data_tag(tag)
                .expect("session-data tags map to a service");
            deliver_data(ctx, from, header.src, service, body).await;
            Ok(())
        }
        tag => {
            let src_peer = ctx.source_peer(header.src, from);
            if src_peer.deliver(tag, frame.clone()).await? {
                return Ok(());
            }
            services::handle_request(ctx, src_peer, frame);
            Ok(())
        }
    }
}

async fn deliver_data(
    ctx: &Arc<OverlayContext>,
    from: &Arc<Peer>,
    src: NodeId,
    service: ServiceKind,
    body: DataBody,
) {
    let src_peer = ctx.source_peer(src, from);
    let mux = src_peer.mux(service);

    // Pushing blocks while this session's queue is full; queues are
    // independent per session, so only this link stalls.
    if !body.data.is_empty() {
        mux.push(body.session, body.data).await;
    }
    if body.close == 1 {
        mux.close(body.session);
    }
}

async fn forward(ctx: &Arc<OverlayContext>, frame: Frame) {
    let dst = frame.header.dst;
    let hop = match ctx.topology_read(|t| t.next_hop(dst)) {
        Ok(hop) => hop,
        Err(_) => {
            tracing::error!(dst = %dst.short(), "dropping frame with no route");
            return;
        }
    };

    let Some(hop_peer) = ctx.registry().lookup(hop).filter(|p| !p.is_closed()) else {
        tracing::error!(hop = %hop.short(), "next hop has no live peer record");
        return;
    };

    // A failure here belongs to the next hop's link; its own reader will
    // notice and drain it.
    if let Err(e) = hop_peer
        .link()
        .write_raw(ctx.sealer(), &frame.header, &frame.body)
        .await
    {
        tracing::warn!(hop = %hop.short(), error = %e, "forwarding failed");
    }
}
