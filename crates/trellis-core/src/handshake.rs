//! Link admission.
//!
//! When two processes establish a direct byte stream, the initiator sends a
//! probe carrying the shared secret's one-way image; the responder checks it
//! in constant time, replies with its own identity, label and adjacency map,
//! and receives the initiator's identity in return. A mismatch drops the
//! connection before the peer is registered. This is the only point where
//! identities are trusted off the link; every later frame carries
//! identities as routed data only.
//!
//! All admission messages are INIT frames and already ride inside the
//! sealed envelope, so a peer without the link secret fails before the
//! probe is even compared.

use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::peer::{Link, Peer};
use crate::topology::{NodeLabel, Topology};
use crate::wire::{CmdTag, Frame, FrameHeader, HelloBody, IdentBody, ProbeBody};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Deadline for each admission step.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

async fn read_init(ctx: &OverlayContext, link: &Link) -> Result<Frame> {
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, link.read_frame(ctx.sealer()))
        .await
        .map_err(|_| Error::Timeout)??;
    if frame.header.tag != CmdTag::Init {
        return Err(Error::Protocol("expected INIT during admission".into()));
    }
    Ok(frame)
}

/// Run admission as the connecting side.
///
/// Returns the admitted peer, its label, and the responder's adjacency map.
///
/// # Errors
///
/// `AuthFailure` when the responder speaks a different secret, `Timeout`
/// when a step stalls, `Protocol`/`MalformedFrame` on a broken exchange.
pub(crate) async fn initiate(
    ctx: &Arc<OverlayContext>,
    stream: TcpStream,
) -> Result<(Arc<Peer>, NodeLabel, Vec<u8>)> {
    let _ = stream.set_nodelay(true);
    let link = Arc::new(Link::new(stream));

    let probe_header = FrameHeader {
        src: ctx.local_id(),
        dst: NodeId::ZERO,
        tag: CmdTag::Init,
    };
    link.write_frame(
        ctx.sealer(),
        &probe_header,
        &ProbeBody {
            probe: ctx.secret().probe(),
        },
    )
    .await?;

    let hello: HelloBody = read_init(ctx, &link).await?.parse()?;

    let label = ctx.label().clone();
    link.write_frame(
        ctx.sealer(),
        &FrameHeader {
            src: ctx.local_id(),
            dst: hello.id,
            tag: CmdTag::Init,
        },
        &IdentBody {
            id: ctx.local_id(),
            hostname: label.hostname,
            os: label.os,
        },
    )
    .await?;

    let peer = Peer::new_direct(hello.id, link);
    let peer_label = NodeLabel {
        hostname: hello.hostname,
        os: hello.os,
    };
    Ok((peer, peer_label, hello.map))
}

/// Run admission as the accepting side.
///
/// # Errors
///
/// `AuthFailure` on a probe mismatch (the connection is dropped
/// unregistered), `Timeout`, `Protocol`, `MalformedFrame`.
pub(crate) async fn accept(
    ctx: &Arc<OverlayContext>,
    stream: TcpStream,
) -> Result<(Arc<Peer>, NodeLabel)> {
    let _ = stream.set_nodelay(true);
    let link = Arc::new(Link::new(stream));

    let probe: ProbeBody = read_init(ctx, &link).await?.parse()?;
    ctx.secret().verify_probe(&probe.probe)?;

    let label = ctx.label().clone();
    let map = ctx.topology_read(Topology::encode_map);
    link.write_frame(
        ctx.sealer(),
        &FrameHeader {
            src: ctx.local_id(),
            dst: NodeId::ZERO,
            tag: CmdTag::Init,
        },
        &HelloBody {
            id: ctx.local_id(),
            hostname: label.hostname,
            os: label.os,
            map,
        },
    )
    .await?;

    let ident: IdentBody = read_init(ctx, &link).await?.parse()?;

    let peer = Peer::new_direct(ident.id, link);
    let peer_label = NodeLabel {
        hostname: ident.hostname,
        os: ident.os,
    };
    Ok((peer, peer_label))
}
