//! LISTEN and CONNECT: growing the overlay from a remote agent.
//!
//! LISTEN binds a node listener on the agent so further nodes can dial in;
//! CONNECT makes the agent dial out and admit the target. Both reply with a
//! success flag and an error message.

use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::wire::{AckBody, CmdTag, ConnectReq, Frame, ListenReq};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Ask the agent at `dst` to open a node listener on `port`.
///
/// # Errors
///
/// `NotRoutable`, `PeerGone`, `Timeout`, or `Protocol` carrying the agent's
/// error message.
pub async fn send_listen(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    port: u16,
    deadline: Option<Duration>,
) -> Result<()> {
    let peer = ctx.peer_for(dst)?;
    let slot = peer.expect_reply(CmdTag::Listen)?;

    ctx.send_to(dst, CmdTag::Listen, &ListenReq { port }).await?;

    let ack: AckBody = slot.recv(deadline).await?.parse()?;
    if ack.success == 1 {
        Ok(())
    } else {
        Err(Error::Protocol(format!("remote listen failed: {}", ack.msg)))
    }
}

pub(crate) async fn handle_listen(ctx: &Arc<OverlayContext>, frame: Frame) -> Result<()> {
    let req: ListenReq = frame.parse()?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, req.port));

    let ack = match ctx.listen(addr).await {
        Ok(bound) => {
            tracing::info!(%bound, "listener opened by remote command");
            AckBody::ok()
        }
        Err(e) => AckBody::fail(e.to_string()),
    };
    ctx.send_to(frame.header.src, CmdTag::Listen, &ack).await
}

/// Ask the agent at `dst` to dial `addr:port` and admit the target node.
///
/// # Errors
///
/// Same surface as [`send_listen`].
pub async fn send_connect(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    addr: Ipv4Addr,
    port: u16,
    deadline: Option<Duration>,
) -> Result<()> {
    let peer = ctx.peer_for(dst)?;
    let slot = peer.expect_reply(CmdTag::Connect)?;

    ctx.send_to(
        dst,
        CmdTag::Connect,
        &ConnectReq {
            addr: u32::from(addr),
            port,
        },
    )
    .await?;

    let ack: AckBody = slot.recv(deadline).await?.parse()?;
    if ack.success == 1 {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "remote connect failed: {}",
            ack.msg
        )))
    }
}

pub(crate) async fn handle_connect(ctx: &Arc<OverlayContext>, frame: Frame) -> Result<()> {
    let req: ConnectReq = frame.parse()?;
    let target = SocketAddr::from((Ipv4Addr::from(req.addr), req.port));

    let ack = match ctx.connect(target).await {
        Ok(id) => {
            tracing::info!(peer = %id.short(), %target, "admitted by remote command");
            AckBody::ok()
        }
        Err(e) => AckBody::fail(e.to_string()),
    };
    ctx.send_to(frame.header.src, CmdTag::Connect, &ack).await
}
