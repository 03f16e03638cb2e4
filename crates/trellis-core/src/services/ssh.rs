//! Joining a node through an operator-provisioned tunnel.
//!
//! Auth method 0 treats `host:port` as the TCP endpoint of a tunnel the
//! operator established out of band (an SSH forward landing on the target's
//! node listener); the agent dials it and runs normal initiator admission
//! through it. No SSH client stack is carried, so other auth methods are
//! refused with a clean failure reply.

use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::wire::{AckBody, CmdTag, Frame, SshConnectReq};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Authentication method for an operator-provisioned tunnel.
pub const AUTH_TUNNEL: u16 = 0;

/// Ask the agent at `dst` to join the node behind `host:port`.
///
/// On success the returned string is the admitted node's identity in hex.
///
/// # Errors
///
/// `NotRoutable`, `PeerGone`, `Timeout`, or `Protocol` carrying the agent's
/// error message.
#[allow(clippy::too_many_arguments)]
pub async fn send_ssh_connect(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    host: Ipv4Addr,
    port: u16,
    dport: u16,
    user: &str,
    auth_method: u16,
    auth_data: &[u8],
    deadline: Option<Duration>,
) -> Result<String> {
    let peer = ctx.peer_for(dst)?;
    let slot = peer.expect_reply(CmdTag::SshConnect)?;

    ctx.send_to(
        dst,
        CmdTag::SshConnect,
        &SshConnectReq {
            host: u32::from(host),
            port,
            dport,
            user: user.to_string(),
            auth_method,
            auth_data: auth_data.to_vec(),
        },
    )
    .await?;

    let ack: AckBody = slot.recv(deadline).await?.parse()?;
    if ack.success == 1 {
        Ok(ack.msg)
    } else {
        Err(Error::Protocol(format!("tunnel join failed: {}", ack.msg)))
    }
}

pub(crate) async fn handle_ssh_connect(ctx: &Arc<OverlayContext>, frame: Frame) -> Result<()> {
    let req: SshConnectReq = frame.parse()?;
    let admin = frame.header.src;

    if req.auth_method != AUTH_TUNNEL {
        let ack = AckBody::fail(format!(
            "auth method {} unsupported; provision a tunnel and use method 0",
            req.auth_method
        ));
        return ctx.send_to(admin, CmdTag::SshConnect, &ack).await;
    }

    let endpoint = SocketAddr::from((Ipv4Addr::from(req.host), req.port));
    let ack = match ctx.connect(endpoint).await {
        Ok(id) => {
            tracing::info!(peer = %id.short(), %endpoint, "joined through tunnel");
            AckBody {
                success: 1,
                msg: id.to_string(),
            }
        }
        Err(e) => AckBody::fail(format!("{endpoint}: {e}")),
    };
    ctx.send_to(admin, CmdTag::SshConnect, &ack).await
}
