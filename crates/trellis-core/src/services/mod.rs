//! Service glue: thin consumers of the overlay core.
//!
//! Every service follows the same shape: build a command body, send it
//! toward the destination identity along the next hop, await the reply on
//! the local rendezvous for that (peer, tag). Data services then run two
//! pumps per session, stream→frame and frame→stream; either pump ending
//! sends one close frame and releases the session.
//!
//! Commands with no open rendezvous are inbound requests and are dispatched
//! here by role: agents execute them, the admin accepts only LFORWARD
//! session-open notifications.

pub mod admit;
pub mod file;
pub mod forward;
pub mod pump;
pub mod shell;
pub mod socks;
pub mod ssh;
pub mod sync;

use crate::context::{OverlayContext, Role};
use crate::error::Result;
use crate::peer::Peer;
use crate::wire::{CmdTag, Frame};
use std::sync::Arc;

/// Dispatch an unsolicited command frame to the role's handlers.
///
/// Runs in its own task so long-lived handlers (shell, transfers) never
/// stall the link reader.
pub(crate) fn handle_request(ctx: &Arc<OverlayContext>, from: Arc<Peer>, frame: Frame) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let tag = frame.header.tag;
        let src = frame.header.src;
        let outcome = match ctx.role() {
            Role::Agent => agent_dispatch(&ctx, from, frame).await,
            Role::Admin => admin_dispatch(&ctx, from, frame).await,
        };
        if let Err(e) = outcome {
            tracing::warn!(%src, ?tag, error = %e, "command handler failed");
        }
    });
}

async fn agent_dispatch(ctx: &Arc<OverlayContext>, from: Arc<Peer>, frame: Frame) -> Result<()> {
    match frame.header.tag {
        CmdTag::Sync => sync::handle_sync(ctx, from, frame).await,
        CmdTag::Listen => admit::handle_listen(ctx, frame).await,
        CmdTag::Connect => admit::handle_connect(ctx, frame).await,
        CmdTag::SshConnect => ssh::handle_ssh_connect(ctx, frame).await,
        CmdTag::Upload => file::handle_upload(ctx, from, frame).await,
        CmdTag::Download => file::handle_download(ctx, frame).await,
        CmdTag::Shell => shell::handle_shell(ctx, from, frame).await,
        CmdTag::Socks => socks::handle_socks(ctx, from, frame).await,
        CmdTag::LForward => forward::handle_lforward_listen(ctx, from, frame).await,
        CmdTag::RForward => forward::handle_rforward(ctx, from, frame).await,
        other => {
            tracing::warn!(?other, "agent cannot execute this tag");
            Ok(())
        }
    }
}

async fn admin_dispatch(ctx: &Arc<OverlayContext>, from: Arc<Peer>, frame: Frame) -> Result<()> {
    match frame.header.tag {
        CmdTag::LForward => forward::handle_lforward_open(ctx, from, frame).await,
        other => {
            tracing::warn!(?other, src = %frame.header.src.short(), "unexpected command at admin");
            Ok(())
        }
    }
}
