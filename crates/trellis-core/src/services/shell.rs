//! Interactive shell over a SHELLDATA session.
//!
//! The shell body carries no session id; one interactive shell runs per
//! peer pair, on the reserved session id 0.

use crate::DATA_CHUNK_SIZE;
use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::services::pump;
use crate::session::ServiceKind;
use crate::wire::{AckBody, CmdTag, DataBody, Frame, ShellReq};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Command;

/// The single interactive shell session per peer pair.
const SHELL_SESSION: u16 = 0;

#[cfg(unix)]
const SHELL_PROGRAM: &str = "/bin/sh";
#[cfg(windows)]
const SHELL_PROGRAM: &str = "cmd.exe";

/// Attach `input`/`output` to a shell on the agent at `dst`. Returns when
/// the remote shell exits or either side closes the session.
///
/// # Errors
///
/// `NotRoutable`, `PeerGone`, `Timeout`, or `Protocol` when the agent
/// refuses to start a shell.
pub async fn run_shell<I, O>(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    input: I,
    output: O,
    deadline: Option<Duration>,
) -> Result<()>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin,
{
    let peer = ctx.peer_for(dst)?;
    let slot = peer.expect_reply(CmdTag::Shell)?;

    ctx.send_to(dst, CmdTag::Shell, &ShellReq { start: 1 }).await?;
    let ack: AckBody = slot.recv(deadline).await?.parse()?;
    if ack.success != 1 {
        return Err(Error::Protocol(format!("shell refused: {}", ack.msg)));
    }
    drop(slot);

    let queue = peer.mux(ServiceKind::Shell).open(SHELL_SESSION);
    let outbound = tokio::spawn(pump::stream_to_frames(
        ctx.clone(),
        dst,
        ServiceKind::Shell,
        SHELL_SESSION,
        input,
        queue.clone(),
    ));

    pump::frames_to_stream(queue, output).await;

    let _ = outbound.await;
    peer.mux(ServiceKind::Shell).release(SHELL_SESSION);
    Ok(())
}

/// Copy one shell output stream into data frames, without closing the
/// session: the shell session closes once stdout and stderr both end.
async fn copy_output<R: AsyncRead + Unpin>(
    ctx: Arc<OverlayContext>,
    dst: NodeId,
    mut reader: R,
) {
    let mut buf = vec![0u8; DATA_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let body = DataBody {
                    session: SHELL_SESSION,
                    data: buf[..n].to_vec(),
                    close: 0,
                };
                if ctx.send_data(dst, ServiceKind::Shell, &body).await.is_err() {
                    break;
                }
            }
        }
    }
}

pub(crate) async fn handle_shell(
    ctx: &Arc<OverlayContext>,
    from: Arc<Peer>,
    frame: Frame,
) -> Result<()> {
    let req: ShellReq = frame.parse()?;
    let admin = frame.header.src;

    if req.start != 1 {
        let ack = AckBody::fail("shell start flag not set");
        return ctx.send_to(admin, CmdTag::Shell, &ack).await;
    }

    let mut child = match Command::new(SHELL_PROGRAM)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let ack = AckBody::fail(format!("{SHELL_PROGRAM}: {e}"));
            return ctx.send_to(admin, CmdTag::Shell, &ack).await;
        }
    };

    let stdin = child.stdin.take().ok_or_else(|| Error::Io(missing_pipe()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Io(missing_pipe()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Io(missing_pipe()))?;

    ctx.send_to(admin, CmdTag::Shell, &AckBody::ok()).await?;
    tracing::info!(admin = %admin.short(), "shell session started");

    let queue = from.mux(ServiceKind::Shell).open(SHELL_SESSION);

    let inbound = tokio::spawn(pump::frames_to_stream(queue, stdin));
    let out_pump = tokio::spawn(copy_output(ctx.clone(), admin, stdout));
    let err_pump = tokio::spawn(copy_output(ctx.clone(), admin, stderr));

    let _ = out_pump.await;
    let _ = err_pump.await;

    let _ = ctx
        .send_data(
            admin,
            ServiceKind::Shell,
            &DataBody::close_marker(SHELL_SESSION),
        )
        .await;
    let _ = child.wait().await;

    // Releasing closes the queue, which ends the stdin pump.
    from.mux(ServiceKind::Shell).release(SHELL_SESSION);
    let _ = inbound.await;

    tracing::info!(admin = %admin.short(), "shell session ended");
    Ok(())
}

fn missing_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child pipe missing")
}
