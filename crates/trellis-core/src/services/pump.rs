//! Session pump tasks.
//!
//! Each active session runs at most two pumps: stream→frame wraps local
//! bytes into data frames toward the remote end, frame→stream drains the
//! session queue into the local stream. The stream→frame pump also watches
//! the session's close flag so a remote close stops local reads without
//! tearing the socket down mid-frame.

use crate::DATA_CHUNK_SIZE;
use crate::context::OverlayContext;
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::session::{ServiceKind, SessionQueue};
use crate::wire::DataBody;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read the local stream and wrap payloads in data frames until local EOF,
/// a send failure, or a close of the session from the other side. Always
/// sends one close marker on the way out.
pub(crate) async fn stream_to_frames<R: AsyncRead + Unpin>(
    ctx: Arc<OverlayContext>,
    dst: NodeId,
    service: ServiceKind,
    session: u16,
    mut reader: R,
    queue: Arc<SessionQueue>,
) {
    let mut buf = vec![0u8; DATA_CHUNK_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let body = DataBody {
                            session,
                            data: buf[..n].to_vec(),
                            close: 0,
                        };
                        if ctx.send_data(dst, service, &body).await.is_err() {
                            break;
                        }
                    }
                }
            }
            () = queue.closed() => break,
        }
    }

    let _ = ctx
        .send_data(dst, service, &DataBody::close_marker(session))
        .await;
}

/// Drain the session queue into the local stream until end of session or a
/// write failure, then shut the write side down.
pub(crate) async fn frames_to_stream<W: AsyncWrite + Unpin>(
    queue: Arc<SessionQueue>,
    mut writer: W,
) {
    while let Some(chunk) = queue.read().await {
        if writer.write_all(&chunk).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Run one socket-backed session to completion and release it.
pub(crate) async fn run_session(
    ctx: Arc<OverlayContext>,
    peer: Arc<Peer>,
    service: ServiceKind,
    session: u16,
    stream: TcpStream,
) {
    let queue = peer.mux(service).open(session);
    let (read_half, write_half) = stream.into_split();

    let outbound = tokio::spawn(stream_to_frames(
        ctx.clone(),
        peer.id(),
        service,
        session,
        read_half,
        queue.clone(),
    ));
    let inbound = tokio::spawn(frames_to_stream(queue, write_half));

    let _ = outbound.await;
    let _ = inbound.await;

    peer.mux(service).release(session);
    tracing::debug!(peer = %peer.id().short(), ?service, session, "session released");
}
