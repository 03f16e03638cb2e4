//! File transfer over the command channel.
//!
//! Transfers negotiate once up front and then stream FileData frames on the
//! same tag through a windowed rendezvous, so the link reader applies the
//! usual back-pressure when the writing side lags. Chunk counts are
//! explicit (`ceil(size / chunk)`) on both directions; an exact multiple of
//! the chunk size produces no phantom trailing frame.

use crate::MAX_FILE_CHUNK;
use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::wire::{AckBody, CmdTag, DownloadRep, DownloadReq, FileDataBody, Frame, UploadReq};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use trellis_files::{FileAssembler, FileChunker};

/// Push a local file to `remote_path` on the agent at `dst`.
///
/// `progress` observes cumulative bytes sent.
///
/// # Errors
///
/// Local I/O errors, `NotRoutable`, `PeerGone`, `Timeout`, or `Protocol`
/// carrying the agent's error message.
pub async fn send_upload(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    local_path: &Path,
    remote_path: &str,
    deadline: Option<Duration>,
    mut progress: impl FnMut(u64),
) -> Result<()> {
    let mut chunker = FileChunker::open(local_path, MAX_FILE_CHUNK)?;

    let peer = ctx.peer_for(dst)?;
    let slot = peer.expect_stream(CmdTag::Upload)?;

    ctx.send_to(
        dst,
        CmdTag::Upload,
        &UploadReq {
            path: remote_path.to_string(),
            file_len: chunker.total_size(),
            chunk_count: chunker.num_chunks(),
        },
    )
    .await?;

    let ack: AckBody = slot.recv(deadline).await?.parse()?;
    if ack.success != 1 {
        return Err(Error::Protocol(format!("upload refused: {}", ack.msg)));
    }

    let mut sent = 0u64;
    while let Some(chunk) = chunker.read_chunk()? {
        sent += chunk.len() as u64;
        ctx.send_to(dst, CmdTag::Upload, &FileDataBody { data: chunk })
            .await?;
        progress(sent);
    }

    let done: AckBody = slot.recv(deadline).await?.parse()?;
    if done.success == 1 {
        Ok(())
    } else {
        Err(Error::Protocol(format!("upload failed: {}", done.msg)))
    }
}

pub(crate) async fn handle_upload(
    ctx: &Arc<OverlayContext>,
    from: Arc<Peer>,
    frame: Frame,
) -> Result<()> {
    let req: UploadReq = frame.parse()?;
    let admin = frame.header.src;

    let mut assembler = match FileAssembler::create(&req.path, req.file_len) {
        Ok(assembler) => assembler,
        Err(e) => {
            let ack = AckBody::fail(format!("{}: {e}", req.path));
            return ctx.send_to(admin, CmdTag::Upload, &ack).await;
        }
    };

    // Open the data window before acking so no chunk can race past it.
    let slot = from.expect_stream(CmdTag::Upload)?;
    ctx.send_to(admin, CmdTag::Upload, &AckBody::ok()).await?;

    let mut failure: Option<String> = None;
    for _ in 0..req.chunk_count {
        let chunk: FileDataBody = slot.recv(None).await?.parse()?;
        if failure.is_none() {
            if let Err(e) = assembler.write_chunk(&chunk.data) {
                // Keep draining the negotiated frames so the channel stays
                // in sync, then report the first failure.
                failure = Some(e.to_string());
            }
        }
    }
    drop(slot);

    let ack = match failure {
        Some(msg) => AckBody::fail(msg),
        None => match assembler.finish() {
            Ok(()) => {
                tracing::info!(path = %req.path, bytes = req.file_len, "upload stored");
                AckBody::ok()
            }
            Err(e) => AckBody::fail(e.to_string()),
        },
    };
    ctx.send_to(admin, CmdTag::Upload, &ack).await
}

/// Pull `remote_path` from the agent at `dst` into `local_path`.
///
/// `confirm` sees the negotiated file size and may abort the transfer
/// before any data moves; `progress` observes cumulative bytes received.
/// Returns `false` when `confirm` aborted.
///
/// # Errors
///
/// Same surface as [`send_upload`].
pub async fn send_download(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    remote_path: &str,
    local_path: &Path,
    deadline: Option<Duration>,
    confirm: impl FnOnce(u64) -> bool,
    mut progress: impl FnMut(u64),
) -> Result<bool> {
    let peer = ctx.peer_for(dst)?;
    let slot = peer.expect_stream(CmdTag::Download)?;

    // Size probe first; nothing streams until we ask again.
    ctx.send_to(
        dst,
        CmdTag::Download,
        &DownloadReq {
            path: remote_path.to_string(),
            still: 0,
        },
    )
    .await?;

    let probe: DownloadRep = slot.recv(deadline).await?.parse()?;
    if probe.success != 1 {
        return Err(Error::Protocol(format!("download refused: {}", probe.msg)));
    }
    if !confirm(probe.file_len) {
        return Ok(false);
    }

    let mut assembler = FileAssembler::create(local_path, probe.file_len)?;

    ctx.send_to(
        dst,
        CmdTag::Download,
        &DownloadReq {
            path: remote_path.to_string(),
            still: 1,
        },
    )
    .await?;

    let rep: DownloadRep = slot.recv(deadline).await?.parse()?;
    if rep.success != 1 {
        return Err(Error::Protocol(format!("download failed: {}", rep.msg)));
    }

    for _ in 0..rep.chunk_count {
        let chunk: FileDataBody = slot.recv(None).await?.parse()?;
        assembler.write_chunk(&chunk.data)?;
        progress(assembler.written());
    }
    assembler.finish()?;
    Ok(true)
}

pub(crate) async fn handle_download(ctx: &Arc<OverlayContext>, frame: Frame) -> Result<()> {
    let req: DownloadReq = frame.parse()?;
    let admin = frame.header.src;

    let mut chunker = match FileChunker::open(&req.path, MAX_FILE_CHUNK) {
        Ok(chunker) => chunker,
        Err(e) => {
            let rep = DownloadRep {
                success: 0,
                msg: format!("{}: {e}", req.path),
                file_len: 0,
                chunk_count: 0,
            };
            return ctx.send_to(admin, CmdTag::Download, &rep).await;
        }
    };

    let rep = DownloadRep {
        success: 1,
        msg: String::new(),
        file_len: chunker.total_size(),
        chunk_count: chunker.num_chunks(),
    };
    ctx.send_to(admin, CmdTag::Download, &rep).await?;

    if req.still == 0 {
        return Ok(());
    }

    while let Some(chunk) = chunker.read_chunk()? {
        ctx.send_to(admin, CmdTag::Download, &FileDataBody { data: chunk })
            .await?;
    }
    tracing::info!(path = %req.path, "download streamed");
    Ok(())
}
