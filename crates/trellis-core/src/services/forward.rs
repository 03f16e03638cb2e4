//! TCP port forwarding in both directions.
//!
//! RFORWARD: the admin listens locally; each accepted connection gets a
//! session and the agent dials the remote target for it.
//!
//! LFORWARD: the agent listens remotely; for each accepted connection it
//! allocates a session (the initiator is the sole allocator) and announces
//! it to the admin by echoing the rule fields, and the admin dials the
//! local target. The initial admin command carries session id 0 and no
//! reply frame.

use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::services::pump;
use crate::session::ServiceKind;
use crate::wire::{AckBody, CmdTag, DataBody, Frame, LForwardBody, RForwardReq};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Forward a local service to a remote listener: the agent at `dst` listens
/// on `dst_port`, and each accepted connection is piped to
/// `l_host:src_port` dialed here. Fire-and-forget: failures surface in the
/// agent's log and as immediately closed sessions.
///
/// # Errors
///
/// `NotRoutable` or `Transport` on the command send.
pub async fn send_lforward(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    l_host: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> Result<()> {
    ctx.send_to(
        dst,
        CmdTag::LForward,
        &LForwardBody {
            session: 0,
            src_port,
            l_host: u32::from(l_host),
            dst_port,
            start: 1,
        },
    )
    .await
}

/// Agent side: open the remote listener for an LFORWARD rule.
pub(crate) async fn handle_lforward_listen(
    ctx: &Arc<OverlayContext>,
    from: Arc<Peer>,
    frame: Frame,
) -> Result<()> {
    let req: LForwardBody = frame.parse()?;
    if req.start != 1 {
        return Ok(());
    }

    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, req.dst_port));
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(%bind, "lforward listener up");

    let ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let session = from.mux(ServiceKind::LForward).allocate();
                    let announce = LForwardBody { session, ..req };
                    if ctx
                        .send_to(from.id(), CmdTag::LForward, &announce)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    tokio::spawn(pump::run_session(
                        ctx.clone(),
                        from.clone(),
                        ServiceKind::LForward,
                        session,
                        stream,
                    ));
                }
                Err(e) => {
                    tracing::error!(error = %e, "lforward accept failed");
                    break;
                }
            }
        }
    });
    Ok(())
}

/// Admin side: an agent announced a fresh LFORWARD session; dial the local
/// target and pump.
pub(crate) async fn handle_lforward_open(
    ctx: &Arc<OverlayContext>,
    from: Arc<Peer>,
    frame: Frame,
) -> Result<()> {
    let req: LForwardBody = frame.parse()?;
    if req.session == 0 || req.start != 1 {
        return Err(Error::Protocol("bad lforward session announcement".into()));
    }

    let target = SocketAddr::from((Ipv4Addr::from(req.l_host), req.src_port));
    match TcpStream::connect(target).await {
        Ok(stream) => {
            pump::run_session(
                ctx.clone(),
                from,
                ServiceKind::LForward,
                req.session,
                stream,
            )
            .await;
            Ok(())
        }
        Err(e) => {
            let _ = ctx
                .send_data(
                    frame.header.src,
                    ServiceKind::LForward,
                    &DataBody::close_marker(req.session),
                )
                .await;
            Err(Error::Io(e))
        }
    }
}

/// Forward a remote service to a local listener: listen on `local`, and for
/// each accepted connection have the agent at `dst` dial
/// `r_host:src_port`. Returns the bound address; the accept loop runs in
/// the background.
///
/// # Errors
///
/// I/O error when the bind fails.
pub async fn serve_rforward(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    r_host: Ipv4Addr,
    src_port: u16,
    local: SocketAddr,
    deadline: Option<Duration>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(local).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, agent = %dst.short(), "rforward listener up");

    let ctx = ctx.clone();
    // Command issuance is strict request/reply per (peer, tag); session
    // setup serializes here while established sessions pump concurrently.
    let setup_gate = Arc::new(Mutex::new(()));

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((client, _)) => {
                    let ctx = ctx.clone();
                    let setup_gate = setup_gate.clone();
                    tokio::spawn(async move {
                        let outcome =
                            rforward_session(&ctx, dst, r_host, src_port, client, deadline, &setup_gate)
                                .await;
                        if let Err(e) = outcome {
                            tracing::debug!(error = %e, "rforward session ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "rforward accept failed");
                    break;
                }
            }
        }
    });

    Ok(local_addr)
}

async fn rforward_session(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    r_host: Ipv4Addr,
    src_port: u16,
    client: TcpStream,
    deadline: Option<Duration>,
    setup_gate: &Mutex<()>,
) -> Result<()> {
    let peer = ctx.peer_for(dst)?;
    let session = {
        let _setup = setup_gate.lock().await;
        let session = peer.mux(ServiceKind::RForward).allocate();

        let slot = peer.expect_reply(CmdTag::RForward)?;
        ctx.send_to(
            dst,
            CmdTag::RForward,
            &RForwardReq {
                session,
                start: 1,
                r_host: u32::from(r_host),
                src_port,
            },
        )
        .await?;

        let ack: AckBody = slot.recv(deadline).await?.parse()?;
        if ack.success != 1 {
            return Err(Error::Protocol(format!("rforward refused: {}", ack.msg)));
        }
        session
    };

    pump::run_session(ctx.clone(), peer, ServiceKind::RForward, session, client).await;
    Ok(())
}

/// Agent side: dial the remote target for one RFORWARD session.
pub(crate) async fn handle_rforward(
    ctx: &Arc<OverlayContext>,
    from: Arc<Peer>,
    frame: Frame,
) -> Result<()> {
    let req: RForwardReq = frame.parse()?;
    let admin = frame.header.src;

    if req.start != 1 {
        let ack = AckBody::fail("rforward start flag not set");
        return ctx.send_to(admin, CmdTag::RForward, &ack).await;
    }

    let target = SocketAddr::from((Ipv4Addr::from(req.r_host), req.src_port));
    let upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            let ack = AckBody::fail(format!("{target}: {e}"));
            return ctx.send_to(admin, CmdTag::RForward, &ack).await;
        }
    };

    ctx.send_to(admin, CmdTag::RForward, &AckBody::ok()).await?;
    pump::run_session(ctx.clone(), from, ServiceKind::RForward, req.session, upstream).await;
    Ok(())
}
