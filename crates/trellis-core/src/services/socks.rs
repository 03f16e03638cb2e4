//! SOCKS proxy whose egress is a remote agent.
//!
//! The admin listens locally and opens one session per accepted client; the
//! agent answers the SOCKS5 dialect at the far end (greeting and CONNECT,
//! the subset the original serves), dials the target itself, and splices
//! the target connection into the session. Only the framing onto the
//! overlay is interesting here; the dialect handling is deliberately
//! minimal.

use crate::context::OverlayContext;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::services::pump;
use crate::session::{ServiceKind, SessionQueue};
use crate::wire::{AckBody, CmdTag, DataBody, Frame, SocksReq};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

const REPLY_OK: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_UNSUPPORTED: u8 = 0x07;
const REPLY_ATYP_UNSUPPORTED: u8 = 0x08;

/// Start a local SOCKS5 listener whose egress is the agent at `dst`.
/// Returns the bound address; the accept loop runs in the background.
///
/// # Errors
///
/// I/O error when the bind fails.
pub async fn serve_socks(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    addr: SocketAddr,
    deadline: Option<Duration>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, agent = %dst.short(), "socks proxy up");

    let ctx = ctx.clone();
    // Command issuance is strict request/reply per (peer, tag); session
    // setup serializes here while established sessions pump concurrently.
    let setup_gate = Arc::new(tokio::sync::Mutex::new(()));

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((client, _)) => {
                    let ctx = ctx.clone();
                    let setup_gate = setup_gate.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            client_session(&ctx, dst, client, deadline, &setup_gate).await
                        {
                            tracing::debug!(error = %e, "socks client session ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "socks accept failed");
                    break;
                }
            }
        }
    });

    Ok(local_addr)
}

async fn client_session(
    ctx: &Arc<OverlayContext>,
    dst: NodeId,
    client: TcpStream,
    deadline: Option<Duration>,
    setup_gate: &tokio::sync::Mutex<()>,
) -> Result<()> {
    let peer = ctx.peer_for(dst)?;
    let session = {
        let _setup = setup_gate.lock().await;
        let session = peer.mux(ServiceKind::Socks).allocate();

        let slot = peer.expect_reply(CmdTag::Socks)?;
        ctx.send_to(dst, CmdTag::Socks, &SocksReq { session, start: 1 })
            .await?;
        let ack: AckBody = slot.recv(deadline).await?.parse()?;
        if ack.success != 1 {
            return Err(Error::Protocol(format!("socks refused: {}", ack.msg)));
        }
        session
    };

    pump::run_session(ctx.clone(), peer, ServiceKind::Socks, session, client).await;
    Ok(())
}

pub(crate) async fn handle_socks(
    ctx: &Arc<OverlayContext>,
    from: Arc<Peer>,
    frame: Frame,
) -> Result<()> {
    let req: SocksReq = frame.parse()?;
    let admin = frame.header.src;

    if req.start != 1 {
        let ack = AckBody::fail("socks start flag not set");
        return ctx.send_to(admin, CmdTag::Socks, &ack).await;
    }

    let queue = from.mux(ServiceKind::Socks).open(req.session);
    ctx.send_to(admin, CmdTag::Socks, &AckBody::ok()).await?;

    let outcome = proxy_session(ctx, admin, req.session, queue).await;
    let _ = ctx
        .send_data(
            admin,
            ServiceKind::Socks,
            &DataBody::close_marker(req.session),
        )
        .await;
    from.mux(ServiceKind::Socks).release(req.session);
    outcome
}

async fn proxy_session(
    ctx: &Arc<OverlayContext>,
    admin: NodeId,
    session: u16,
    queue: Arc<SessionQueue>,
) -> Result<()> {
    let mut negotiation = SessionReader::new(queue.clone());

    // Greeting: VER NMETHODS METHODS...
    let ver = negotiation.read_u8().await?;
    if ver != SOCKS_VERSION {
        return Err(Error::Protocol("not a socks5 greeting".into()));
    }
    let nmethods = negotiation.read_u8().await? as usize;
    let _methods = negotiation.read_exact(nmethods).await?;
    send_chunk(ctx, admin, session, vec![SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT
    let head = negotiation.read_exact(4).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Protocol("bad socks5 request version".into()));
    }
    if head[1] != CMD_CONNECT {
        send_chunk(ctx, admin, session, reply(REPLY_COMMAND_UNSUPPORTED)).await?;
        return Err(Error::Protocol("unsupported socks command".into()));
    }

    let target: String = match head[3] {
        ATYP_IPV4 => {
            let addr = negotiation.read_exact(4).await?;
            let port = negotiation.read_port().await?;
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            format!("{ip}:{port}")
        }
        ATYP_DOMAIN => {
            let len = negotiation.read_u8().await? as usize;
            let name = negotiation.read_exact(len).await?;
            let port = negotiation.read_port().await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::Protocol("bad domain in socks request".into()))?;
            format!("{name}:{port}")
        }
        _ => {
            send_chunk(ctx, admin, session, reply(REPLY_ATYP_UNSUPPORTED)).await?;
            return Err(Error::Protocol("unsupported socks address type".into()));
        }
    };

    let upstream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            send_chunk(ctx, admin, session, reply(REPLY_HOST_UNREACHABLE)).await?;
            return Err(Error::Io(e));
        }
    };
    send_chunk(ctx, admin, session, reply(REPLY_OK)).await?;
    tracing::debug!(%target, session, "socks egress connected");

    let leftover = negotiation.into_leftover();
    let (upstream_read, mut upstream_write) = upstream.into_split();
    if !leftover.is_empty() {
        upstream_write.write_all(&leftover).await?;
    }

    let outbound = tokio::spawn(pump::stream_to_frames(
        ctx.clone(),
        admin,
        ServiceKind::Socks,
        session,
        upstream_read,
        queue.clone(),
    ));
    pump::frames_to_stream(queue, upstream_write).await;
    let _ = outbound.await;
    Ok(())
}

fn reply(code: u8) -> Vec<u8> {
    vec![SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

async fn send_chunk(
    ctx: &Arc<OverlayContext>,
    admin: NodeId,
    session: u16,
    data: Vec<u8>,
) -> Result<()> {
    ctx.send_data(
        admin,
        ServiceKind::Socks,
        &DataBody {
            session,
            data,
            close: 0,
        },
    )
    .await
}

/// Byte-granular reads over a session queue for protocol negotiation; the
/// splice pumps take over whatever is left unconsumed.
struct SessionReader {
    queue: Arc<SessionQueue>,
    buf: Vec<u8>,
    pos: usize,
}

impl SessionReader {
    fn new(queue: Arc<SessionQueue>) -> Self {
        Self {
            queue,
            buf: Vec::new(),
            pos: 0,
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if self.pos < self.buf.len() {
            return Ok(());
        }
        match self.queue.read().await {
            Some(chunk) => {
                self.buf = chunk;
                self.pos = 0;
                Ok(())
            }
            None => Err(Error::Protocol("session closed during negotiation".into())),
        }
    }

    async fn read_u8(&mut self) -> Result<u8> {
        self.fill().await?;
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            self.fill().await?;
            let available = &self.buf[self.pos..];
            let take = available.len().min(n - out.len());
            out.extend_from_slice(&available[..take]);
            self.pos += take;
        }
        Ok(out)
    }

    async fn read_port(&mut self) -> Result<u16> {
        let bytes = self.read_exact(2).await?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn into_leftover(self) -> Vec<u8> {
        self.buf[self.pos..].to_vec()
    }
}
