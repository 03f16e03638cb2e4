//! Peer records and the framed links beneath them.
//!
//! A direct peer owns its TCP stream; an indirect peer borrows the link of
//! the direct peer that is its current next hop, and is re-pointed whenever
//! the routing table changes. Exactly one link-reader task owns the read
//! half of each direct link; any number of producers share the write half
//! through the write guard, under which a frame is atomic on the wire.

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::mailbox::{CommandMailbox, Mailboxes};
use crate::session::{ServiceKind, SessionMux};
use crate::wire::{self, CmdTag, Frame, FrameHeader, WireBody};
use crate::{FILE_WINDOW_DEPTH, MAX_FRAME_SIZE, PROTOCOL_SEPARATOR, SESSION_QUEUE_DEPTH};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use trellis_crypto::{FrameSealer, NONCE_SIZE};

/// One direct byte stream with its read and write guards.
pub struct Link {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    remote_addr: Option<SocketAddr>,
}

impl Link {
    /// Wrap a connected TCP stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote_addr,
        }
    }

    /// The remote socket address, when known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Read one frame from the stream. Holds the read guard for the whole
    /// frame; only the link-reader task (or admission) calls this.
    ///
    /// # Errors
    ///
    /// `Transport` on stream failure or EOF, plus the codec failure modes.
    pub async fn read_frame(&self, sealer: &FrameSealer) -> Result<Frame> {
        let mut reader = self.reader.lock().await;

        let mut separator = [0u8; 4];
        read_exact(&mut reader, &mut separator).await?;
        if separator != PROTOCOL_SEPARATOR {
            return Err(Error::MalformedFrame("bad separator"));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        read_exact(&mut reader, &mut nonce).await?;

        let mut len_bytes = [0u8; 4];
        read_exact(&mut reader, &mut len_bytes).await?;
        let ct_len = u32::from_be_bytes(len_bytes) as usize;
        if ct_len > MAX_FRAME_SIZE {
            return Err(Error::MalformedFrame("oversized frame"));
        }

        let mut ct = vec![0u8; ct_len];
        read_exact(&mut reader, &mut ct).await?;

        wire::open_sealed(sealer, &nonce, &ct)
    }

    /// Seal and write one frame. The write guard makes the frame atomic on
    /// the wire; producers on different links do not contend.
    ///
    /// # Errors
    ///
    /// `Transport` on stream failure.
    pub async fn write_frame(
        &self,
        sealer: &FrameSealer,
        header: &FrameHeader,
        body: &impl WireBody,
    ) -> Result<()> {
        self.write_raw(sealer, header, &wire::encode_body(body))
            .await
    }

    /// Seal and write a frame from already-encoded body bytes, used by the
    /// dispatcher to re-frame forwarded packets without reinterpreting them.
    ///
    /// # Errors
    ///
    /// `Transport` on stream failure.
    pub async fn write_raw(
        &self,
        sealer: &FrameSealer,
        header: &FrameHeader,
        body_bytes: &[u8],
    ) -> Result<()> {
        let bytes = wire::encode(sealer, header, body_bytes)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

async fn read_exact(reader: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| Error::Transport(e.to_string()))
}

/// One known node of the overlay.
pub struct Peer {
    id: NodeId,
    direct: bool,
    link: StdRwLock<Arc<Link>>,
    mailboxes: Mailboxes,
    muxes: [Arc<SessionMux>; 4],
    closed: watch::Sender<bool>,
}

impl Peer {
    fn new(id: NodeId, link: Arc<Link>, direct: bool) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            direct,
            link: StdRwLock::new(link),
            mailboxes: Mailboxes::new(),
            muxes: std::array::from_fn(|_| Arc::new(SessionMux::new(SESSION_QUEUE_DEPTH))),
            closed,
        })
    }

    /// A peer reachable over a byte stream this process owns.
    pub fn new_direct(id: NodeId, link: Arc<Link>) -> Arc<Self> {
        Self::new(id, link, true)
    }

    /// A peer reachable only by forwarding through a direct peer, borrowing
    /// that peer's link.
    pub fn new_indirect(id: NodeId, via: Arc<Link>) -> Arc<Self> {
        Self::new(id, via, false)
    }

    /// The peer's identity.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// True for peers with an owned byte stream.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// The link frames to this peer are written to.
    #[must_use]
    pub fn link(&self) -> Arc<Link> {
        self.link.read().expect("link lock poisoned").clone()
    }

    /// Re-point an indirect peer at a new next-hop link.
    pub fn set_link(&self, link: Arc<Link>) {
        *self.link.write().expect("link lock poisoned") = link;
    }

    /// The session multiplexer for one service.
    #[must_use]
    pub fn mux(&self, kind: ServiceKind) -> &Arc<SessionMux> {
        &self.muxes[kind.index()]
    }

    /// Send a body to this peer over its current link.
    ///
    /// # Errors
    ///
    /// `Transport` on stream failure.
    pub async fn send(
        &self,
        sealer: &FrameSealer,
        src: NodeId,
        tag: CmdTag,
        body: &impl WireBody,
    ) -> Result<()> {
        let header = FrameHeader {
            src,
            dst: self.id,
            tag,
        };
        self.link().write_frame(sealer, &header, body).await
    }

    /// Open the request/reply rendezvous for `tag`: the next inbound frame
    /// with this tag from this peer is a reply, not a request.
    ///
    /// # Errors
    ///
    /// Protocol error when a rendezvous for the tag is already open.
    pub fn expect_reply(self: &Arc<Self>, tag: CmdTag) -> Result<ReplySlot> {
        self.expect(tag, 1, false)
    }

    /// Open a windowed rendezvous for a FileData stream on `tag`.
    ///
    /// # Errors
    ///
    /// Protocol error when a rendezvous for the tag is already open.
    pub fn expect_stream(self: &Arc<Self>, tag: CmdTag) -> Result<ReplySlot> {
        self.expect(tag, FILE_WINDOW_DEPTH, true)
    }

    fn expect(self: &Arc<Self>, tag: CmdTag, depth: usize, blocking: bool) -> Result<ReplySlot> {
        let mailbox = self.mailboxes.open(tag, depth, blocking)?;
        Ok(ReplySlot {
            peer: self.clone(),
            tag,
            mailbox,
        })
    }

    /// Deliver an inbound frame into the open mailbox for its tag, if any.
    pub(crate) async fn deliver(&self, tag: CmdTag, frame: Frame) -> Result<bool> {
        self.mailboxes.deliver(tag, frame).await
    }

    /// Mark the peer dead: close every session and fail every outstanding
    /// mailbox read with `PeerGone`.
    pub fn mark_closed(&self) {
        let _ = self.closed.send(true);
        for mux in &self.muxes {
            mux.close_all();
        }
    }

    /// True once the peer was marked dead.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// An open rendezvous on one (peer, tag). Dropping it closes the mailbox.
pub struct ReplySlot {
    peer: Arc<Peer>,
    tag: CmdTag,
    mailbox: Arc<CommandMailbox>,
}

impl ReplySlot {
    /// Await the next frame, failing with `PeerGone` when the owning peer
    /// dies or `Timeout` when an optional deadline passes.
    ///
    /// # Errors
    ///
    /// `PeerGone`, `Timeout`.
    pub async fn recv(&self, deadline: Option<Duration>) -> Result<Frame> {
        let inner = self.recv_inner();
        match deadline {
            Some(d) => tokio::time::timeout(d, inner)
                .await
                .map_err(|_| Error::Timeout)?,
            None => inner.await,
        }
    }

    async fn recv_inner(&self) -> Result<Frame> {
        let mut closed = self.peer.closed_signal();
        tokio::select! {
            frame = self.mailbox.recv() => {
                frame.ok_or(Error::PeerGone(self.peer.id()))
            }
            _ = closed.wait_for(|c| *c) => {
                // Pick up a reply that raced the shutdown before failing.
                self.mailbox
                    .try_recv()
                    .ok_or(Error::PeerGone(self.peer.id()))
            }
        }
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        self.peer.mailboxes.close(self.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ListenReq;
    use trellis_crypto::LinkSecret;

    fn sealer() -> FrameSealer {
        FrameSealer::new(LinkSecret::from_passphrase("peer tests").seal_key())
    }

    async fn link_pair() -> (Arc<Link>, Arc<Link>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            Arc::new(Link::new(a.unwrap())),
            Arc::new(Link::new(b.unwrap().0)),
        )
    }

    #[tokio::test]
    async fn test_frame_over_link() {
        let sealer = sealer();
        let (a, b) = link_pair().await;

        let header = FrameHeader {
            src: NodeId::from_bytes([1u8; 32]),
            dst: NodeId::from_bytes([2u8; 32]),
            tag: CmdTag::Listen,
        };
        a.write_frame(&sealer, &header, &ListenReq { port: 9000 })
            .await
            .unwrap();

        let frame = b.read_frame(&sealer).await.unwrap();
        assert_eq!(frame.header, header);
        assert_eq!(frame.parse::<ListenReq>().unwrap().port, 9000);
    }

    #[tokio::test]
    async fn test_eof_is_transport_error() {
        let sealer = sealer();
        let (a, b) = link_pair().await;
        drop(a);
        assert!(matches!(
            b.read_frame(&sealer).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let sealer = sealer();
        let (a, b) = link_pair().await;

        {
            let mut writer = a.writer.lock().await;
            writer.write_all(&[0u8; 64]).await.unwrap();
            writer.flush().await.unwrap();
        }
        assert!(matches!(
            b.read_frame(&sealer).await,
            Err(Error::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_slot_peer_gone() {
        let (a, _b) = link_pair().await;
        let peer = Peer::new_direct(NodeId::from_bytes([3u8; 32]), a);

        let slot = peer.expect_reply(CmdTag::Listen).unwrap();
        let waiter = tokio::spawn(async move { slot.recv(None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.mark_closed();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(got, Err(Error::PeerGone(_))));
    }

    #[tokio::test]
    async fn test_reply_slot_deadline() {
        let (a, _b) = link_pair().await;
        let peer = Peer::new_direct(NodeId::from_bytes([3u8; 32]), a);

        let slot = peer.expect_reply(CmdTag::Listen).unwrap();
        let got = slot.recv(Some(Duration::from_millis(30))).await;
        assert!(matches!(got, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_slot_drop_reopens_tag() {
        let (a, _b) = link_pair().await;
        let peer = Peer::new_direct(NodeId::from_bytes([3u8; 32]), a);

        let slot = peer.expect_reply(CmdTag::Listen).unwrap();
        assert!(peer.expect_reply(CmdTag::Listen).is_err());
        drop(slot);
        assert!(peer.expect_reply(CmdTag::Listen).is_ok());
    }
}
