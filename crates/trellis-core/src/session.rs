//! Per-peer session data channels.
//!
//! Each (peer, service) pair owns a [`SessionMux`]: a map from session id to
//! an ordered, bounded byte queue with a close flag. Session ids are
//! allocated atomically by whichever side initiates the session, which makes
//! the initiator the sole allocator and rules out collisions.
//!
//! Queues are bounded. When a queue is full the link reader blocks on
//! `push`, and that back-pressure propagates to the TCP stream feeding the
//! link — the desired global flow control. Queues are independent per
//! session; one full queue does not disturb another session's delivery.

use crate::wire::CmdTag;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::{Mutex, mpsc, watch};

/// The session-carrying services multiplexed over the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// SOCKS proxy sessions
    Socks,
    /// Remote-to-local forward sessions
    RForward,
    /// Interactive shell session
    Shell,
    /// Local-to-remote forward sessions
    LForward,
}

impl ServiceKind {
    /// Every service kind, in data-tag order.
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::Socks,
        ServiceKind::RForward,
        ServiceKind::Shell,
        ServiceKind::LForward,
    ];

    /// The wire tag carrying this service's session data.
    #[must_use]
    pub fn data_tag(self) -> CmdTag {
        match self {
            ServiceKind::Socks => CmdTag::SocksData,
            ServiceKind::RForward => CmdTag::RForwardData,
            ServiceKind::Shell => CmdTag::ShellData,
            ServiceKind::LForward => CmdTag::LForwardData,
        }
    }

    /// The service a data tag belongs to.
    #[must_use]
    pub fn from_data_tag(tag: CmdTag) -> Option<Self> {
        match tag {
            CmdTag::SocksData => Some(ServiceKind::Socks),
            CmdTag::RForwardData => Some(ServiceKind::RForward),
            CmdTag::ShellData => Some(ServiceKind::Shell),
            CmdTag::LForwardData => Some(ServiceKind::LForward),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ServiceKind::Socks => 0,
            ServiceKind::RForward => 1,
            ServiceKind::Shell => 2,
            ServiceKind::LForward => 3,
        }
    }
}

/// One session's ordered byte queue plus its close signal.
pub struct SessionQueue {
    tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl SessionQueue {
    fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        let (closed, _) = watch::channel(false);
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed,
        }
    }

    /// Append bytes, waking any waiting reader. Blocks while the queue is
    /// full. Data pushed after close is dropped.
    pub async fn push(&self, bytes: Vec<u8>) {
        let sender = self.tx.lock().expect("queue lock poisoned").clone();
        if let Some(sender) = sender {
            // A send error means the receiver half was released; the
            // session is over either way.
            let _ = sender.send(bytes).await;
        }
    }

    /// Read the next chunk, or `None` once the session is closed and
    /// drained (end of session).
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    /// Set the close flag and wake all readers. Buffered data remains
    /// readable until drained.
    pub fn close(&self) {
        self.tx.lock().expect("queue lock poisoned").take();
        let _ = self.closed.send(true);
    }

    /// True once either side has closed the session.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the session is marked closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // Outlives the borrow so a send between borrow and wait is not lost.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Session multiplexer for one (peer, service) pair.
pub struct SessionMux {
    sessions: DashMap<u16, Arc<SessionQueue>>,
    next_id: AtomicU16,
    depth: usize,
}

impl SessionMux {
    /// Create an empty multiplexer with the given per-session queue depth.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU16::new(1),
            depth,
        }
    }

    /// Allocate the next session id. Only the initiating side allocates.
    pub fn allocate(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Install (or fetch) the queue for a session. Creation is atomic, so
    /// an `open` always happens-before any `push` for the same id.
    pub fn open(&self, session: u16) -> Arc<SessionQueue> {
        self.sessions
            .entry(session)
            .or_insert_with(|| Arc::new(SessionQueue::new(self.depth)))
            .clone()
    }

    /// Fetch an existing session queue.
    #[must_use]
    pub fn get(&self, session: u16) -> Option<Arc<SessionQueue>> {
        self.sessions.get(&session).map(|e| e.value().clone())
    }

    /// Append payload bytes to a session, creating it on first sight.
    pub async fn push(&self, session: u16, bytes: Vec<u8>) {
        self.open(session).push(bytes).await;
    }

    /// Mark a session closed. Unknown ids are ignored.
    pub fn close(&self, session: u16) {
        if let Some(queue) = self.get(session) {
            queue.close();
        }
    }

    /// Remove a session entry once both endpoints have drained it.
    pub fn release(&self, session: u16) {
        if let Some((_, queue)) = self.sessions.remove(&session) {
            queue.close();
        }
    }

    /// Close every session, e.g. when the owning peer is dropped.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }

    /// Number of live session entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_then_read_in_order() {
        let mux = SessionMux::new(8);
        mux.push(1, b"HELLO\n".to_vec()).await;
        mux.push(1, b"WORLD\n".to_vec()).await;

        let queue = mux.get(1).unwrap();
        assert_eq!(queue.read().await.unwrap(), b"HELLO\n");
        assert_eq!(queue.read().await.unwrap(), b"WORLD\n");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let mux = SessionMux::new(8);
        mux.push(1, b"tail".to_vec()).await;
        mux.close(1);

        let queue = mux.get(1).unwrap();
        assert!(queue.is_closed());
        assert_eq!(queue.read().await.unwrap(), b"tail");
        assert!(queue.read().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let mux = Arc::new(SessionMux::new(8));
        let queue = mux.open(1);

        let reader = tokio::spawn({
            let queue = queue.clone();
            async move { queue.read().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mux.close(1);

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let mux = Arc::new(SessionMux::new(2));
        mux.push(1, vec![1]).await;
        mux.push(1, vec![2]).await;

        let blocked = {
            let mux = mux.clone();
            tokio::spawn(async move {
                mux.push(1, vec![3]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // Draining one chunk unblocks the writer.
        let queue = mux.get(1).unwrap();
        assert_eq!(queue.read().await.unwrap(), vec![1]);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let mux = Arc::new(SessionMux::new(1));
        mux.push(1, vec![0xAA]).await; // session 1 now full

        // Session 2 still accepts and delivers.
        mux.push(2, vec![0xBB]).await;
        let queue = mux.get(2).unwrap();
        assert_eq!(queue.read().await.unwrap(), vec![0xBB]);
    }

    #[tokio::test]
    async fn test_allocate_is_monotonic() {
        let mux = SessionMux::new(1);
        let a = mux.allocate();
        let b = mux.allocate();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let mux = SessionMux::new(8);
        mux.open(1);
        mux.close(1);
        mux.push(1, b"late".to_vec()).await;

        // Close dropped the sender before the push; nothing to read.
        // The push above re-created nothing: the entry still exists with a
        // taken sender.
        let queue = mux.get(1).unwrap();
        assert!(queue.read().await.is_none());
    }

    #[tokio::test]
    async fn test_release_removes_entry() {
        let mux = SessionMux::new(8);
        mux.open(1);
        assert_eq!(mux.len(), 1);
        mux.release(1);
        assert!(mux.is_empty());
    }

    #[test]
    fn test_service_tag_mapping() {
        for kind in ServiceKind::ALL {
            assert_eq!(ServiceKind::from_data_tag(kind.data_tag()), Some(kind));
        }
        assert_eq!(ServiceKind::from_data_tag(CmdTag::Sync), None);
    }
}
