//! The process-wide set of known peers.

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::peer::{Link, Peer};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Concurrency-safe mapping from identity to peer record.
pub struct Registry {
    peers: DashMap<NodeId, Arc<Peer>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Register a direct peer.
    ///
    /// A second direct link for a live identity is rejected; takeover is
    /// only possible after the old link has been torn down. Upgrading an
    /// indirect record to direct replaces it and closes the old record's
    /// channels.
    ///
    /// # Errors
    ///
    /// Protocol error for a duplicate live direct link.
    pub fn insert_direct(&self, peer: Arc<Peer>) -> Result<()> {
        match self.peers.entry(peer.id()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.is_direct() && !existing.is_closed() {
                    return Err(Error::Protocol(format!(
                        "duplicate direct link for {}",
                        peer.id().short()
                    )));
                }
                let old = entry.insert(peer);
                old.mark_closed();
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(peer);
                Ok(())
            }
        }
    }

    /// Register (or re-point) an indirect peer reached through `via`.
    /// Idempotent: an existing indirect record gets its next-hop link
    /// updated; an existing direct record is returned untouched.
    pub fn insert_indirect(&self, id: NodeId, via: Arc<Link>) -> Arc<Peer> {
        match self.peers.entry(id) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                if !existing.is_direct() {
                    existing.set_link(via);
                }
                existing
            }
            Entry::Vacant(entry) => {
                let peer = Peer::new_indirect(id, via);
                entry.insert(peer.clone());
                peer
            }
        }
    }

    /// Look up a peer by identity.
    #[must_use]
    pub fn lookup(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|e| e.value().clone())
    }

    /// Remove a peer record.
    pub fn remove(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.peers.remove(&id).map(|(_, peer)| peer)
    }

    /// Snapshot of all direct peers.
    #[must_use]
    pub fn iter_direct(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|e| e.value().is_direct())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Snapshot of every peer record.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    async fn fresh_link() -> Arc<Link> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Arc::new(Link::new(stream.unwrap()))
    }

    fn id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let registry = Registry::new();
        let peer = Peer::new_direct(id(1), fresh_link().await);
        registry.insert_direct(peer).unwrap();

        assert!(registry.lookup(id(1)).unwrap().is_direct());
        assert!(registry.lookup(id(2)).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_direct_rejected_while_live() {
        let registry = Registry::new();
        registry
            .insert_direct(Peer::new_direct(id(1), fresh_link().await))
            .unwrap();

        let second = Peer::new_direct(id(1), fresh_link().await);
        assert!(matches!(
            registry.insert_direct(second),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_takeover_after_teardown() {
        let registry = Registry::new();
        let first = Peer::new_direct(id(1), fresh_link().await);
        registry.insert_direct(first.clone()).unwrap();

        first.mark_closed();
        registry
            .insert_direct(Peer::new_direct(id(1), fresh_link().await))
            .unwrap();
        assert!(!registry.lookup(id(1)).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_indirect_insert_is_idempotent() {
        let registry = Registry::new();
        let via_a = fresh_link().await;
        let via_b = fresh_link().await;

        let first = registry.insert_indirect(id(9), via_a);
        let second = registry.insert_indirect(id(9), via_b.clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second.link(), &via_b));
    }

    #[tokio::test]
    async fn test_indirect_does_not_downgrade_direct() {
        let registry = Registry::new();
        let direct_link = fresh_link().await;
        registry
            .insert_direct(Peer::new_direct(id(1), direct_link.clone()))
            .unwrap();

        let other = fresh_link().await;
        let peer = registry.insert_indirect(id(1), other);
        assert!(peer.is_direct());
        assert!(Arc::ptr_eq(&peer.link(), &direct_link));
    }

    #[tokio::test]
    async fn test_iter_direct_filters() {
        let registry = Registry::new();
        registry
            .insert_direct(Peer::new_direct(id(1), fresh_link().await))
            .unwrap();
        registry.insert_indirect(id(2), fresh_link().await);

        let directs = registry.iter_direct();
        assert_eq!(directs.len(), 1);
        assert_eq!(directs[0].id(), id(1));
        assert_eq!(registry.len(), 2);
    }
}
