//! The top-level overlay context.
//!
//! Everything process-wide (registry, topology, routing table, link secret,
//! role) is owned by one `OverlayContext` passed to every component.
//! Independent contexts are cheap to construct, so multi-node setups run
//! inside a single test process.

use crate::dispatch;
use crate::error::{Error, Result};
use crate::handshake;
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::registry::Registry;
use crate::services;
use crate::session::ServiceKind;
use crate::topology::{NodeLabel, Topology};
use crate::wire::{CmdTag, DataBody, WireBody};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use trellis_crypto::{FrameSealer, LinkSecret};

/// What this node does with commands addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues commands and consumes replies
    Admin,
    /// Executes commands arriving over the overlay
    Agent,
}

/// Top-level owner of all overlay state for one node.
pub struct OverlayContext {
    local_id: NodeId,
    label: NodeLabel,
    role: Role,
    secret: LinkSecret,
    sealer: FrameSealer,
    registry: Registry,
    topology: StdRwLock<Topology>,
    sync_gate: Mutex<()>,
}

impl OverlayContext {
    /// Create a context with a fresh random identity.
    ///
    /// # Errors
    ///
    /// Transport error if the CSPRNG fails.
    pub fn new(role: Role, label: NodeLabel, secret: LinkSecret) -> Result<Arc<Self>> {
        Ok(Self::with_identity(NodeId::random()?, role, label, secret))
    }

    /// Create a context with a caller-chosen identity.
    #[must_use]
    pub fn with_identity(
        id: NodeId,
        role: Role,
        label: NodeLabel,
        secret: LinkSecret,
    ) -> Arc<Self> {
        let sealer = FrameSealer::new(secret.seal_key());
        Arc::new(Self {
            local_id: id,
            label: label.clone(),
            role,
            secret,
            sealer,
            registry: Registry::new(),
            topology: StdRwLock::new(Topology::new(id, label)),
            sync_gate: Mutex::new(()),
        })
    }

    /// This node's identity.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// This node's display label.
    #[must_use]
    pub fn label(&self) -> &NodeLabel {
        &self.label
    }

    /// This node's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The peer registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The frame sealer shared by every link of this overlay.
    #[must_use]
    pub fn sealer(&self) -> &FrameSealer {
        &self.sealer
    }

    pub(crate) fn secret(&self) -> &LinkSecret {
        &self.secret
    }

    pub(crate) fn sync_gate(&self) -> &Mutex<()> {
        &self.sync_gate
    }

    /// Read the topology under its lock.
    pub fn topology_read<R>(&self, f: impl FnOnce(&Topology) -> R) -> R {
        f(&self.topology.read().expect("topology lock poisoned"))
    }

    pub(crate) fn topology_write<R>(&self, f: impl FnOnce(&mut Topology) -> R) -> R {
        f(&mut self.topology.write().expect("topology lock poisoned"))
    }

    /// Bind a node listener; accepted connections run responder admission.
    ///
    /// Returns the bound address. The accept loop runs until the process
    /// exits or the returned listener task is dropped with the runtime.
    ///
    /// # Errors
    ///
    /// I/O error when the bind fails.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "node listener up");

        let ctx = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            match handshake::accept(&ctx, stream).await {
                                Ok((peer, label)) => {
                                    if let Err(e) = ctx.admit(peer, label, None) {
                                        tracing::warn!(%remote, error = %e, "admission rejected");
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(%remote, error = %e, "handshake failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Dial a peer and run initiator admission.
    ///
    /// # Errors
    ///
    /// I/O error on the dial, plus the admission failure modes.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<NodeId> {
        let stream = TcpStream::connect(addr).await?;
        let (peer, label, map) = handshake::initiate(self, stream).await?;
        let id = peer.id();
        self.admit(peer, label, Some(&map))?;
        tracing::info!(peer = %id.short(), %addr, "joined overlay");
        Ok(id)
    }

    /// Register a freshly admitted direct peer and start its link reader.
    pub(crate) fn admit(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        label: NodeLabel,
        map: Option<&[u8]>,
    ) -> Result<()> {
        if let Err(e) = self.registry.insert_direct(peer.clone()) {
            peer.mark_closed();
            return Err(e);
        }

        self.topology_write(|topo| {
            topo.add_edge(self.local_id, peer.id());
            topo.set_label(peer.id(), label);
            if let Some(map) = map {
                if let Err(e) = topo.merge_map(map) {
                    // The graph heals on the next sync round.
                    tracing::warn!(peer = %peer.id().short(), error = %e, "bad admission map");
                }
            }
            topo.recompute_routes();
        });
        self.rebuild_indirect();

        dispatch::spawn_link_reader(self.clone(), peer);
        Ok(())
    }

    /// The peer record frames for `dst` are written through, creating an
    /// indirect record on demand for routable identities.
    ///
    /// # Errors
    ///
    /// `NotRoutable` when no path to `dst` is known.
    pub fn peer_for(&self, dst: NodeId) -> Result<Arc<Peer>> {
        if let Some(peer) = self.registry.lookup(dst) {
            if !peer.is_closed() {
                return Ok(peer);
            }
        }

        let hop = self.topology_read(|t| t.next_hop(dst))?;
        let via = self
            .registry
            .lookup(hop)
            .filter(|p| p.is_direct() && !p.is_closed())
            .ok_or(Error::NotRoutable(dst))?;
        Ok(self.registry.insert_indirect(dst, via.link()))
    }

    /// Send one body toward `dst` along the next hop.
    ///
    /// # Errors
    ///
    /// `NotRoutable` without a path, `Transport` on link failure.
    pub async fn send_to(&self, dst: NodeId, tag: CmdTag, body: &impl WireBody) -> Result<()> {
        let peer = self.peer_for(dst)?;
        peer.send(&self.sealer, self.local_id, tag, body).await
    }

    /// Send session data toward `dst`.
    ///
    /// # Errors
    ///
    /// Same as [`OverlayContext::send_to`].
    pub async fn send_data(&self, dst: NodeId, service: ServiceKind, body: &DataBody) -> Result<()> {
        self.send_to(dst, service.data_tag(), body).await
    }

    /// Record the peer a frame arrived from, registering unknown sources
    /// through the delivering link so replies route before the first sync.
    pub(crate) fn source_peer(&self, src: NodeId, via: &Arc<Peer>) -> Arc<Peer> {
        match self.registry.lookup(src) {
            Some(peer) => peer,
            None => self.registry.insert_indirect(src, via.link()),
        }
    }

    /// Restore the borrowed-transport invariant: every non-direct peer's
    /// link must be the link of its current next hop.
    pub(crate) fn rebuild_indirect(&self) {
        let routes = self.topology_read(Topology::routes);

        for (&dst, &via) in &routes {
            let Some(via_peer) = self
                .registry
                .lookup(via)
                .filter(|p| p.is_direct() && !p.is_closed())
            else {
                continue;
            };
            match self.registry.lookup(dst) {
                Some(peer) if !peer.is_direct() => peer.set_link(via_peer.link()),
                Some(_) => {}
                None => {
                    self.registry.insert_indirect(dst, via_peer.link());
                }
            }
        }
    }

    /// Garbage-collect indirect peers whose next hop vanished: their
    /// sessions close and outstanding mailbox reads fail with `PeerGone`.
    pub(crate) fn gc_unroutable(&self) {
        let routes = self.topology_read(Topology::routes);
        for peer in self.registry.all() {
            if !peer.is_direct() && !routes.contains_key(&peer.id()) {
                peer.mark_closed();
                self.registry.remove(peer.id());
                tracing::debug!(peer = %peer.id().short(), "dropped unroutable peer");
            }
        }
    }

    /// Tear down a dead direct peer: close its channels, prune the graph,
    /// cascade to indirect peers that lost their route, and (admin role)
    /// trigger a topology resync.
    pub(crate) async fn drop_peer(self: &Arc<Self>, id: NodeId) {
        if let Some(peer) = self.registry.remove(id) {
            peer.mark_closed();
        }
        self.topology_write(|topo| {
            topo.remove_node(id);
            topo.recompute_routes();
        });
        self.rebuild_indirect();
        self.gc_unroutable();

        if self.role == Role::Admin {
            let ctx = self.clone();
            tokio::spawn(async move {
                if let Err(e) = services::sync::admin_sync(&ctx).await {
                    tracing::warn!(error = %e, "resync after peer loss failed");
                }
            });
        }
    }

    /// Run one admin-initiated topology synchronization round.
    ///
    /// # Errors
    ///
    /// See [`services::sync::admin_sync`].
    pub async fn sync(self: &Arc<Self>) -> Result<()> {
        services::sync::admin_sync(self).await
    }

    /// Tear the node down: every peer is marked dead, which stops the link
    /// readers, closes all sessions and fails outstanding mailbox reads.
    pub fn shutdown(&self) {
        for peer in self.registry.all() {
            peer.mark_closed();
        }
    }

    /// Snapshot of every known node for display: identity, label, and the
    /// next hop (`None` for the local node and direct peers).
    #[must_use]
    pub fn peers_snapshot(&self) -> Vec<(NodeId, NodeLabel, Option<NodeId>)> {
        self.topology_read(|topo| {
            let routes = topo.routes();
            topo.nodes()
                .into_iter()
                .map(|id| {
                    let label = topo.label(id).cloned().unwrap_or_default();
                    let hop = routes.get(&id).copied().filter(|&h| h != id);
                    (id, label, hop)
                })
                .collect()
        })
    }
}
