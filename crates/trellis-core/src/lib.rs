//! # Trellis Core
//!
//! Core overlay transport for Trellis.
//!
//! This crate provides:
//! - **Frame codec**: typed packets sealed onto one bidirectional byte stream
//! - **Node registry**: known peers keyed by identity with their channels
//! - **Topology & routing**: adjacency graph and BFS next-hop table
//! - **Link reader / dispatcher**: per-link decode, deliver-or-forward loop
//! - **Command channel**: per-(peer, command) request/reply mailboxes
//! - **Session data channel**: per-(peer, service, session) byte queues
//! - **Handshake & admission**: shared-secret probe exchange on new links
//! - **Service glue**: shell, file transfer, SOCKS, port forwarding
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   OverlayContext                            │
//! │  (registry, topology, routing, secret, role)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services   │  Mailboxes   │  Session muxes                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Link readers (one per direct peer, deliver or forward)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Frames (sealed envelopes over TCP)                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A frame addressed to another identity is re-framed hop-by-hop along the
//! routing table until it reaches its destination; a frame addressed to the
//! local identity is demultiplexed into a command mailbox or a per-session
//! byte queue.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod mailbox;
pub mod peer;
pub mod registry;
pub mod services;
pub mod session;
pub mod topology;
pub mod wire;

pub use context::{OverlayContext, Role};
pub use error::Error;
pub use identity::NodeId;
pub use peer::{Link, Peer};
pub use registry::Registry;
pub use session::{ServiceKind, SessionMux, SessionQueue};
pub use topology::{NodeLabel, Topology};
pub use wire::{CmdTag, Frame, FrameHeader};

/// Constant 4-byte frame separator magic
pub const PROTOCOL_SEPARATOR: [u8; 4] = [0x9B, 0x2F, 0xC5, 0x61];

/// Node identity size in bytes
pub const NODE_ID_SIZE: usize = 32;

/// Largest packet body the codec will carry
pub const MAX_PACKET_SIZE: usize = 10_240;

/// Largest file-data payload per frame (body minus the u32 length field)
pub const MAX_FILE_CHUNK: usize = MAX_PACKET_SIZE - 4;

/// Hard cap on a sealed frame read from the wire
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Read size for session pump tasks, chosen so a full data frame still
/// lands in the codec's 4096-byte size class
pub const DATA_CHUNK_SIZE: usize = 4000;

/// Bounded depth of one session's byte queue, in chunks
pub const SESSION_QUEUE_DEPTH: usize = 32;

/// Bounded window for file-data frames riding the command channel
pub const FILE_WINDOW_DEPTH: usize = 32;
