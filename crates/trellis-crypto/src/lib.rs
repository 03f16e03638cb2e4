//! # Trellis Crypto
//!
//! Cryptographic primitives for the Trellis overlay.
//!
//! This crate provides:
//! - Link secret derivation from an operator-supplied passphrase
//! - One-way secret image used by the admission probe
//! - `XChaCha20-Poly1305` frame sealing (every frame after the separator
//!   rides inside one AEAD envelope)
//! - Size-class padding so ciphertext lengths reveal only coarse buckets
//!
//! All endpoints of an overlay share one secret configured out of band; the
//! sealing key and probe image are both derived from it with independent
//! BLAKE3 contexts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod padding;
pub mod seal;
pub mod secret;

pub use error::CryptoError;
pub use padding::{SIZE_CLASSES, padded_len};
pub use seal::{FrameSealer, NONCE_SIZE, TAG_SIZE};
pub use secret::{LinkSecret, PROBE_SIZE};

/// Sealing key size in bytes
pub const KEY_SIZE: usize = 32;
