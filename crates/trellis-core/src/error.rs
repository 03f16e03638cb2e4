//! Error types for the overlay core.
//!
//! Errors that describe a broken link (`Transport`, `MalformedFrame`,
//! `UnknownTag`, `AuthFailure`) are contained to that link and drain it.
//! Errors that describe a broken service close the affected session only.
//! Peer misbehavior never aborts the process.

use crate::identity::NodeId;
use thiserror::Error;

/// Overlay errors
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying byte stream failed; fatal for the owning link
    #[error("transport failure: {0}")]
    Transport(String),

    /// Frame could not be parsed; fatal for the link only
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Command tag does not correspond to a registered body shape
    #[error("unknown command tag: 0x{0:04X}")]
    UnknownTag(u16),

    /// The cipher layer rejected the input
    #[error("authentication failure on link")]
    AuthFailure,

    /// Destination identity missing from the routing table
    #[error("no route to {0}")]
    NotRoutable(NodeId),

    /// The owning peer was dropped while a read was outstanding
    #[error("peer {0} is gone")]
    PeerGone(NodeId),

    /// A reply disagrees with its request, or a channel contract was broken
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Local file or terminal operation failed during a service
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller-supplied deadline passed
    #[error("deadline exceeded")]
    Timeout,
}

impl From<trellis_crypto::CryptoError> for Error {
    fn from(err: trellis_crypto::CryptoError) -> Self {
        use trellis_crypto::CryptoError;
        match err {
            CryptoError::DecryptionFailed | CryptoError::ProbeMismatch => Error::AuthFailure,
            CryptoError::EncryptionFailed | CryptoError::RandomFailed => {
                Error::Transport(err.to_string())
            }
        }
    }
}

impl Error {
    /// True when the error is fatal for the link it occurred on.
    #[must_use]
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::MalformedFrame(_)
                | Error::UnknownTag(_)
                | Error::AuthFailure
                | Error::Protocol(_)
        )
    }
}

/// Result type for overlay operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_fatal_classification() {
        assert!(Error::Transport("broken pipe".into()).is_link_fatal());
        assert!(Error::MalformedFrame("short read").is_link_fatal());
        assert!(Error::UnknownTag(0xFFFF).is_link_fatal());
        assert!(Error::AuthFailure.is_link_fatal());
        assert!(Error::Protocol("unsolicited reply".into()).is_link_fatal());

        assert!(!Error::NotRoutable(NodeId::ZERO).is_link_fatal());
        assert!(!Error::PeerGone(NodeId::ZERO).is_link_fatal());
        assert!(!Error::Timeout.is_link_fatal());
    }

    #[test]
    fn test_crypto_error_mapping() {
        use trellis_crypto::CryptoError;
        assert!(matches!(
            Error::from(CryptoError::DecryptionFailed),
            Error::AuthFailure
        ));
        assert!(matches!(
            Error::from(CryptoError::ProbeMismatch),
            Error::AuthFailure
        ));
        assert!(matches!(
            Error::from(CryptoError::EncryptionFailed),
            Error::Transport(_)
        ));
    }
}
