//! Node identities.

use crate::NODE_ID_SIZE;
use std::fmt;
use std::str::FromStr;

/// A 32-byte opaque node identity, unique per process instance.
///
/// Equality is byte-equality; the `Ord` impl gives the deterministic
/// ascending-identity order used for routing tie-breaks. The identity
/// appears verbatim in every frame's source and destination fields.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// The all-zero identity, used as the destination placeholder during
    /// admission before the peer's identity is known.
    pub const ZERO: NodeId = NodeId([0u8; NODE_ID_SIZE]);

    /// Draw a fresh random identity from the CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the CSPRNG fails.
    pub fn random() -> crate::error::Result<Self> {
        let mut bytes = [0u8; NODE_ID_SIZE];
        getrandom::fill(&mut bytes)
            .map_err(|e| crate::Error::Transport(format!("csprng failure: {e}")))?;
        Ok(Self(bytes))
    }

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw identity bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Abbreviated hex form for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|_| crate::Error::Protocol(format!("invalid identity hex: {s}")))?;
        let bytes: [u8; NODE_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| crate::Error::Protocol("identity must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        let a = NodeId::random().unwrap();
        let b = NodeId::random().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::from_bytes([0xAB; 32]);
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("zz".parse::<NodeId>().is_err());
        assert!("abcd".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let a = NodeId::from_bytes([0x01; 32]);
        let b = NodeId::from_bytes([0x02; 32]);
        assert!(a < b);
    }
}
