//! Link secret derivation and the admission probe image.
//!
//! One passphrase is shared by every node of an overlay. Two independent
//! BLAKE3 derivations split it into the frame sealing key and the one-way
//! probe image exchanged during admission, so neither value reveals the
//! other.

use crate::{CryptoError, KEY_SIZE};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Admission probe size in bytes
pub const PROBE_SIZE: usize = 32;

const SEAL_CONTEXT: &str = "trellis v1 frame sealing key";
const PROBE_CONTEXT: &str = "trellis v1 admission probe";

/// Shared secret configured out of band for one overlay.
///
/// Holds the raw passphrase bytes only long enough to derive the sealing key
/// and probe image; all three are zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct LinkSecret {
    seal_key: [u8; KEY_SIZE],
    probe: [u8; PROBE_SIZE],
}

impl LinkSecret {
    /// Derive the link secret from an operator-supplied passphrase.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut material = passphrase.as_bytes().to_vec();
        let seal_key = blake3::derive_key(SEAL_CONTEXT, &material);
        let probe = blake3::derive_key(PROBE_CONTEXT, &material);
        material.zeroize();

        Self { seal_key, probe }
    }

    /// The frame sealing key.
    #[must_use]
    pub fn seal_key(&self) -> &[u8; KEY_SIZE] {
        &self.seal_key
    }

    /// The one-way image of the secret sent by an admission initiator.
    #[must_use]
    pub fn probe(&self) -> [u8; PROBE_SIZE] {
        self.probe
    }

    /// Check a received probe against the local image in constant time.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::ProbeMismatch` when the peer derived its probe
    /// from a different passphrase.
    pub fn verify_probe(&self, received: &[u8]) -> Result<(), CryptoError> {
        if received.len() != PROBE_SIZE {
            return Err(CryptoError::ProbeMismatch);
        }
        if self.probe.ct_eq(received).into() {
            Ok(())
        } else {
            Err(CryptoError::ProbeMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_passphrase_same_material() {
        let a = LinkSecret::from_passphrase("correct horse battery staple");
        let b = LinkSecret::from_passphrase("correct horse battery staple");

        assert_eq!(a.seal_key(), b.seal_key());
        assert_eq!(a.probe(), b.probe());
    }

    #[test]
    fn test_different_passphrases_differ() {
        let a = LinkSecret::from_passphrase("alpha");
        let b = LinkSecret::from_passphrase("beta");

        assert_ne!(a.seal_key(), b.seal_key());
        assert_ne!(a.probe(), b.probe());
    }

    #[test]
    fn test_probe_independent_of_seal_key() {
        let secret = LinkSecret::from_passphrase("alpha");
        assert_ne!(&secret.probe(), secret.seal_key());
    }

    #[test]
    fn test_verify_probe() {
        let secret = LinkSecret::from_passphrase("alpha");
        let probe = secret.probe();

        assert!(secret.verify_probe(&probe).is_ok());

        let mut bad = probe;
        bad[0] ^= 0x01;
        assert!(matches!(
            secret.verify_probe(&bad),
            Err(CryptoError::ProbeMismatch)
        ));

        assert!(secret.verify_probe(&probe[..16]).is_err());
    }
}
