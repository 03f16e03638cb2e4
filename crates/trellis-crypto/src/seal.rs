//! `XChaCha20-Poly1305` frame sealing.
//!
//! Everything after a frame's plaintext separator travels inside one AEAD
//! envelope. The 24-byte extended nonce is drawn fresh from the CSPRNG per
//! frame, so no counter state is shared between the many writers of a link.

use crate::{CryptoError, KEY_SIZE};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};

/// AEAD nonce size in bytes (extended nonce)
pub const NONCE_SIZE: usize = 24;

/// AEAD authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Seals and opens frame envelopes with a link-wide key.
pub struct FrameSealer {
    cipher: XChaCha20Poly1305,
}

impl FrameSealer {
    /// Create a sealer for the given sealing key.
    #[must_use]
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Seal a plaintext, returning the fresh nonce and the ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if the CSPRNG fails and
    /// `CryptoError::EncryptionFailed` on AEAD failure.
    pub fn seal(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| CryptoError::RandomFailed)?;

        let ciphertext = self
            .cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok((nonce, ciphertext))
    }

    /// Open a sealed envelope.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` when authentication fails,
    /// which covers both tampering and a mismatched link secret.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(
                nonce.into(),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::LinkSecret;

    fn sealer(pass: &str) -> FrameSealer {
        FrameSealer::new(LinkSecret::from_passphrase(pass).seal_key())
    }

    #[test]
    fn test_seal_roundtrip() {
        let sealer = sealer("alpha");
        let (nonce, ct) = sealer.seal(b"hello overlay", b"magic").unwrap();
        let pt = sealer.open(&nonce, &ct, b"magic").unwrap();
        assert_eq!(pt, b"hello overlay");
    }

    #[test]
    fn test_tamper_detection() {
        let sealer = sealer("alpha");
        let (nonce, mut ct) = sealer.seal(b"hello", b"").unwrap();
        ct[0] ^= 0xFF;
        assert!(matches!(
            sealer.open(&nonce, &ct, b""),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = sealer("alpha");
        let b = sealer("beta");
        let (nonce, ct) = a.seal(b"hello", b"").unwrap();
        assert!(b.open(&nonce, &ct, b"").is_err());
    }

    #[test]
    fn test_aad_is_bound() {
        let sealer = sealer("alpha");
        let (nonce, ct) = sealer.seal(b"hello", b"aad-1").unwrap();
        assert!(sealer.open(&nonce, &ct, b"aad-2").is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let sealer = sealer("alpha");
        let (n1, _) = sealer.seal(b"x", b"").unwrap();
        let (n2, _) = sealer.seal(b"x", b"").unwrap();
        assert_ne!(n1, n2);
    }
}
