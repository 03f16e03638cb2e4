//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Admission probe did not match the local secret image
    #[error("admission probe mismatch")]
    ProbeMismatch,
}
