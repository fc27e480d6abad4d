//! Cryptographic error types

use thiserror::Error;

/// Errors raised by the primitive layer.
///
/// None of these carry key material; messages are safe to log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Input had the wrong length for the expected key or value
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Signature did not verify under the given public key
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// AEAD sealing failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// AEAD tag mismatch: wrong key, wrong associated data or tampered bytes
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// Public key bytes do not decode to a usable curve point
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Secret key bytes do not match the accompanying public key
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// Key agreement produced an all-zero (non-contributory) output
    #[error("Key agreement produced a non-contributory secret")]
    NonContributory,

    /// The operating system random source is unavailable
    #[error("Random source unavailable: {0}")]
    RngUnavailable(String),

    /// An identifier does not match the public keys it claims to name
    #[error("Identifier does not match public key material")]
    IdentityMismatch,

    /// Hex or base64 text could not be decoded
    #[error("Malformed encoding: {0}")]
    Encoding(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
