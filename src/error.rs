//! Engine error taxonomy
//!
//! Every public operation returns [`EngineResult`]. Layer errors
//! ([`CryptoError`], [`RelayError`], [`StorageError`]) convert into
//! [`EngineError`] through `From`, so `?` works across layers.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::server::RelayError;
use crate::storage::StorageError;

/// Why a handshake a caller was waiting on did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// No response before the deadline
    Timeout,
    /// The peer's signature or key confirmation did not verify
    Authentication,
    /// The waiting operation was cancelled
    Cancelled,
    /// The handshake message could not be delivered or processed
    Other(String),
}

impl std::fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeFailure::Timeout => f.write_str("timed out"),
            HandshakeFailure::Authentication => f.write_str("authentication failed"),
            HandshakeFailure::Cancelled => f.write_str("cancelled"),
            HandshakeFailure::Other(reason) => f.write_str(reason),
        }
    }
}

/// Errors surfaced by the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The random source could not produce key material
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Unknown identity, contact, device or session
    #[error("Not found: {0}")]
    NotFound(String),

    /// A handshake for this channel is already pending, or the channel is
    /// already established
    #[error("Handshake already in progress")]
    AlreadyInProgress,

    /// Signature, identifier or key confirmation did not verify
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// A handshake message arrived after its deadline
    #[error("Handshake timed out")]
    Timeout,

    /// No usable session for this channel
    #[error("Session not established")]
    SessionNotEstablished,

    /// The session was revoked
    #[error("Session revoked")]
    SessionRevoked,

    /// Sequence number already consumed or older than the replay window
    #[error("Replay detected")]
    ReplayDetected,

    /// Ciphertext failed authentication; the payload was discarded
    #[error("Decryption failure")]
    DecryptionFailure,

    /// The relay could not be reached
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    /// Upload gave up
    #[error("Upload failed after {attempts} attempt(s): {reason}")]
    UploadFailed {
        /// Attempts made, including the first
        attempts: u32,
        /// Last error seen
        reason: String,
    },

    /// A handshake the operation depended on did not complete
    #[error("Handshake failed: {0}")]
    HandshakeFailed(HandshakeFailure),

    /// A persisted identity record is unreadable
    #[error("Corrupted identity record: {0}")]
    CorruptedIdentity(String),

    /// The contact is marked revoked
    #[error("Contact revoked")]
    ContactRevoked,

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Malformed or unexpected protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Worth retrying later without any change of input
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ServerUnavailable(_)
                | EngineError::UploadFailed { .. }
                | EngineError::HandshakeFailed(HandshakeFailure::Timeout)
        )
    }

    /// A cryptographic check failed; never retried
    pub fn is_cryptographic(&self) -> bool {
        matches!(
            self,
            EngineError::AuthenticationFailure(_)
                | EngineError::DecryptionFailure
                | EngineError::ReplayDetected
                | EngineError::CorruptedIdentity(_)
                | EngineError::HandshakeFailed(HandshakeFailure::Authentication)
        )
    }
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::SignatureVerificationFailed
            | CryptoError::IdentityMismatch
            | CryptoError::NonContributory
            | CryptoError::InvalidPublicKey => EngineError::AuthenticationFailure(err.to_string()),
            CryptoError::DecryptionFailed => EngineError::DecryptionFailure,
            CryptoError::RngUnavailable(reason) => EngineError::KeyGeneration(reason),
            other => EngineError::Protocol(other.to_string()),
        }
    }
}

impl From<RelayError> for EngineError {
    fn from(err: RelayError) -> Self {
        EngineError::ServerUnavailable(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_mapping() {
        assert!(matches!(
            EngineError::from(CryptoError::SignatureVerificationFailed),
            EngineError::AuthenticationFailure(_)
        ));
        assert!(matches!(
            EngineError::from(CryptoError::DecryptionFailed),
            EngineError::DecryptionFailure
        ));
        assert!(matches!(
            EngineError::from(CryptoError::RngUnavailable("gone".into())),
            EngineError::KeyGeneration(_)
        ));
    }

    #[test]
    fn test_classification() {
        assert!(EngineError::ServerUnavailable("down".into()).is_transient());
        assert!(!EngineError::ServerUnavailable("down".into()).is_cryptographic());
        assert!(EngineError::ReplayDetected.is_cryptographic());
        assert!(EngineError::DecryptionFailure.is_cryptographic());
        assert!(!EngineError::DecryptionFailure.is_transient());
        assert!(EngineError::HandshakeFailed(HandshakeFailure::Timeout).is_transient());
        assert!(EngineError::HandshakeFailed(HandshakeFailure::Authentication).is_cryptographic());
    }

    #[test]
    fn test_upload_failed_message() {
        let err = EngineError::UploadFailed {
            attempts: 5,
            reason: "relay unavailable".into(),
        };
        assert_eq!(
            err.to_string(),
            "Upload failed after 5 attempt(s): relay unavailable"
        );
    }
}
