//! Cryptographic primitives for Parley
//!
//! This module provides the building blocks everything else is made of:
//! - `identity`: Ed25519 signing keys, identity and device identifiers
//! - `exchange`: X25519 key agreement, long-term and ephemeral
//! - `cipher`: ChaCha20-Poly1305 AEAD encryption
//! - `hash`: BLAKE3 hashing, MACs and key derivation
//!
//! Nothing outside this module touches the underlying crates directly.

pub mod cipher;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod identity;

// Re-export commonly used types
pub use cipher::Cipher;
pub use error::{CryptoError, CryptoResult};
pub use exchange::{AgreementPublicKey, AgreementSecret, EphemeralKeypair, SharedSecret};
pub use hash::{Hash, HashOutput};
pub use identity::{
    DeviceId, IdentityId, PublicIdentity, SignatureBytes, SigningPublicKey, SigningSecret,
};

/// Fill an array from the OS random source.
///
/// Fails instead of panicking when the source is unavailable.
pub fn try_random_bytes<const N: usize>() -> CryptoResult<[u8; N]> {
    use rand::{rngs::OsRng, RngCore};
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::RngUnavailable(e.to_string()))?;
    Ok(bytes)
}
