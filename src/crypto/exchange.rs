//! X25519 key agreement
//!
//! Long-term agreement secrets live in the keystore; ephemeral keypairs are
//! created per handshake attempt and dropped (zeroized) once the handshake
//! ends, whatever the outcome.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};

/// Size of an X25519 key in bytes
pub const AGREEMENT_KEY_SIZE: usize = 32;

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// A public key for key agreement (X25519)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgreementPublicKey(pub [u8; AGREEMENT_KEY_SIZE]);

impl_hex_bytes!(AgreementPublicKey, AGREEMENT_KEY_SIZE);

impl std::fmt::Debug for AgreementPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AgreementPublicKey({}...)", &self.to_hex()[..16])
    }
}

/// Shared secret derived from key agreement
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Get the raw bytes.
    ///
    /// Only meant as KDF input; never store or log the result.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }
}

/// Run X25519 and reject all-zero outputs from low-order peer points
fn agree(secret: &StaticSecret, peer: &AgreementPublicKey) -> CryptoResult<SharedSecret> {
    let shared = secret.diffie_hellman(&X25519Public::from(peer.0));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(SharedSecret {
        secret: shared.to_bytes(),
    })
}

/// A long-term X25519 secret
#[derive(ZeroizeOnDrop)]
pub struct AgreementSecret {
    #[zeroize(skip)]
    public_key: AgreementPublicKey,
    secret_key: [u8; AGREEMENT_KEY_SIZE],
}

impl AgreementSecret {
    /// Build from 32 secret bytes (clamping happens inside X25519)
    pub fn from_bytes(secret_key: [u8; AGREEMENT_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(secret_key);
        let public = X25519Public::from(&secret);
        AgreementSecret {
            public_key: AgreementPublicKey(public.to_bytes()),
            secret_key,
        }
    }

    /// Public half
    pub fn public_key(&self) -> &AgreementPublicKey {
        &self.public_key
    }

    /// Compute the shared secret with a peer's public key
    pub fn diffie_hellman(&self, peer_public: &AgreementPublicKey) -> CryptoResult<SharedSecret> {
        agree(&StaticSecret::from(self.secret_key), peer_public)
    }
}

/// An ephemeral keypair for key agreement
///
/// Used for a single handshake attempt and then discarded.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeypair {
    #[zeroize(skip)]
    public_key: AgreementPublicKey,
    secret_key: [u8; AGREEMENT_KEY_SIZE],
}

impl EphemeralKeypair {
    /// Generate a new ephemeral keypair from the OS random source
    pub fn generate() -> CryptoResult<Self> {
        let secret_key: [u8; AGREEMENT_KEY_SIZE] = super::try_random_bytes()?;
        let public = X25519Public::from(&StaticSecret::from(secret_key));

        Ok(EphemeralKeypair {
            public_key: AgreementPublicKey(public.to_bytes()),
            secret_key,
        })
    }

    /// Get the public key to share with the peer
    pub fn public_key(&self) -> &AgreementPublicKey {
        &self.public_key
    }

    /// Compute shared secret with a peer's public key
    pub fn diffie_hellman(&self, peer_public: &AgreementPublicKey) -> CryptoResult<SharedSecret> {
        agree(&StaticSecret::from(self.secret_key), peer_public)
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
