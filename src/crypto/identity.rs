//! Identity key material and identifiers
//!
//! An identity is an Ed25519 signing key plus an X25519 agreement key. Its
//! public identifier is a hash of both public keys, so equal identifiers
//! always mean equal public keys.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use super::error::{CryptoError, CryptoResult};
use super::exchange::AgreementPublicKey;
use super::hash::Hash;

/// Size of a signing public key in bytes
pub const SIGNING_KEY_SIZE: usize = 32;

/// Size of a signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an identity identifier in bytes
pub const IDENTITY_ID_SIZE: usize = 32;

/// Size of a device identifier in bytes
pub const DEVICE_ID_SIZE: usize = 16;

const IDENTITY_ID_DOMAIN: &str = "parley 2024 identity-id v1";

/// An Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SigningPublicKey(pub [u8; SIGNING_KEY_SIZE]);

impl_hex_bytes!(SigningPublicKey, SIGNING_KEY_SIZE);

impl SigningPublicKey {
    /// Verify a signature against this public key
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        verifying_key
            .verify_strict(message, &Signature::from_bytes(&signature.0))
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningPublicKey({}...)", &self.to_hex()[..16])
    }
}

/// An Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl_hex_bytes!(SignatureBytes, SIGNATURE_SIZE);

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16])
    }
}

/// Stable public identifier of an identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityId(pub [u8; IDENTITY_ID_SIZE]);

impl_hex_bytes!(IdentityId, IDENTITY_ID_SIZE);

impl IdentityId {
    /// Short prefix for logs and prompts
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityId({})", self.short())
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of one device of an identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; DEVICE_ID_SIZE]);

impl_hex_bytes!(DeviceId, DEVICE_ID_SIZE);

impl DeviceId {
    /// Draw a fresh random device id
    pub fn generate() -> CryptoResult<Self> {
        Ok(DeviceId(super::try_random_bytes()?))
    }
}

impl std::fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Public half of an identity: everything a peer needs to talk to it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Ed25519 key used to sign handshake transcripts
    pub signing: SigningPublicKey,
    /// X25519 key used in authenticated key agreement
    pub agreement: AgreementPublicKey,
}

impl PublicIdentity {
    /// Derive the identifier from the public keys
    pub fn id(&self) -> IdentityId {
        IdentityId(Hash::hash_fields(
            IDENTITY_ID_DOMAIN,
            &[&self.signing.0, &self.agreement.0],
        ))
    }

    /// Check that `claimed` really names these public keys
    pub fn verify_id(&self, claimed: &IdentityId) -> CryptoResult<()> {
        if &self.id() == claimed {
            Ok(())
        } else {
            Err(CryptoError::IdentityMismatch)
        }
    }

    /// Verify a signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        self.signing.verify(message, signature)
    }

    /// Text form for out-of-band exchange: `<signing hex>:<agreement hex>`
    pub fn to_shareable(&self) -> String {
        format!("{}:{}", self.signing.to_hex(), self.agreement.to_hex())
    }

    /// Parse the text form produced by [`PublicIdentity::to_shareable`]
    pub fn from_shareable(s: &str) -> CryptoResult<Self> {
        let (signing, agreement) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| CryptoError::Encoding("expected <signing>:<agreement>".to_string()))?;
        let signing = SigningPublicKey::from_hex(signing)?;
        VerifyingKey::from_bytes(&signing.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        Ok(PublicIdentity {
            signing,
            agreement: AgreementPublicKey::from_hex(agreement)?,
        })
    }
}

/// A long-term Ed25519 signing secret
///
/// The secret key is automatically zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct SigningSecret {
    #[zeroize(skip)]
    public_key: SigningPublicKey,
    secret_key: [u8; SIGNING_KEY_SIZE],
}

impl SigningSecret {
    /// Build from a 32-byte seed
    pub fn from_bytes(secret_key: [u8; SIGNING_KEY_SIZE]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret_key);
        SigningSecret {
            public_key: SigningPublicKey(signing_key.verifying_key().to_bytes()),
            secret_key,
        }
    }

    /// Get the public key
    pub fn public_key(&self) -> &SigningPublicKey {
        &self.public_key
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        SignatureBytes(signing_key.sign(message).to_bytes())
    }
}
