//! Private key custody
//!
//! The key store is the only owner of long-term secret keys. Callers get a
//! [`PrivateKeyHandle`], which carries no key bytes and cannot be cloned,
//! and ask the store to sign or run key agreement with it. Keys are sealed
//! before they are persisted and zeroized when the last handle is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{
    try_random_bytes, AgreementPublicKey, AgreementSecret, IdentityId, PublicIdentity,
    SharedSecret, SignatureBytes, SigningSecret,
};
use crate::error::{EngineError, EngineResult};
use crate::storage::{SealedStore, StorageError};

const NAMESPACE: &str = "keys";

/// Secret halves of one identity
struct IdentityKeys {
    signing: SigningSecret,
    agreement: AgreementSecret,
}

impl IdentityKeys {
    fn public(&self) -> PublicIdentity {
        PublicIdentity {
            signing: *self.signing.public_key(),
            agreement: *self.agreement.public_key(),
        }
    }
}

/// Persisted form, only ever written sealed
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyRecord {
    signing: [u8; 32],
    agreement: [u8; 32],
}

/// Scoped capability to use one identity's private keys.
///
/// Not `Clone`; drop it as soon as the operation is done.
pub struct PrivateKeyHandle {
    identity: IdentityId,
    keys: Arc<IdentityKeys>,
}

impl PrivateKeyHandle {
    /// Identity this handle belongs to
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    /// Public half of the identity
    pub fn public_identity(&self) -> PublicIdentity {
        self.keys.public()
    }
}

impl std::fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyHandle")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Generates, seals and uses long-term private keys
pub struct KeyStore {
    store: SealedStore,
    cache: RwLock<HashMap<IdentityId, Arc<IdentityKeys>>>,
}

impl KeyStore {
    /// Open a key store over a sealed backend.
    ///
    /// Records are loaded lazily, so one corrupted identity does not stop
    /// the others from being used.
    pub fn open(store: SealedStore) -> Self {
        KeyStore {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Volatile key store
    pub fn in_memory() -> EngineResult<Self> {
        Ok(Self::open(SealedStore::in_memory()?))
    }

    /// Create a fresh identity and persist its sealed keys
    pub fn generate_identity(&self) -> EngineResult<PublicIdentity> {
        let mut record = KeyRecord {
            signing: try_random_bytes()
                .map_err(|e| EngineError::KeyGeneration(e.to_string()))?,
            agreement: try_random_bytes()
                .map_err(|e| EngineError::KeyGeneration(e.to_string()))?,
        };
        let keys = IdentityKeys {
            signing: SigningSecret::from_bytes(record.signing),
            agreement: AgreementSecret::from_bytes(record.agreement),
        };
        let public = keys.public();
        let id = public.id();

        let persisted = self.store.put(NAMESPACE, &id.to_hex(), &record);
        record.zeroize();
        persisted?;

        self.cache.write().insert(id, Arc::new(keys));
        info!(identity = %id.short(), "Generated identity");
        Ok(public)
    }

    /// Borrow a handle to an identity's private keys
    pub fn load_private_key(&self, id: &IdentityId) -> EngineResult<PrivateKeyHandle> {
        Ok(PrivateKeyHandle {
            identity: *id,
            keys: self.keys(id)?,
        })
    }

    /// Public half of a stored identity
    pub fn public_identity(&self, id: &IdentityId) -> EngineResult<PublicIdentity> {
        Ok(self.keys(id)?.public())
    }

    /// Whether keys for `id` are present
    pub fn contains(&self, id: &IdentityId) -> EngineResult<bool> {
        match self.keys(id) {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sign with the identity's Ed25519 key
    pub fn sign(&self, handle: &PrivateKeyHandle, message: &[u8]) -> SignatureBytes {
        handle.keys.signing.sign(message)
    }

    /// X25519 agreement between the identity's long-term key and `peer`
    pub fn perform_key_agreement(
        &self,
        handle: &PrivateKeyHandle,
        peer: &AgreementPublicKey,
    ) -> EngineResult<SharedSecret> {
        Ok(handle.keys.agreement.diffie_hellman(peer)?)
    }

    /// Forget an identity and delete its sealed record.
    ///
    /// Key bytes are zeroized once outstanding handles are dropped.
    pub fn remove_identity(&self, id: &IdentityId) -> EngineResult<()> {
        self.cache.write().remove(id);
        self.store.delete(NAMESPACE, &id.to_hex())?;
        info!(identity = %id.short(), "Removed identity keys");
        Ok(())
    }

    fn keys(&self, id: &IdentityId) -> EngineResult<Arc<IdentityKeys>> {
        if let Some(keys) = self.cache.read().get(id) {
            return Ok(keys.clone());
        }

        let record: KeyRecord = match self.store.get(NAMESPACE, &id.to_hex()) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(EngineError::NotFound(format!("identity {}", id.short()))),
            Err(StorageError::Corrupted { .. }) => {
                warn!(identity = %id.short(), "Identity record failed to unseal");
                return Err(EngineError::CorruptedIdentity(id.to_hex()));
            }
            Err(e) => return Err(e.into()),
        };

        let keys = IdentityKeys {
            signing: SigningSecret::from_bytes(record.signing),
            agreement: AgreementSecret::from_bytes(record.agreement),
        };
        if keys.public().id() != *id {
            warn!(identity = %id.short(), "Identity record holds keys for another identity");
            return Err(EngineError::CorruptedIdentity(id.to_hex()));
        }

        debug!(identity = %id.short(), "Loaded identity keys");
        let keys = Arc::new(keys);
        self.cache.write().insert(*id, keys.clone());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EphemeralKeypair;
    use crate::storage::{MemoryStorage, Storage, StorageKey};

    #[test]
    fn test_generate_and_sign() {
        let keystore = KeyStore::in_memory().unwrap();
        let public = keystore.generate_identity().unwrap();

        let handle = keystore.load_private_key(&public.id()).unwrap();
        let signature = keystore.sign(&handle, b"transcript");
        assert!(public.verify(b"transcript", &signature).is_ok());
        assert_eq!(handle.public_identity(), public);
    }

    #[test]
    fn test_unknown_identity() {
        let keystore = KeyStore::in_memory().unwrap();
        let missing = IdentityId([9u8; 32]);
        assert!(matches!(
            keystore.load_private_key(&missing),
            Err(EngineError::NotFound(_))
        ));
        assert!(!keystore.contains(&missing).unwrap());
    }

    #[test]
    fn test_key_agreement_matches_ephemeral_side() {
        let keystore = KeyStore::in_memory().unwrap();
        let public = keystore.generate_identity().unwrap();
        let handle = keystore.load_private_key(&public.id()).unwrap();

        let ephemeral = EphemeralKeypair::generate().unwrap();
        let ours = keystore
            .perform_key_agreement(&handle, ephemeral.public_key())
            .unwrap();
        let theirs = ephemeral.diffie_hellman(&public.agreement).unwrap();
        assert_eq!(ours.as_bytes(), theirs.as_bytes());
    }

    #[test]
    fn test_persisted_keys_reload() {
        let backend = Arc::new(MemoryStorage::new());
        let key = StorageKey::from_bytes([4u8; 32]);

        let public = KeyStore::open(SealedStore::new(backend.clone(), key.clone()))
            .generate_identity()
            .unwrap();

        let reopened = KeyStore::open(SealedStore::new(backend, key));
        assert_eq!(reopened.public_identity(&public.id()).unwrap(), public);
    }

    #[test]
    fn test_corrupted_record_is_fatal() {
        let backend = Arc::new(MemoryStorage::new());
        let key = StorageKey::from_bytes([4u8; 32]);
        let public = KeyStore::open(SealedStore::new(backend.clone(), key.clone()))
            .generate_identity()
            .unwrap();

        let name = public.id().to_hex();
        let mut raw = backend.get(NAMESPACE, &name).unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        backend.put(NAMESPACE, &name, &raw).unwrap();

        let reopened = KeyStore::open(SealedStore::new(backend, key));
        assert!(matches!(
            reopened.load_private_key(&public.id()),
            Err(EngineError::CorruptedIdentity(_))
        ));
    }

    #[test]
    fn test_remove_identity() {
        let keystore = KeyStore::in_memory().unwrap();
        let public = keystore.generate_identity().unwrap();
        keystore.remove_identity(&public.id()).unwrap();
        assert!(!keystore.contains(&public.id()).unwrap());
    }
}
