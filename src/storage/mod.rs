//! Persistence backends
//!
//! The engine persists three kinds of records: sealed private keys, registry
//! entries and session state. All of them go through [`SealedStore`], which
//! encrypts every value under a storage key before it reaches a [`Storage`]
//! backend. Backends only ever see ciphertext.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::crypto::{Cipher, CryptoError};

mod dir;
mod memory;

pub use dir::DirStorage;
pub use memory::MemoryStorage;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Namespace or key contains characters a backend cannot store
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// A record exists but does not unseal or decode
    #[error("Corrupted record {namespace}/{key}")]
    Corrupted {
        /// Record namespace
        namespace: String,
        /// Record key
        key: String,
    },

    /// Value could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Sealing failed
    #[error("Sealing failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A flat key-value backend grouped by namespace.
///
/// Implementations must be thread-safe; every call is independent and a
/// `put` must be durable (or fail) before it returns.
pub trait Storage: Send + Sync {
    /// Store `value`, replacing any previous value
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Fetch a value, `None` if absent
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Remove a value; removing a missing key is not an error
    fn delete(&self, namespace: &str, key: &str) -> StorageResult<()>;

    /// List keys in a namespace
    fn list(&self, namespace: &str) -> StorageResult<Vec<String>>;
}

/// Namespaces and keys are restricted to `[A-Za-z0-9_-]` so every backend
/// can map them to file names.
pub(crate) fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    Ok(())
}

/// Key that seals everything the engine writes to disk
#[derive(Clone, ZeroizeOnDrop)]
pub struct StorageKey([u8; 32]);

impl StorageKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        StorageKey(bytes)
    }

    /// Draw a fresh random key
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(StorageKey(crate::crypto::try_random_bytes()?))
    }

    /// Hex form, for writing the key to a protected file
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// Parse the hex form
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| CryptoError::Encoding(e.to_string()))?,
        );
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(StorageKey(arr))
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageKey(..)")
    }
}

/// JSON records sealed with ChaCha20-Poly1305 on top of a [`Storage`].
///
/// The associated data is `namespace/key`, so a record copied to another
/// slot fails to unseal.
#[derive(Clone)]
pub struct SealedStore {
    backend: Arc<dyn Storage>,
    key: StorageKey,
}

impl SealedStore {
    /// Wrap a backend
    pub fn new(backend: Arc<dyn Storage>, key: StorageKey) -> Self {
        SealedStore { backend, key }
    }

    /// Volatile store with a random key, for tests and ephemeral engines
    pub fn in_memory() -> StorageResult<Self> {
        Ok(SealedStore::new(
            Arc::new(MemoryStorage::new()),
            StorageKey::generate()?,
        ))
    }

    /// Seal and store a record
    pub fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> StorageResult<()> {
        let plain = Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?,
        );
        let sealed = Cipher::seal_random(&self.key.0, &plain, &aad(namespace, key))?;
        self.backend.put(namespace, key, &sealed)
    }

    /// Fetch and unseal a record.
    ///
    /// A record that fails to unseal or decode is reported as
    /// [`StorageError::Corrupted`], never as absent.
    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> StorageResult<Option<T>> {
        let Some(sealed) = self.backend.get(namespace, key)? else {
            return Ok(None);
        };
        let corrupted = || StorageError::Corrupted {
            namespace: namespace.to_string(),
            key: key.to_string(),
        };

        let plain = Zeroizing::new(
            Cipher::open_random(&self.key.0, &sealed, &aad(namespace, key))
                .map_err(|_| corrupted())?,
        );
        serde_json::from_slice(&plain)
            .map(Some)
            .map_err(|_| corrupted())
    }

    /// Remove a record
    pub fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        self.backend.delete(namespace, key)
    }

    /// List record keys in a namespace
    pub fn list(&self, namespace: &str) -> StorageResult<Vec<String>> {
        self.backend.list(namespace)
    }
}

fn aad(namespace: &str, key: &str) -> Vec<u8> {
    format!("parley-storage-v1/{namespace}/{key}").into_bytes()
}
