//! In-memory storage backend

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{validate_name, Storage, StorageResult};

/// Volatile backend; contents vanish with the value.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_name(namespace)?;
        validate_name(key)?;
        self.records
            .write()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .records
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        self.records
            .write()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn list(&self, namespace: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .records
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}
