//! Directory-backed storage
//!
//! Layout: `<root>/<namespace>/<key>`. Writes go to a temporary file in the
//! same directory and are renamed into place, so a crash leaves either the
//! old or the new value, never a torn one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{validate_name, Storage, StorageResult};

const TMP_SUFFIX: &str = ".tmp";

/// Backend storing one file per record
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    /// Open (creating if needed) a storage directory
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(DirStorage {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, namespace: &str, key: &str) -> StorageResult<PathBuf> {
        validate_name(namespace)?;
        validate_name(key)?;
        Ok(self.root.join(namespace).join(key))
    }
}

impl Storage for DirStorage {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.path(namespace, key)?;
        let dir = self.root.join(namespace);
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!("{key}{TMP_SUFFIX}"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path(namespace, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        let path = self.path(namespace, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, namespace: &str) -> StorageResult<Vec<String>> {
        validate_name(namespace)?;
        let dir = self.root.join(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(name) = name.to_str() {
                if !name.ends_with(TMP_SUFFIX) && validate_name(name).is_ok() {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::open(dir.path()).unwrap();

        storage.put("sessions", "abc", b"value").unwrap();
        assert_eq!(storage.get("sessions", "abc").unwrap(), Some(b"value".to_vec()));
        assert_eq!(storage.list("sessions").unwrap(), vec!["abc".to_string()]);
        assert!(storage.list("empty").unwrap().is_empty());

        storage.put("sessions", "abc", b"newer").unwrap();
        assert_eq!(storage.get("sessions", "abc").unwrap(), Some(b"newer".to_vec()));

        storage.delete("sessions", "abc").unwrap();
        assert!(storage.get("sessions", "abc").unwrap().is_none());
    }

    #[test]
    fn test_dir_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        DirStorage::open(dir.path())
            .unwrap()
            .put("keys", "one", b"persisted")
            .unwrap();

        let reopened = DirStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.get("keys", "one").unwrap(), Some(b"persisted".to_vec()));
    }

    #[test]
    fn test_dir_storage_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::open(dir.path()).unwrap();
        assert!(storage.put("..", "x", b"").is_err());
        assert!(storage.get("keys", "../x").is_err());
    }
}
