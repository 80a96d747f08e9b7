/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Durable string key-value persistence.
 */

use crate::error::{AuthError, AuthResult};

use log::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage key holding the active certificate id
pub const CERTIFICATE_ID_KEY: &str = "certificateId";

/// Storage key holding the active certificate ARN (`from-bundle` for imported identities)
pub const CERTIFICATE_ARN_KEY: &str = "certificateArn";

/// Storage key holding a cached PEM private key used for token signing
pub const PRIVATE_KEY_KEY: &str = "private.key";

/// Process-wide string key-value persistence
pub trait KeyValueStore : Send + Sync {

    /// Returns the value stored under a key, if any
    fn get(&self, key: &str) -> AuthResult<Option<String>>;

    /// Stores a value under a key, replacing any previous value
    fn set(&self, key: &str, value: &str) -> AuthResult<()>;

    /// Removes a key; removing an absent key is not an error
    fn remove(&self, key: &str) -> AuthResult<()>;
}

/// Key-value store kept entirely in memory
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<BTreeMap<String, String>>
}

impl MemoryKeyValueStore {

    /// Creates a new, empty store
    pub fn new() -> Self {
        MemoryKeyValueStore::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> AuthResult<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        self.values.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AuthResult<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Key-value store persisted as a JSON object in a single file.
///
/// Every mutation rewrites the file through a temporary sibling and a rename, so a crash
/// mid-write leaves the previous contents intact.
pub struct FileKeyValueStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>
}

impl FileKeyValueStore {

    /// Opens (or lazily creates) a store backed by the file at `path`
    pub fn open(path: impl Into<PathBuf>) -> AuthResult<Self> {
        let path = path.into();
        let values =
            if path.exists() {
                let contents = fs::read_to_string(&path)?;
                if contents.trim().is_empty() {
                    BTreeMap::new()
                } else {
                    serde_json::from_str(&contents)?
                }
            } else {
                BTreeMap::new()
            };

        debug!("FileKeyValueStore::open - loaded {} values from {}", values.len(), path.display());

        Ok(FileKeyValueStore {
            path,
            values: Mutex::new(values)
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let serialized = serde_json::to_string_pretty(values)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, serialized).map_err(AuthError::new_storage_error)?;
        fs::rename(&temp_path, &self.path).map_err(AuthError::new_storage_error)?;

        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> AuthResult<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> AuthResult<()> {
        let mut values = self.values.lock().unwrap();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(None, store.get(CERTIFICATE_ID_KEY).unwrap());

        store.set(CERTIFICATE_ID_KEY, "abc").unwrap();
        assert_eq!(Some("abc".to_string()), store.get(CERTIFICATE_ID_KEY).unwrap());

        store.remove(CERTIFICATE_ID_KEY).unwrap();
        store.remove(CERTIFICATE_ID_KEY).unwrap();
        assert_eq!(None, store.get(CERTIFICATE_ID_KEY).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        {
            let store = FileKeyValueStore::open(&path).unwrap();
            store.set(CERTIFICATE_ID_KEY, "device-1").unwrap();
            store.set(CERTIFICATE_ARN_KEY, "from-bundle").unwrap();
        }

        let reopened = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(Some("device-1".to_string()), reopened.get(CERTIFICATE_ID_KEY).unwrap());
        assert_eq!(Some("from-bundle".to_string()), reopened.get(CERTIFICATE_ARN_KEY).unwrap());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_store_rejects_corrupt_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(FileKeyValueStore::open(&path).is_err());
    }
}
