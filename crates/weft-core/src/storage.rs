//! Keyed blob storage
//!
//! A small key-value abstraction with named contexts. Subsystems persist
//! postcard-serialized records under a context of their own (the
//! certificate authority uses `"certificates"`, the session manager uses
//! `"sessions"`). Backed by sled for persistence and by a map for tests.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("key not found: {context}/{key}")]
    KeyNotFound { context: String, key: String },
}

/// Keyed blob store with named contexts.
pub trait Storage: Send + Sync {
    /// Fetch a blob, or `None` when absent.
    fn get(&self, context: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a blob, replacing any existing value.
    fn set(&self, context: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a blob; removing an absent key is not an error.
    fn delete(&self, context: &str, key: &str) -> Result<(), StorageError>;

    /// All keys currently present in a context.
    fn keys(&self, context: &str) -> Result<Vec<String>, StorageError>;
}

/// Handle binding a [`Storage`] to one context.
#[derive(Clone)]
pub struct StorageContext {
    storage: Arc<dyn Storage>,
    context: String,
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl StorageContext {
    pub fn new(storage: Arc<dyn Storage>, context: impl Into<String>) -> Self {
        Self {
            storage,
            context: context.into(),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage.get(&self.context, key)
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.storage.set(&self.context, key, value)
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.storage.delete(&self.context, key)
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.storage.keys(&self.context)
    }

    /// Fetch and postcard-decode a record.
    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Postcard-encode and store a record.
    pub fn set_record<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(value)?;
        self.set(key, &bytes)
    }
}

/// In-memory storage for tests and ephemeral controllers.
#[derive(Default)]
pub struct MemoryStorage {
    contexts: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, context: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .contexts
            .read()
            .get(context)
            .and_then(|c| c.get(key))
            .cloned())
    }

    fn set(&self, context: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.contexts
            .write()
            .entry(context.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, context: &str, key: &str) -> Result<(), StorageError> {
        if let Some(c) = self.contexts.write().get_mut(context) {
            c.remove(key);
        }
        Ok(())
    }

    fn keys(&self, context: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .contexts
            .read()
            .get(context)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Persistent storage backed by sled; one tree per context.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn tree(&self, context: &str) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(context)?)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn get(&self, context: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tree(context)?.get(key)?.map(|v| v.to_vec()))
    }

    fn set(&self, context: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.tree(context)?.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, context: &str, key: &str) -> Result<(), StorageError> {
        self.tree(context)?.remove(key)?;
        Ok(())
    }

    fn keys(&self, context: &str) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        for entry in self.tree(context)?.iter() {
            let (key, _) = entry?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(storage: Arc<dyn Storage>) {
        let ctx = StorageContext::new(storage, "certificates");

        assert!(ctx.get("rootCertId").unwrap().is_none());
        ctx.set("rootCertId", &[1, 2, 3]).unwrap();
        assert_eq!(ctx.get("rootCertId").unwrap().unwrap(), vec![1, 2, 3]);

        ctx.set_record("nextCertificateId", &42u64).unwrap();
        assert_eq!(
            ctx.get_record::<u64>("nextCertificateId").unwrap(),
            Some(42)
        );

        let mut keys = ctx.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["nextCertificateId", "rootCertId"]);

        ctx.delete("rootCertId").unwrap();
        assert!(ctx.get("rootCertId").unwrap().is_none());
        // Deleting twice is fine.
        ctx.delete("rootCertId").unwrap();
    }

    #[test]
    fn test_memory_storage() {
        exercise(Arc::new(MemoryStorage::new()));
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempdir().unwrap();
        exercise(Arc::new(SledStorage::open(dir.path()).unwrap()));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let storage = Arc::new(MemoryStorage::new());
        let a = StorageContext::new(storage.clone(), "a");
        let b = StorageContext::new(storage, "b");

        a.set("key", &[1]).unwrap();
        assert!(b.get("key").unwrap().is_none());
    }
}
