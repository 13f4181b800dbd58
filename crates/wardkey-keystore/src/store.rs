//! The secure key-value store this crate runs on.
//!
//! The platform keychain (or whatever provides confidentiality at rest) is
//! an external collaborator. It is reached only through [`SecureStore`];
//! [`MemoryStore`] is the in-process implementation used by tests and by
//! embedders that have no keychain.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;

/// Async key-value store with per-entry confidentiality at rest.
///
/// No transaction primitive is assumed: every call is independent.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Create or overwrite a value.
    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Every entry in the store.
    async fn read_all(&self) -> Result<Vec<(String, String)>, StorageError>;
}

/// A [`SecureStore`] held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// `true` when the store holds nothing.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SecureStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<(String, String)>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
