//! Persistent store abstraction.

use crate::error::{Result, StorageError};
use crate::types::CacheEntry;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// Backing store for entries that may not be in memory.
#[async_trait]
pub trait PersistenceManager: Send + Sync + std::fmt::Debug {
    /// Load a single entry.
    async fn load(&self, key: &[u8]) -> Result<Option<CacheEntry>>;

    /// All keys accepted by `filter`.
    async fn load_all_keys(&self, filter: &(dyn for<'k> Fn(&'k [u8]) -> bool + Send + Sync)) -> Result<Vec<Bytes>>;

    /// Write an entry.
    async fn write(&self, entry: CacheEntry) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Number of stored entries.
    async fn size(&self) -> Result<usize>;
}

/// Ordered in-memory [`PersistenceManager`].
///
/// Individual keys can be marked as failing to load, which is how tests
/// exercise the provider's per-key error handling.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    entries: RwLock<BTreeMap<Bytes, CacheEntry>>,
    failing: RwLock<HashSet<Bytes>>,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make loads of `key` fail.
    pub fn fail_loads_for(&self, key: impl Into<Bytes>) {
        self.failing.write().insert(key.into());
    }

    /// Whether the store holds `key`.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.read().contains_key(key)
    }
}

#[async_trait]
impl PersistenceManager for InMemoryPersistence {
    async fn load(&self, key: &[u8]) -> Result<Option<CacheEntry>> {
        if self.failing.read().contains(key) {
            return Err(StorageError::Load {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: "injected failure".into(),
            }
            .into());
        }
        Ok(self.entries.read().get(key).cloned())
    }

    async fn load_all_keys(&self, filter: &(dyn for<'k> Fn(&'k [u8]) -> bool + Send + Sync)) -> Result<Vec<Bytes>> {
        let entries = self.entries.read();
        let keys = entries.keys().filter(|k| filter(k)).cloned().collect();
        Ok(keys)
    }

    async fn write(&self, entry: CacheEntry) -> Result<()> {
        self.entries.write().insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_load_delete() {
        let store = InMemoryPersistence::new();
        store.write(CacheEntry::new("a", "1")).await.unwrap();
        store.write(CacheEntry::new("b", "2")).await.unwrap();

        assert_eq!(store.size().await.unwrap(), 2);
        assert_eq!(
            store.load(b"a").await.unwrap().map(|e| e.value),
            Some(Bytes::from("1"))
        );
        assert!(store.delete(b"a").await.unwrap());
        assert!(!store.delete(b"a").await.unwrap());
        assert!(store.load(b"a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filtered_keys() {
        let store = InMemoryPersistence::new();
        for k in ["x1", "x2", "y1"] {
            store.write(CacheEntry::new(k, "v")).await.unwrap();
        }
        let keys = store
            .load_all_keys(&|k: &[u8]| k.starts_with(b"x"))
            .await
            .unwrap();
        assert_eq!(keys, vec![Bytes::from("x1"), Bytes::from("x2")]);
    }

    #[tokio::test]
    async fn test_injected_load_failure() {
        let store = InMemoryPersistence::new();
        store.write(CacheEntry::new("bad", "v")).await.unwrap();
        store.fail_loads_for("bad");
        assert!(store.load(b"bad").await.is_err());
    }
}
