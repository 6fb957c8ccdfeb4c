//! In-memory data container backed by Moka.

use crate::topology::segment_for_key;
use crate::types::{CacheEntry, SegmentId};
use bytes::Bytes;
use moka::sync::Cache;
use std::collections::BTreeSet;

/// Local in-memory storage of cache entries.
///
/// Methods are synchronous so they can run inside the commit manager's
/// per-segment critical section.
pub trait DataContainer: Send + Sync + std::fmt::Debug {
    /// Get a live entry.
    fn get(&self, key: &[u8]) -> Option<CacheEntry>;

    /// Whether a live entry exists for the key.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite an entry.
    fn put(&self, entry: CacheEntry);

    /// Remove a key, returning the previous entry.
    fn remove(&self, key: &[u8]) -> Option<CacheEntry>;

    /// Remove every entry.
    fn clear(&self);

    /// Snapshot of all entries, expired ones included.
    fn entries(&self) -> Vec<CacheEntry>;

    /// Snapshot of all keys.
    fn keys(&self) -> Vec<Bytes> {
        self.entries().into_iter().map(|e| e.key).collect()
    }

    /// Number of entries.
    fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the container is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key whose segment is in `segments`. Returns the removed keys.
    fn remove_segments(&self, segments: &BTreeSet<SegmentId>, num_segments: u32) -> Vec<Bytes> {
        let doomed: Vec<Bytes> = self
            .keys()
            .into_iter()
            .filter(|k| segments.contains(&segment_for_key(k, num_segments)))
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed
    }
}

/// [`DataContainer`] backed by an unbounded `moka::sync::Cache`.
pub struct MokaDataContainer {
    cache: Cache<Bytes, CacheEntry>,
}

impl MokaDataContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().build(),
        }
    }

    /// Create an empty container bounded by the total size of keys and values.
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &Bytes, entry: &CacheEntry| {
                let size = key.len() + entry.value.len();
                size.min(u32::MAX as usize) as u32
            })
            .build();
        Self { cache }
    }
}

impl Default for MokaDataContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MokaDataContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaDataContainer")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl DataContainer for MokaDataContainer {
    fn get(&self, key: &[u8]) -> Option<CacheEntry> {
        let key = Bytes::copy_from_slice(key);
        self.cache.get(&key).filter(|e| !e.is_expired())
    }

    fn put(&self, entry: CacheEntry) {
        self.cache.insert(entry.key.clone(), entry);
    }

    fn remove(&self, key: &[u8]) -> Option<CacheEntry> {
        let key = Bytes::copy_from_slice(key);
        self.cache.remove(&key)
    }

    fn clear(&self) {
        // invalidate_all() is lazy; drop keys one by one so iteration and
        // len() agree right away.
        let keys: Vec<_> = self.cache.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.cache.invalidate(&*key);
        }
    }

    fn entries(&self) -> Vec<CacheEntry> {
        self.cache.iter().map(|(_, v)| v).collect()
    }

    fn keys(&self) -> Vec<Bytes> {
        self.cache.iter().map(|(k, _)| (*k).clone()).collect()
    }

    fn len(&self) -> usize {
        self.cache.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryMetadata;

    #[test]
    fn test_put_get_remove() {
        let container = MokaDataContainer::new();
        container.put(CacheEntry::new("a", "1"));
        assert_eq!(container.get(b"a").map(|e| e.value), Some(Bytes::from("1")));
        assert!(container.contains(b"a"));
        assert_eq!(container.len(), 1);

        let removed = container.remove(b"a");
        assert!(removed.is_some());
        assert!(container.get(b"a").is_none());
        assert!(container.is_empty());
    }

    #[test]
    fn test_expired_entry_is_hidden() {
        let container = MokaDataContainer::new();
        container.put(CacheEntry::with_metadata(
            "old",
            "v",
            EntryMetadata {
                expires_at_ms: Some(1),
                version: None,
            },
        ));
        assert!(container.get(b"old").is_none());
        assert_eq!(container.entries().len(), 1);
    }

    #[test]
    fn test_clear() {
        let container = MokaDataContainer::new();
        for i in 0..10 {
            container.put(CacheEntry::new(format!("k{}", i), "v"));
        }
        assert_eq!(container.len(), 10);
        container.clear();
        assert_eq!(container.len(), 0);
    }

    #[test]
    fn test_remove_segments() {
        let container = MokaDataContainer::new();
        for i in 0..50 {
            container.put(CacheEntry::new(format!("k{}", i), "v"));
        }
        let target = segment_for_key(b"k7", 4);
        let removed = container.remove_segments(&[target].into_iter().collect(), 4);
        assert!(!removed.is_empty());
        assert!(container
            .keys()
            .iter()
            .all(|k| segment_for_key(k, 4) != target));
    }
}
