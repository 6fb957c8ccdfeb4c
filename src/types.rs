//! Core types used throughout the state transfer engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Segment identifier, always in `[0, num_segments)`.
pub type SegmentId = u32;

/// Monotonic cache topology identifier.
pub type TopologyId = u32;

/// Metadata carried with every cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Absolute expiration time in milliseconds since Unix epoch.
    /// None means no expiration.
    pub expires_at_ms: Option<u64>,

    /// Entry version, when versioning is enabled.
    pub version: Option<u64>,
}

impl EntryMetadata {
    /// Metadata expiring after `ttl` from now.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            expires_at_ms: Some(now_ms() + ttl.as_millis() as u64),
            version: None,
        }
    }

    /// Set the entry version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at_ms
            .map_or(false, |expires_at| expires_at <= now_ms())
    }
}

/// A key/value pair with its metadata, as stored and as transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key.
    pub key: Bytes,
    /// The cache value.
    pub value: Bytes,
    /// Expiration and version information.
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create a new entry without expiration.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: EntryMetadata::default(),
        }
    }

    /// Create a new entry with explicit metadata.
    pub fn with_metadata(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        metadata: EntryMetadata,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata,
        }
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired()
    }
}

/// A single-key change committed to the data container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or overwrite an entry.
    Put(CacheEntry),
    /// Remove a key.
    Remove(Bytes),
}

impl Mutation {
    /// The key this mutation touches.
    pub fn key(&self) -> &Bytes {
        match self {
            Mutation::Put(entry) => &entry.key,
            Mutation::Remove(key) => key,
        }
    }
}

/// Where a write comes from, as seen by the commit manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteOrigin {
    /// A live write issued by an application.
    Normal,
    /// Historical data replayed by state transfer.
    StateTransfer,
    /// Historical data replayed by cross-site state transfer.
    CrossSiteStateTransfer,
}

/// Per-command behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Flag {
    /// Write issued by state transfer.
    PutForStateTransfer = 1 << 0,
    /// Write issued by cross-site state transfer.
    PutForXSiteStateTransfer = 1 << 1,
    /// Apply on this node only.
    CacheModeLocal = 1 << 2,
    /// Do not check key ownership.
    SkipOwnershipCheck = 1 << 3,
    /// Do not acquire key locks.
    SkipLocking = 1 << 4,
    /// Do not read from or write to the persistent store.
    SkipCacheStore = 1 << 5,
}

/// A compact set of [`Flag`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags(u16);

impl Flags {
    /// The empty flag set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags used when applying received state.
    pub fn state_transfer() -> Self {
        Self::empty()
            .with(Flag::PutForStateTransfer)
            .with(Flag::CacheModeLocal)
            .with(Flag::SkipOwnershipCheck)
            .with(Flag::SkipLocking)
            .with(Flag::SkipCacheStore)
    }

    /// Add a flag.
    pub const fn with(self, flag: Flag) -> Self {
        Self(self.0 | flag as u16)
    }

    /// Check whether a flag is set.
    pub const fn contains(&self, flag: Flag) -> bool {
        (self.0 & flag as u16) != 0
    }

    /// The write origin implied by these flags.
    pub fn write_origin(&self) -> WriteOrigin {
        if self.contains(Flag::PutForStateTransfer) {
            WriteOrigin::StateTransfer
        } else if self.contains(Flag::PutForXSiteStateTransfer) {
            WriteOrigin::CrossSiteStateTransfer
        } else {
            WriteOrigin::Normal
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiration() {
        let live = CacheEntry::with_metadata(
            "k",
            "v",
            EntryMetadata::with_ttl(Duration::from_secs(3600)),
        );
        assert!(!live.is_expired());

        let expired = CacheEntry::with_metadata(
            "k",
            "v",
            EntryMetadata {
                expires_at_ms: Some(now_ms() - 1_000),
                version: None,
            },
        );
        assert!(expired.is_expired());
        assert!(!CacheEntry::new("k", "v").is_expired());
    }

    #[test]
    fn test_flags() {
        let flags = Flags::state_transfer();
        assert!(flags.contains(Flag::PutForStateTransfer));
        assert!(flags.contains(Flag::SkipLocking));
        assert!(!flags.contains(Flag::PutForXSiteStateTransfer));
        assert_eq!(flags.write_origin(), WriteOrigin::StateTransfer);
        assert_eq!(Flags::empty().write_origin(), WriteOrigin::Normal);
        assert_eq!(
            Flags::empty()
                .with(Flag::PutForXSiteStateTransfer)
                .write_origin(),
            WriteOrigin::CrossSiteStateTransfer
        );
    }

    #[test]
    fn test_mutation_key() {
        let put = Mutation::Put(CacheEntry::new("a", "1"));
        let remove = Mutation::Remove(Bytes::from_static(b"b"));
        assert_eq!(put.key().as_ref(), b"a");
        assert_eq!(remove.key().as_ref(), b"b");
    }
}
