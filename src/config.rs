//! Configuration types for the state transfer engine.

use crate::error::{Error, Result};
use crate::statetransfer::RebalanceType;
use crate::types::CacheEntry;
use smol_str::SmolStr;
use std::time::Duration;

/// Clustering mode of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Single node, no data movement.
    Local,
    /// Peers only receive invalidations, no data movement.
    Invalidation,
    /// Every member owns every segment.
    Replicated,
    /// Each segment has `num_owners` owners.
    Distributed,
}

impl CacheMode {
    /// Whether the mode keeps copies of data on several nodes.
    pub fn is_clustered_with_state(&self) -> bool {
        matches!(self, CacheMode::Replicated | CacheMode::Distributed)
    }
}

/// Policy used to reconcile divergent copies after a partition merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep the value held by the preferred partition.
    PreferExisting,
    /// Keep any non-null value.
    PreferNonNull,
    /// Remove conflicting keys.
    RemoveAll,
}

impl MergePolicy {
    /// Pick the surviving copy of a conflicting key. `preferred` is the
    /// primary owner's copy; `None` means remove the key everywhere.
    pub fn merge(&self, preferred: Option<&CacheEntry>, others: &[&CacheEntry]) -> Option<CacheEntry> {
        match self {
            MergePolicy::PreferExisting => preferred.cloned(),
            MergePolicy::PreferNonNull => preferred.or_else(|| others.first().copied()).cloned(),
            MergePolicy::RemoveAll => None,
        }
    }
}

/// Main configuration for a cache's state transfer.
#[derive(Debug, Clone)]
pub struct StateTransferConfig {
    /// Name of the cache this configuration belongs to.
    pub cache_name: SmolStr,

    /// Clustering mode.
    pub cache_mode: CacheMode,

    /// Whether the cache is transactional; in-flight transactions are
    /// migrated to new owners before segment data.
    pub transactional: bool,

    /// Number of segments the key space is split into.
    pub num_segments: u32,

    /// Owners per segment in distributed mode.
    pub num_owners: usize,

    /// Whether to pull in-memory state from other owners.
    pub fetch_in_memory_state: bool,

    /// Whether `start()` blocks until the initial transfer is done.
    pub await_initial_transfer: bool,

    /// Timeout for state transfer RPCs and chunk application.
    pub timeout: Duration,

    /// Timeout for joining the cluster and receiving initial state.
    pub join_timeout: Duration,

    /// Maximum number of entries buffered before a batch is flushed.
    pub chunk_size: usize,

    /// Maximum number of chunks applied concurrently.
    pub apply_concurrency: usize,

    /// Merge policy; when set, data pending conflict resolution is not
    /// purged during the conflict resolution phase.
    pub merge_policy: Option<MergePolicy>,

    /// Wire frames larger than this many bytes are compressed.
    pub compress_threshold: usize,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            cache_name: SmolStr::new("default"),
            cache_mode: CacheMode::Distributed,
            transactional: false,
            num_segments: 256,
            num_owners: 2,
            fetch_in_memory_state: true,
            await_initial_transfer: true,
            timeout: Duration::from_secs(240),
            join_timeout: Duration::from_secs(240),
            chunk_size: 512,
            apply_concurrency: 4,
            merge_policy: None,
            compress_threshold: 64 * 1024,
        }
    }
}

impl StateTransferConfig {
    /// Create a new configuration for the named cache.
    pub fn new(cache_name: impl Into<SmolStr>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    /// Set the cache mode.
    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Enable or disable transactions.
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// Set the number of segments.
    pub fn with_num_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Set the number of owners per segment.
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    /// Enable or disable fetching in-memory state.
    pub fn with_fetch_in_memory_state(mut self, fetch: bool) -> Self {
        self.fetch_in_memory_state = fetch;
        self
    }

    /// Enable or disable waiting for the initial transfer on start.
    pub fn with_await_initial_transfer(mut self, await_transfer: bool) -> Self {
        self.await_initial_transfer = await_transfer;
        self
    }

    /// Set the state transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the join timeout.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the chunk application concurrency.
    pub fn with_apply_concurrency(mut self, concurrency: usize) -> Self {
        self.apply_concurrency = concurrency;
        self
    }

    /// Set the merge policy.
    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = Some(policy);
        self
    }

    /// Set the compression threshold for wire frames.
    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    /// The rebalance protocol this cache mode runs.
    pub fn rebalance_type(&self) -> RebalanceType {
        if self.cache_mode.is_clustered_with_state() {
            RebalanceType::FourPhase
        } else {
            RebalanceType::None
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.is_empty() {
            return Err(Error::Config("cache name must not be empty".into()));
        }
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be positive".into()));
        }
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.apply_concurrency == 0 {
            return Err(Error::Config("apply_concurrency must be positive".into()));
        }
        if self.timeout.is_zero() || self.join_timeout.is_zero() {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}
