//! Decides whether a write may land in the data container.
//!
//! While state transfer is tracked, every key written gets a
//! [`DiscardPolicy`] recording which classes of later writes must be
//! dropped. A live write blocks replayed history for its key; replayed
//! history never blocks a live write.
//!
//! ```text
//!   segment ──► key ──► DiscardPolicy { discard_st, discard_xsite }
//! ```

use crate::container::DataContainer;
use crate::types::{Mutation, SegmentId, WriteOrigin};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Which replay stream is being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackMode {
    /// Intra-cluster state transfer.
    StateTransfer,
    /// Cross-site state transfer.
    CrossSiteStateTransfer,
}

/// Classes of writes to drop for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscardPolicy {
    /// Drop state transfer writes.
    pub discard_st: bool,
    /// Drop cross-site state transfer writes.
    pub discard_xsite: bool,
}

impl DiscardPolicy {
    fn ignores(&self, origin: WriteOrigin) -> bool {
        match origin {
            WriteOrigin::Normal => false,
            WriteOrigin::StateTransfer => self.discard_st,
            WriteOrigin::CrossSiteStateTransfer => self.discard_xsite,
        }
    }

    fn is_permissive(&self) -> bool {
        !self.discard_st && !self.discard_xsite
    }

    fn without(self, mode: TrackMode) -> Self {
        match mode {
            TrackMode::StateTransfer => Self {
                discard_st: false,
                ..self
            },
            TrackMode::CrossSiteStateTransfer => Self {
                discard_xsite: false,
                ..self
            },
        }
    }
}

/// Per-key conflict resolver between live writes and replayed state.
pub struct CommitManager {
    container: Arc<dyn DataContainer>,
    tracker: DashMap<SegmentId, HashMap<Bytes, DiscardPolicy>>,
    track_st: AtomicBool,
    track_xsite: AtomicBool,
}

impl CommitManager {
    /// Create a manager writing into `container`.
    pub fn new(container: Arc<dyn DataContainer>) -> Self {
        Self {
            container,
            tracker: DashMap::new(),
            track_st: AtomicBool::new(false),
            track_xsite: AtomicBool::new(false),
        }
    }

    /// The container writes land in.
    pub fn container(&self) -> &Arc<dyn DataContainer> {
        &self.container
    }

    /// Commit a mutation. Returns false when the write was discarded.
    ///
    /// `local_only` writes go to a non-owned local copy and never
    /// participate in conflict resolution.
    pub fn commit(
        &self,
        mutation: Mutation,
        origin: WriteOrigin,
        segment: SegmentId,
        local_only: bool,
    ) -> bool {
        if local_only || (origin == WriteOrigin::Normal && !self.is_tracking_any()) {
            self.apply(mutation);
            return true;
        }

        // Flags are read again under the segment entry so that a concurrent
        // stop_track either sees this policy or prevents it from being added.
        let mut policies = self.tracker.entry(segment).or_default();
        let track_st = self.track_st.load(Ordering::Acquire);
        let track_xsite = self.track_xsite.load(Ordering::Acquire);

        match origin {
            WriteOrigin::StateTransfer if !track_st => {
                trace!(segment, "state transfer write after tracking stopped, discarding");
                return false;
            }
            WriteOrigin::CrossSiteStateTransfer if !track_xsite => {
                trace!(segment, "cross-site write after tracking stopped, discarding");
                return false;
            }
            _ => {}
        }

        let key = mutation.key().clone();
        if policies.get(&key).map_or(false, |p| p.ignores(origin)) {
            trace!(segment, ?origin, "write superseded, discarding");
            return false;
        }

        self.apply(mutation);

        let policy = DiscardPolicy {
            discard_st: track_st && origin != WriteOrigin::StateTransfer,
            discard_xsite: track_xsite && origin != WriteOrigin::CrossSiteStateTransfer,
        };
        if policy.is_permissive() {
            policies.remove(&key);
        } else {
            policies.insert(key, policy);
        }
        true
    }

    fn is_tracking_any(&self) -> bool {
        self.track_st.load(Ordering::Acquire) || self.track_xsite.load(Ordering::Acquire)
    }

    fn apply(&self, mutation: Mutation) {
        match mutation {
            Mutation::Put(entry) => self.container.put(entry),
            Mutation::Remove(key) => {
                self.container.remove(&key);
            }
        }
    }

    /// Start tracking a replay stream.
    pub fn start_track(&self, mode: TrackMode) {
        debug!(?mode, "start tracking");
        self.flag(mode).store(true, Ordering::Release);
    }

    /// Stop tracking a replay stream.
    ///
    /// Clears the whole tracker when no mode remains, otherwise prunes
    /// policies that became permissive.
    pub fn stop_track(&self, mode: TrackMode) {
        debug!(?mode, "stop tracking");
        self.flag(mode).store(false, Ordering::Release);

        if !self.is_tracking_any() {
            self.tracker.clear();
            return;
        }

        self.tracker.retain(|_, policies| {
            prune(policies, mode);
            !policies.is_empty()
        });
    }

    /// Drop tracking of `mode` for one segment, leaving other modes intact.
    pub fn stop_track_for(&self, mode: TrackMode, segment: SegmentId) {
        if let Some(mut policies) = self.tracker.get_mut(&segment) {
            prune(&mut policies, mode);
        }
        self.tracker
            .remove_if(&segment, |_, policies| policies.is_empty());
    }

    /// Whether `mode` is being tracked.
    pub fn is_tracking(&self, mode: TrackMode) -> bool {
        self.flag(mode).load(Ordering::Acquire)
    }

    /// Number of keys with a non-permissive policy.
    pub fn tracked_key_count(&self) -> usize {
        self.tracker.iter().map(|p| p.len()).sum()
    }

    /// Policy recorded for a key, if any.
    pub fn policy(&self, segment: SegmentId, key: &[u8]) -> Option<DiscardPolicy> {
        self.tracker
            .get(&segment)
            .and_then(|p| p.get(key).copied())
    }

    fn flag(&self, mode: TrackMode) -> &AtomicBool {
        match mode {
            TrackMode::StateTransfer => &self.track_st,
            TrackMode::CrossSiteStateTransfer => &self.track_xsite,
        }
    }
}

fn prune(policies: &mut HashMap<Bytes, DiscardPolicy>, mode: TrackMode) {
    policies.retain(|_, policy| {
        *policy = policy.without(mode);
        !policy.is_permissive()
    });
}

impl std::fmt::Debug for CommitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitManager")
            .field("track_st", &self.track_st.load(Ordering::Relaxed))
            .field("track_xsite", &self.track_xsite.load(Ordering::Relaxed))
            .field("tracked_segments", &self.tracker.len())
            .finish()
    }
}
