//! Versioned cache topology and the rebalance phase it is in.

use crate::statetransfer::RebalanceType;
use crate::topology::ConsistentHash;
use crate::types::{NodeId, TopologyId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Phase of a rebalance.
///
/// ```text
/// NoRebalance ──► ReadOldWriteAll ──► ReadAllWriteAll ──► ReadNewWriteAll ──► NoRebalance
///      │
///      └────────► ConflictResolution ──► NoRebalance
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Stable topology, only the current hash exists.
    NoRebalance,
    /// Reads use the current hash, writes go to the union. State moves.
    ReadOldWriteAll,
    /// Reads and writes use the union.
    ReadAllWriteAll,
    /// Reads use the pending hash, writes still go to the union.
    ReadNewWriteAll,
    /// Divergent copies from a partition merge are being reconciled.
    ConflictResolution,
}

impl Phase {
    /// Whether a rebalance is underway in this phase.
    pub fn is_rebalance(&self) -> bool {
        matches!(
            self,
            Phase::ReadOldWriteAll | Phase::ReadAllWriteAll | Phase::ReadNewWriteAll
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::NoRebalance => "NO_REBALANCE",
            Phase::ReadOldWriteAll => "READ_OLD_WRITE_ALL",
            Phase::ReadAllWriteAll => "READ_ALL_WRITE_ALL",
            Phase::ReadNewWriteAll => "READ_NEW_WRITE_ALL",
            Phase::ConflictResolution => "CONFLICT_RESOLUTION",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of a cache's topology.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheTopology {
    /// Monotonic topology id.
    pub topology_id: TopologyId,
    /// Id of the rebalance this topology belongs to.
    pub rebalance_id: u32,
    /// Hash in effect before the rebalance.
    pub current_ch: Arc<ConsistentHash>,
    /// Target hash of the rebalance, if any.
    pub pending_ch: Option<Arc<ConsistentHash>>,
    /// Union of current and pending, if a rebalance is underway.
    pub union_ch: Option<Arc<ConsistentHash>>,
    /// Rebalance phase.
    pub phase: Phase,
    /// Members of the cache.
    pub members: Vec<NodeId>,
    /// Members that have installed a topology and can serve requests.
    pub actual_members: Vec<NodeId>,
}

impl CacheTopology {
    /// A stable topology with a single hash.
    pub fn stable(topology_id: TopologyId, rebalance_id: u32, ch: ConsistentHash) -> Self {
        let members = ch.members().to_vec();
        Self {
            topology_id,
            rebalance_id,
            current_ch: Arc::new(ch),
            pending_ch: None,
            union_ch: None,
            phase: Phase::NoRebalance,
            actual_members: members.clone(),
            members,
        }
    }

    /// A rebalancing topology moving from `current` to `pending`.
    pub fn rebalancing(
        topology_id: TopologyId,
        rebalance_id: u32,
        current: Arc<ConsistentHash>,
        pending: Arc<ConsistentHash>,
        phase: Phase,
    ) -> Self {
        let union = Arc::new(current.union(&pending));
        let members = union.members().to_vec();
        Self {
            topology_id,
            rebalance_id,
            current_ch: current,
            pending_ch: Some(pending),
            union_ch: Some(union),
            phase,
            actual_members: members.clone(),
            members,
        }
    }

    /// Override the actual member list.
    pub fn with_actual_members(mut self, actual_members: Vec<NodeId>) -> Self {
        self.actual_members = actual_members;
        self
    }

    /// Hash used for reads in the current phase.
    pub fn read_ch(&self) -> &Arc<ConsistentHash> {
        match self.phase {
            Phase::ReadAllWriteAll => self.union_ch.as_ref().unwrap_or(&self.current_ch),
            Phase::ReadNewWriteAll => self.pending_ch.as_ref().unwrap_or(&self.current_ch),
            _ => &self.current_ch,
        }
    }

    /// Hash used for writes: the union while a pending hash exists.
    pub fn write_ch(&self) -> &Arc<ConsistentHash> {
        match (&self.pending_ch, &self.union_ch) {
            (Some(_), Some(union)) => union,
            _ => &self.current_ch,
        }
    }

    /// Whether `node` is a member of this topology.
    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// Whether `node` is an actual member of this topology.
    pub fn is_actual_member(&self, node: NodeId) -> bool {
        self.actual_members.contains(&node)
    }
}

impl std::fmt::Debug for CacheTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTopology")
            .field("topology_id", &self.topology_id)
            .field("rebalance_id", &self.rebalance_id)
            .field("phase", &self.phase)
            .field("members", &self.members)
            .field("has_pending_ch", &self.pending_ch.is_some())
            .finish()
    }
}

/// Join request sent to the topology coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheJoinInfo {
    /// Number of segments.
    pub num_segments: u32,
    /// Owners per segment.
    pub num_owners: usize,
    /// Rebalance protocol of the cache.
    pub rebalance_type: RebalanceType,
    /// How long the coordinator should wait for phase confirmations.
    pub timeout: Duration,
}

/// Holds the installed topology.
///
/// Readers get a cheap `Arc` snapshot; the manager swaps the whole
/// topology while holding the state transfer lock exclusively.
#[derive(Debug, Default)]
pub struct TopologyHolder {
    current: RwLock<Option<Arc<CacheTopology>>>,
}

impl TopologyHolder {
    /// Create an empty holder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The installed topology, if any.
    pub fn get(&self) -> Option<Arc<CacheTopology>> {
        self.current.read().clone()
    }

    /// Replace the installed topology, returning the previous one.
    pub fn swap(&self, topology: Arc<CacheTopology>) -> Option<Arc<CacheTopology>> {
        self.current.write().replace(topology)
    }

    /// Id of the installed topology, or -1 when none is installed.
    pub fn topology_id(&self) -> i64 {
        self.current
            .read()
            .as_ref()
            .map_or(-1, |t| t.topology_id as i64)
    }

    /// Drop the installed topology.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebalancing(phase: Phase) -> CacheTopology {
        let current = Arc::new(ConsistentHash::new(vec![], vec![vec![3, 4]]));
        let pending = Arc::new(ConsistentHash::new(vec![], vec![vec![3, 1]]));
        CacheTopology::rebalancing(5, 2, current, pending, phase)
    }

    #[test]
    fn test_read_ch_per_phase() {
        assert_eq!(
            rebalancing(Phase::ReadOldWriteAll).read_ch().locate_owners(0),
            &[3, 4]
        );
        assert_eq!(
            rebalancing(Phase::ReadAllWriteAll).read_ch().locate_owners(0),
            &[3, 4, 1]
        );
        assert_eq!(
            rebalancing(Phase::ReadNewWriteAll).read_ch().locate_owners(0),
            &[3, 1]
        );
    }

    #[test]
    fn test_write_ch_is_union_while_pending() {
        for phase in [
            Phase::ReadOldWriteAll,
            Phase::ReadAllWriteAll,
            Phase::ReadNewWriteAll,
        ] {
            assert_eq!(rebalancing(phase).write_ch().locate_owners(0), &[3, 4, 1]);
        }
        let stable = CacheTopology::stable(1, 1, ConsistentHash::distributed(4, 2, &[1, 2]));
        assert_eq!(stable.write_ch().locate_owners(0), &[1, 2]);
        assert_eq!(stable.members, vec![1, 2]);
    }

    #[test]
    fn test_holder_swap() {
        let holder = TopologyHolder::new();
        assert_eq!(holder.topology_id(), -1);
        let t = Arc::new(CacheTopology::stable(
            3,
            1,
            ConsistentHash::replicated(2, &[1]),
        ));
        assert!(holder.swap(t).is_none());
        assert_eq!(holder.topology_id(), 3);
        assert!(holder.get().is_some());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::ReadAllWriteAll.to_string(), "READ_ALL_WRITE_ALL");
        assert!(Phase::ReadNewWriteAll.is_rebalance());
        assert!(!Phase::ConflictResolution.is_rebalance());
    }
}
