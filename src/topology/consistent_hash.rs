//! Segment-based consistent hash.
//!
//! The key space is split into a fixed number of segments. A key maps to a
//! segment by hashing; each segment has an ordered owner list whose first
//! entry is the primary owner.
//!
//! ```text
//!   key ──xxhash64──► segment ──owners[segment]──► [primary, backup, ...]
//! ```

use crate::types::{NodeId, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Maps segments to ordered owner lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_segments: u32,
    members: Vec<NodeId>,
    owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    /// Build a hash from explicit owner lists, one per segment.
    ///
    /// Members are collected from the owner lists when `members` omits them.
    pub fn new(members: Vec<NodeId>, owners: Vec<Vec<NodeId>>) -> Self {
        let mut all = members;
        for segment_owners in &owners {
            for owner in segment_owners {
                if !all.contains(owner) {
                    all.push(*owner);
                }
            }
        }
        Self {
            num_segments: owners.len() as u32,
            members: all,
            owners,
        }
    }

    /// Every member owns every segment.
    pub fn replicated(num_segments: u32, members: &[NodeId]) -> Self {
        let owners = (0..num_segments).map(|_| members.to_vec()).collect();
        Self {
            num_segments,
            members: members.to_vec(),
            owners,
        }
    }

    /// Round-robin placement: segment `s` is owned by
    /// `members[(s + i) % n]` for `i` in `0..num_owners`.
    pub fn distributed(num_segments: u32, num_owners: usize, members: &[NodeId]) -> Self {
        let n = members.len();
        let count = num_owners.min(n);
        let owners = (0..num_segments as usize)
            .map(|s| (0..count).map(|i| members[(s + i) % n]).collect())
            .collect();
        Self {
            num_segments,
            members: members.to_vec(),
            owners,
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Members known to this hash, in join order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Segment a key belongs to.
    pub fn segment_for_key(&self, key: &[u8]) -> SegmentId {
        segment_for_key(key, self.num_segments)
    }

    /// Ordered owners of a segment. Empty for unknown or ownerless segments.
    pub fn locate_owners(&self, segment: SegmentId) -> &[NodeId] {
        self.owners
            .get(segment as usize)
            .map(|o| o.as_slice())
            .unwrap_or(&[])
    }

    /// Ordered owners of a key.
    pub fn locate_key_owners(&self, key: &[u8]) -> &[NodeId] {
        self.locate_owners(self.segment_for_key(key))
    }

    /// First owner of a segment.
    pub fn primary_owner(&self, segment: SegmentId) -> Option<NodeId> {
        self.locate_owners(segment).first().copied()
    }

    /// Segments for which `node` is any owner.
    pub fn segments_for_owner(&self, node: NodeId) -> BTreeSet<SegmentId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(&node))
            .map(|(s, _)| s as SegmentId)
            .collect()
    }

    /// Whether `node` owns `segment`.
    pub fn is_segment_local_to(&self, node: NodeId, segment: SegmentId) -> bool {
        self.locate_owners(segment).contains(&node)
    }

    /// Whether `node` owns the segment of `key`.
    pub fn is_key_local_to(&self, node: NodeId, key: &[u8]) -> bool {
        self.is_segment_local_to(node, self.segment_for_key(key))
    }

    /// Union of two hashes with the same segment count.
    ///
    /// Owners of `self` come first, followed by the owners only `other` has.
    pub fn union(&self, other: &ConsistentHash) -> ConsistentHash {
        let mut members = self.members.clone();
        for m in &other.members {
            if !members.contains(m) {
                members.push(*m);
            }
        }
        let owners = (0..self.num_segments)
            .map(|s| {
                let mut merged = self.locate_owners(s).to_vec();
                for o in other.locate_owners(s) {
                    if !merged.contains(o) {
                        merged.push(*o);
                    }
                }
                merged
            })
            .collect();
        ConsistentHash {
            num_segments: self.num_segments,
            members,
            owners,
        }
    }

    /// Copy of this hash with `leavers` removed from members and owners.
    ///
    /// Segments whose owners all left end up ownerless.
    pub fn without_members(&self, leavers: &[NodeId]) -> ConsistentHash {
        ConsistentHash {
            num_segments: self.num_segments,
            members: self
                .members
                .iter()
                .copied()
                .filter(|m| !leavers.contains(m))
                .collect(),
            owners: self
                .owners
                .iter()
                .map(|o| o.iter().copied().filter(|m| !leavers.contains(m)).collect())
                .collect(),
        }
    }
}

/// Hash a key into `[0, num_segments)`.
pub fn segment_for_key(key: &[u8], num_segments: u32) -> SegmentId {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    (hasher.finish() % num_segments.max(1) as u64) as SegmentId
}
