//! Transaction table.
//!
//! Tracks the transactions this node participates in, so that in-flight
//! transactions on migrating segments can be handed to new owners before
//! any segment data arrives.

use crate::command::Modification;
use crate::topology::segment_for_key;
use crate::types::{SegmentId, TopologyId};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Cluster-wide transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTxId(Uuid);

impl GlobalTxId {
    /// Create a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GlobalTxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GlobalTxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gtx-{}", self.0)
    }
}

/// Transferable description of an in-flight transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Transaction id.
    pub gtx: GlobalTxId,
    /// Topology the transaction was prepared in.
    pub topology_id: TopologyId,
    /// Writes prepared so far.
    pub modifications: Vec<Modification>,
    /// Keys locked by the transaction.
    pub locked_keys: Vec<Bytes>,
}

/// A transaction tracked by the local table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTransaction {
    /// Transaction id.
    pub gtx: GlobalTxId,
    /// Topology the transaction was created in.
    pub topology_id: TopologyId,
    /// Prepared writes.
    pub modifications: Vec<Modification>,
    /// Keys locked on behalf of the transaction on this node.
    pub backup_locks: BTreeSet<Bytes>,
}

impl RemoteTransaction {
    fn touches_segment(&self, segments: &BTreeSet<SegmentId>, num_segments: u32) -> bool {
        self.modifications
            .iter()
            .map(|m| m.key())
            .chain(self.backup_locks.iter())
            .any(|k| segments.contains(&segment_for_key(k, num_segments)))
    }

    fn to_info(&self) -> TransactionInfo {
        TransactionInfo {
            gtx: self.gtx,
            topology_id: self.topology_id,
            modifications: self.modifications.clone(),
            locked_keys: self.backup_locks.iter().cloned().collect(),
        }
    }
}

/// Local view of in-flight transactions.
pub trait TransactionTable: Send + Sync + std::fmt::Debug {
    /// Look up a transaction or create it. Returns true when created.
    fn get_or_create_remote(&self, gtx: GlobalTxId, topology_id: TopologyId) -> bool;

    /// Record locks held on behalf of a transaction.
    fn add_backup_locks(&self, gtx: GlobalTxId, keys: &[Bytes]);

    /// Release locks held on behalf of a transaction.
    fn release_backup_locks(&self, gtx: GlobalTxId, keys: &[Bytes]);

    /// Append prepared writes to a transaction.
    fn add_modifications(&self, gtx: GlobalTxId, modifications: &[Modification]);

    /// Forget a transaction, returning it.
    fn remove(&self, gtx: GlobalTxId) -> Option<RemoteTransaction>;

    /// Snapshot of one transaction.
    fn get(&self, gtx: GlobalTxId) -> Option<RemoteTransaction>;

    /// Transactions touching any of the given segments.
    fn transactions_for_segments(
        &self,
        segments: &BTreeSet<SegmentId>,
        num_segments: u32,
    ) -> Vec<TransactionInfo>;

    /// Number of tracked transactions.
    fn len(&self) -> usize;

    /// Whether the table is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`TransactionTable`] kept in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryTransactionTable {
    transactions: DashMap<GlobalTxId, RemoteTransaction>,
}

impl InMemoryTransactionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionTable for InMemoryTransactionTable {
    fn get_or_create_remote(&self, gtx: GlobalTxId, topology_id: TopologyId) -> bool {
        let mut created = false;
        self.transactions.entry(gtx).or_insert_with(|| {
            created = true;
            RemoteTransaction {
                gtx,
                topology_id,
                modifications: Vec::new(),
                backup_locks: BTreeSet::new(),
            }
        });
        created
    }

    fn add_backup_locks(&self, gtx: GlobalTxId, keys: &[Bytes]) {
        if let Some(mut tx) = self.transactions.get_mut(&gtx) {
            tx.backup_locks.extend(keys.iter().cloned());
        }
    }

    fn release_backup_locks(&self, gtx: GlobalTxId, keys: &[Bytes]) {
        if let Some(mut tx) = self.transactions.get_mut(&gtx) {
            for key in keys {
                tx.backup_locks.remove(key);
            }
        }
    }

    fn add_modifications(&self, gtx: GlobalTxId, modifications: &[Modification]) {
        if let Some(mut tx) = self.transactions.get_mut(&gtx) {
            tx.modifications.extend(modifications.iter().cloned());
        }
    }

    fn remove(&self, gtx: GlobalTxId) -> Option<RemoteTransaction> {
        self.transactions.remove(&gtx).map(|(_, tx)| tx)
    }

    fn get(&self, gtx: GlobalTxId) -> Option<RemoteTransaction> {
        self.transactions.get(&gtx).map(|tx| tx.clone())
    }

    fn transactions_for_segments(
        &self,
        segments: &BTreeSet<SegmentId>,
        num_segments: u32,
    ) -> Vec<TransactionInfo> {
        self.transactions
            .iter()
            .filter(|tx| tx.touches_segment(segments, num_segments))
            .map(|tx| tx.to_info())
            .collect()
    }

    fn len(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CacheEntry;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let table = InMemoryTransactionTable::new();
        let gtx = GlobalTxId::new();
        assert!(table.get_or_create_remote(gtx, 3));
        assert!(!table.get_or_create_remote(gtx, 4));
        assert_eq!(table.get(gtx).map(|t| t.topology_id), Some(3));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_backup_locks() {
        let table = InMemoryTransactionTable::new();
        let gtx = GlobalTxId::new();
        table.get_or_create_remote(gtx, 1);
        table.add_backup_locks(gtx, &[Bytes::from("a"), Bytes::from("b")]);
        table.release_backup_locks(gtx, &[Bytes::from("a")]);
        let tx = table.get(gtx).unwrap();
        assert_eq!(tx.backup_locks.len(), 1);
        assert!(tx.backup_locks.contains(&Bytes::from("b")));
    }

    #[test]
    fn test_transactions_for_segments() {
        let table = InMemoryTransactionTable::new();
        let t1 = GlobalTxId::new();
        let t2 = GlobalTxId::new();
        table.get_or_create_remote(t1, 1);
        table.get_or_create_remote(t2, 1);
        let seg_alpha = segment_for_key(b"alpha", 1024);
        let beta = (0..)
            .map(|i| Bytes::from(format!("beta-{}", i)))
            .find(|k| segment_for_key(k, 1024) != seg_alpha)
            .unwrap();
        let seg_beta = segment_for_key(&beta, 1024);

        table.add_modifications(t1, &[Modification::Put(CacheEntry::new("alpha", "1"))]);
        table.add_backup_locks(t2, &[beta]);

        let found = table.transactions_for_segments(&[seg_alpha].into_iter().collect(), 1024);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].gtx, t1);

        let both = table
            .transactions_for_segments(&[seg_alpha, seg_beta].into_iter().collect(), 1024);
        assert_eq!(both.len(), 2);

        assert!(table.remove(t1).is_some());
        assert_eq!(table.len(), 1);
    }
}
