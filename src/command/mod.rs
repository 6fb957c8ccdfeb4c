//! Commands flowing through the interceptor chain.
//!
//! A [`Command`] is a tagged union stamped with the topology id it was
//! issued against. [`Command::affected_keys`] is a pure function of the
//! command, used to route stale transactional commands to new owners.

use crate::tx::GlobalTxId;
use crate::types::{CacheEntry, EntryMetadata, Flag, Flags, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
    /// Write an entry.
    Put(CacheEntry),
    /// Remove a key.
    Remove(Bytes),
}

impl Modification {
    /// Key touched by this modification.
    pub fn key(&self) -> &Bytes {
        match self {
            Modification::Put(entry) => &entry.key,
            Modification::Remove(key) => key,
        }
    }
}

/// The operation a command performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Write a single key.
    Put {
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    },
    /// Remove a single key.
    Remove { key: Bytes },
    /// Write many keys at once.
    PutMap { entries: Vec<CacheEntry> },
    /// Remove every entry.
    Clear,
    /// First phase of a transaction commit.
    Prepare {
        gtx: GlobalTxId,
        modifications: Vec<Modification>,
    },
    /// Second phase of a transaction commit.
    Commit { gtx: GlobalTxId },
    /// Abort a transaction.
    Rollback { gtx: GlobalTxId },
    /// Acquire or release locks on behalf of a transaction.
    LockControl {
        gtx: GlobalTxId,
        keys: Vec<Bytes>,
        unlock: bool,
    },
}

/// A command stamped with its origin topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Topology id the command was issued against.
    pub topology_id: TopologyId,
    /// Behavior flags.
    pub flags: Flags,
    /// The operation.
    pub kind: CommandKind,
}

impl Command {
    /// Create a command with no flags.
    pub fn new(topology_id: TopologyId, kind: CommandKind) -> Self {
        Self {
            topology_id,
            flags: Flags::empty(),
            kind,
        }
    }

    /// Put a single key.
    pub fn put(topology_id: TopologyId, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(
            topology_id,
            CommandKind::Put {
                key: key.into(),
                value: value.into(),
                metadata: EntryMetadata::default(),
            },
        )
    }

    /// Remove a single key.
    pub fn remove(topology_id: TopologyId, key: impl Into<Bytes>) -> Self {
        Self::new(topology_id, CommandKind::Remove { key: key.into() })
    }

    /// Add a flag.
    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags = self.flags.with(flag);
        self
    }

    /// Whether the command belongs to a transaction.
    pub fn is_transactional(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Prepare { .. }
                | CommandKind::Commit { .. }
                | CommandKind::Rollback { .. }
                | CommandKind::LockControl { .. }
        )
    }

    /// Transaction this command belongs to.
    pub fn gtx(&self) -> Option<GlobalTxId> {
        match &self.kind {
            CommandKind::Prepare { gtx, .. }
            | CommandKind::Commit { gtx }
            | CommandKind::Rollback { gtx }
            | CommandKind::LockControl { gtx, .. } => Some(*gtx),
            _ => None,
        }
    }

    /// Keys the command touches. Commit and Rollback carry no keys of
    /// their own; their keys come from the transaction table.
    pub fn affected_keys(&self) -> BTreeSet<Bytes> {
        match &self.kind {
            CommandKind::Put { key, .. } | CommandKind::Remove { key } => {
                [key.clone()].into_iter().collect()
            }
            CommandKind::PutMap { entries } => entries.iter().map(|e| e.key.clone()).collect(),
            CommandKind::Prepare { modifications, .. } => {
                modifications.iter().map(|m| m.key().clone()).collect()
            }
            CommandKind::LockControl { keys, .. } => keys.iter().cloned().collect(),
            CommandKind::Clear | CommandKind::Commit { .. } | CommandKind::Rollback { .. } => {
                BTreeSet::new()
            }
        }
    }

    /// Whether the command bypasses topology checks.
    pub fn bypasses_topology_check(&self) -> bool {
        self.flags.contains(Flag::SkipOwnershipCheck)
            || self.flags.contains(Flag::PutForStateTransfer)
    }
}
