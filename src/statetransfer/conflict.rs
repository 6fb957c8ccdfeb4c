//! Reconciles divergent copies of a segment across its owners.
//!
//! ```text
//!   CONFLICT_RESOLUTION topology
//!        │  segments whose primary owner is this node
//!        ▼
//!   fetch live entries from every owner ──► keys that differ or are missing
//!        │
//!        ▼
//!   merge policy ──► push winners to owners without them
//!                └─► remove the key where the policy drops it
//! ```
//!
//! The primary owner's copy is the preferred one. Owners that cannot be
//! reached leave their segments untouched until the next resolution.

use crate::command::Command;
use crate::config::{MergePolicy, StateTransferConfig};
use crate::container::DataContainer;
use crate::error::Result;
use crate::metrics::StateTransferMetrics;
use crate::network::{
    ForwardedCommand, StateChunk, StateRequestCommand, StateRequestReply, StateRequestType,
    StateResponseCommand, Transport,
};
use crate::statetransfer::consumer::StateConsumer;
use crate::statetransfer::interceptor::LocalCommandHandler;
use crate::statetransfer::CacheComponents;
use crate::topology::{segment_for_key, CacheTopology};
use crate::types::{CacheEntry, Flag, NodeId, SegmentId};
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Copies of one key, by owner.
type Versions = BTreeMap<NodeId, CacheEntry>;

/// What reconciliation does on each owner.
#[derive(Debug, Default)]
struct Resolution {
    puts: BTreeMap<NodeId, BTreeMap<SegmentId, Vec<CacheEntry>>>,
    removes: BTreeMap<NodeId, Vec<Bytes>>,
    conflicts: usize,
}

impl Resolution {
    fn add(
        &mut self,
        segment: SegmentId,
        key: Bytes,
        versions: &Versions,
        owners: &[NodeId],
        merged: Option<CacheEntry>,
    ) {
        self.conflicts += 1;
        match merged {
            Some(winner) => {
                for owner in owners {
                    let stale = versions
                        .get(owner)
                        .map_or(true, |e| e.value != winner.value);
                    if stale {
                        self.puts
                            .entry(*owner)
                            .or_default()
                            .entry(segment)
                            .or_default()
                            .push(winner.clone());
                    }
                }
            }
            None => {
                for owner in owners.iter().filter(|o| versions.contains_key(o)) {
                    self.removes.entry(*owner).or_default().push(key.clone());
                }
            }
        }
    }
}

/// Resolves conflicts for the segments this node is primary owner of.
pub struct ConflictManager {
    local: NodeId,
    cache_name: SmolStr,
    config: Arc<StateTransferConfig>,
    container: Arc<dyn DataContainer>,
    transport: Arc<dyn Transport>,
    consumer: Arc<StateConsumer>,
    writer: LocalCommandHandler,
    metrics: Arc<StateTransferMetrics>,
}

impl ConflictManager {
    /// Create a conflict manager applying local winners through `consumer`.
    pub fn new(components: &CacheComponents, consumer: Arc<StateConsumer>) -> Self {
        Self {
            local: components.transport.local_node(),
            cache_name: components.config.cache_name.clone(),
            config: components.config.clone(),
            container: components.container.clone(),
            transport: components.transport.clone(),
            consumer,
            writer: LocalCommandHandler::new(components),
            metrics: components.metrics.clone(),
        }
    }

    /// Reconcile every segment this node is primary owner of in the
    /// current hash of `topology`. Returns the number of conflicting keys.
    #[tracing::instrument(skip_all, fields(node = self.local, topology_id = topology.topology_id, policy = ?policy))]
    pub async fn resolve_conflicts(&self, topology: &CacheTopology, policy: MergePolicy) -> Result<usize> {
        let ch = &topology.current_ch;
        let owners: BTreeMap<SegmentId, Vec<NodeId>> = (0..ch.num_segments())
            .filter(|s| ch.locate_owners(*s).first() == Some(&self.local))
            .map(|s| {
                let live = ch
                    .locate_owners(s)
                    .iter()
                    .copied()
                    .filter(|o| *o == self.local || topology.is_member(*o))
                    .collect();
                (s, live)
            })
            .collect();
        if owners.is_empty() {
            return Ok(0);
        }

        let (mut versions, unreachable) = self.fetch_versions(topology, &owners).await;
        let mut resolution = Resolution::default();
        for (segment, segment_owners) in &owners {
            if unreachable.contains(segment) {
                continue;
            }
            let Some(keys) = versions.remove(segment) else {
                continue;
            };
            for (key, copies) in keys {
                let mut values = copies.values().map(|e| &e.value);
                let first = values.next();
                let diverged =
                    copies.len() < segment_owners.len() || values.any(|v| Some(v) != first);
                if !diverged {
                    continue;
                }
                let others: Vec<&CacheEntry> = segment_owners
                    .iter()
                    .filter(|o| **o != self.local)
                    .filter_map(|o| copies.get(o))
                    .collect();
                let merged = policy.merge(copies.get(&self.local), &others);
                resolution.add(*segment, key, &copies, segment_owners, merged);
            }
        }

        let conflicts = resolution.conflicts;
        self.apply(topology, resolution).await?;
        self.metrics.conflicts_resolved.inc_by(conflicts as u64);
        info!(
            segments = owners.len() - unreachable.len(),
            skipped = unreachable.len(),
            conflicts,
            "conflicts resolved"
        );
        Ok(conflicts)
    }

    /// Copies of every key in `owners`' segments, by segment and key.
    /// Also returns the segments with an owner that did not answer.
    async fn fetch_versions(
        &self,
        topology: &CacheTopology,
        owners: &BTreeMap<SegmentId, Vec<NodeId>>,
    ) -> (BTreeMap<SegmentId, BTreeMap<Bytes, Versions>>, BTreeSet<SegmentId>) {
        let num_segments = self.config.num_segments;
        let mut versions: BTreeMap<SegmentId, BTreeMap<Bytes, Versions>> = BTreeMap::new();
        let mut record = |owner: NodeId, entry: CacheEntry| {
            let segment = segment_for_key(&entry.key, num_segments);
            if owners.contains_key(&segment) {
                versions
                    .entry(segment)
                    .or_default()
                    .entry(entry.key.clone())
                    .or_default()
                    .insert(owner, entry);
            }
        };

        for entry in self.container.entries() {
            if !entry.is_expired() {
                record(self.local, entry);
            }
        }

        let mut by_owner: BTreeMap<NodeId, BTreeSet<SegmentId>> = BTreeMap::new();
        for (segment, segment_owners) in owners {
            for owner in segment_owners.iter().filter(|o| **o != self.local) {
                by_owner.entry(*owner).or_default().insert(*segment);
            }
        }

        let mut requests = JoinSet::new();
        for (owner, segments) in by_owner {
            let transport = self.transport.clone();
            let request = StateRequestCommand::new(
                self.cache_name.clone(),
                StateRequestType::GetSegmentEntries,
                self.local,
                topology.topology_id,
                segments.clone(),
            );
            let timeout = self.config.timeout;
            requests.spawn(async move {
                let reply = transport.send_state_request(owner, request, timeout).await;
                (owner, segments, reply)
            });
        }

        let mut unreachable = BTreeSet::new();
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((owner, _, Ok(StateRequestReply::Entries(entries)))) => {
                    debug!(owner, count = entries.len(), "received entries for reconciliation");
                    for entry in entries {
                        record(owner, entry);
                    }
                }
                Ok((owner, segments, Ok(other))) => {
                    warn!(owner, reply = ?other, "unexpected reply to entries request");
                    unreachable.extend(segments);
                }
                Ok((owner, segments, Err(e))) => {
                    warn!(owner, ?segments, error = %e, "failed to fetch entries, skipping segments");
                    unreachable.extend(segments);
                }
                Err(e) => {
                    warn!(error = %e, "entries request task failed");
                    unreachable.extend(owners.keys().copied());
                }
            }
        }
        (versions, unreachable)
    }

    async fn apply(&self, topology: &CacheTopology, resolution: Resolution) -> Result<()> {
        let topology_id = topology.topology_id;
        for (owner, by_segment) in resolution.puts {
            let chunks: Vec<StateChunk> = by_segment
                .into_iter()
                .map(|(segment, entries)| StateChunk::new(segment, entries, true))
                .collect();
            if owner == self.local {
                self.consumer
                    .apply_state(self.local, topology_id, chunks, true)
                    .await?;
                continue;
            }
            let response = StateResponseCommand {
                cache_name: self.cache_name.clone(),
                origin: self.local,
                topology_id,
                chunks,
                push: true,
            };
            if let Err(e) = self
                .transport
                .send_state_response(owner, response, self.config.timeout)
                .await
            {
                warn!(owner, error = %e, "failed to push resolved entries");
            }
        }

        for (owner, keys) in resolution.removes {
            for key in keys {
                let command = Command::remove(topology_id, key).with_flag(Flag::SkipOwnershipCheck);
                if owner == self.local {
                    self.writer.execute(&command).await?;
                    continue;
                }
                let forwarded = ForwardedCommand {
                    cache_name: self.cache_name.clone(),
                    origin: self.local,
                    command,
                };
                if let Err(e) = self
                    .transport
                    .forward_command(owner, forwarded, self.config.timeout)
                    .await
                {
                    warn!(owner, error = %e, "failed to remove conflicting entry");
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConflictManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictManager")
            .field("local", &self.local)
            .field("cache", &self.cache_name)
            .finish()
    }
}
