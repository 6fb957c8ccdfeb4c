//! Inbound half of state transfer for one cache.
//!
//! ```text
//!  topology update ──► cancel segments no longer owned
//!                  ├─► restart transfers whose source left
//!                  ├─► fetch transactions (transactional caches)
//!                  ├─► add transfers, one task per source
//!                  └─► purge segments no longer owned
//!
//!  StateResponse ──► filter ──► apply chunks on the worker pool ──► complete segments
//! ```
//!
//! Two indices over the same tasks are kept under one lock: by source, to
//! restart everything pulled from a node that left, and by segment, to
//! route chunks and cancellations.

use crate::command::{Command, CommandKind};
use crate::config::StateTransferConfig;
use crate::container::{DataContainer, PersistenceManager};
use crate::error::{Error, Result};
use crate::metrics::StateTransferMetrics;
use crate::network::{StateChunk, StateRequestCommand, StateRequestReply, StateRequestType, Transport};
use crate::statetransfer::commit::{CommitManager, TrackMode};
use crate::statetransfer::inbound::{InboundTransferTask, TaskOutcome};
use crate::statetransfer::interceptor::LocalCommandHandler;
use crate::statetransfer::lock::StateTransferLock;
use crate::statetransfer::CacheComponents;
use crate::topology::{segment_for_key, CacheTopology, Phase};
use crate::tx::{TransactionInfo, TransactionTable};
use crate::types::{CacheEntry, Flag, Flags, NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Default)]
struct TransferIndex {
    by_source: HashMap<NodeId, Vec<Arc<InboundTransferTask>>>,
    by_segment: HashMap<SegmentId, Arc<InboundTransferTask>>,
}

impl TransferIndex {
    fn insert(&mut self, task: &Arc<InboundTransferTask>) {
        for segment in task.segments() {
            self.by_segment.insert(segment, task.clone());
        }
        self.by_source
            .entry(task.source())
            .or_default()
            .push(task.clone());
    }

    fn remove_task(&mut self, task: &Arc<InboundTransferTask>) {
        if let Some(tasks) = self.by_source.get_mut(&task.source()) {
            tasks.retain(|t| !Arc::ptr_eq(t, task));
            if tasks.is_empty() {
                self.by_source.remove(&task.source());
            }
        }
        self.by_segment.retain(|_, t| !Arc::ptr_eq(t, task));
    }

    fn contains(&self, task: &Arc<InboundTransferTask>) -> bool {
        self.by_source
            .get(&task.source())
            .map_or(false, |tasks| tasks.iter().any(|t| Arc::ptr_eq(t, task)))
    }

    fn owns(&self, segment: SegmentId, task: &Arc<InboundTransferTask>) -> bool {
        self.by_segment
            .get(&segment)
            .map_or(false, |t| Arc::ptr_eq(t, task))
    }

    fn task_count(&self) -> usize {
        self.by_source.values().map(Vec::len).sum()
    }

    fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    fn drain(&mut self) -> Vec<Arc<InboundTransferTask>> {
        self.by_segment.clear();
        self.by_source.drain().flat_map(|(_, tasks)| tasks).collect()
    }
}

#[derive(Debug, Default)]
struct RebalanceState {
    topology: Option<Arc<CacheTopology>>,
    /// Topology at which the current rebalance started.
    state_topology_id: Option<TopologyId>,
    /// Segments completed or given up on in the current rebalance.
    settled: BTreeSet<SegmentId>,
}

/// Receives state for segments this node is becoming an owner of.
pub struct StateConsumer {
    local: NodeId,
    cache_name: SmolStr,
    config: Arc<StateTransferConfig>,
    lock: Arc<StateTransferLock>,
    commit: Arc<CommitManager>,
    writer: Arc<LocalCommandHandler>,
    container: Arc<dyn DataContainer>,
    persistence: Option<Arc<dyn PersistenceManager>>,
    tx_table: Arc<dyn TransactionTable>,
    transport: Arc<dyn Transport>,
    metrics: Arc<StateTransferMetrics>,
    index: Mutex<TransferIndex>,
    rebalance: Mutex<RebalanceState>,
    in_progress: watch::Sender<bool>,
    apply_permits: Arc<Semaphore>,
    request_permits: Semaphore,
}

impl StateConsumer {
    /// Create a consumer.
    pub fn new(components: &CacheComponents) -> Self {
        let (in_progress, _) = watch::channel(false);
        let config = components.config.clone();
        Self {
            local: components.transport.local_node(),
            cache_name: config.cache_name.clone(),
            apply_permits: Arc::new(Semaphore::new(config.apply_concurrency.max(1))),
            request_permits: Semaphore::new(1),
            config,
            lock: components.lock.clone(),
            commit: components.commit.clone(),
            writer: Arc::new(LocalCommandHandler::new(components)),
            container: components.container.clone(),
            persistence: components.persistence.clone(),
            tx_table: components.tx_table.clone(),
            transport: components.transport.clone(),
            metrics: components.metrics.clone(),
            index: Mutex::new(TransferIndex::default()),
            rebalance: Mutex::new(RebalanceState::default()),
            in_progress,
        }
    }

    /// React to a newly installed topology.
    ///
    /// `is_rebalance` is set for the first topology of a new rebalance.
    #[tracing::instrument(skip_all, fields(node = self.local, cache = %self.cache_name, topology_id = topology.topology_id))]
    pub async fn on_topology_update(
        self: &Arc<Self>,
        topology: Arc<CacheTopology>,
        is_rebalance: bool,
    ) -> Result<()> {
        let fetch = self.config.fetch_in_memory_state;
        let previous = {
            let mut state = self.rebalance.lock();
            if is_rebalance && fetch {
                state.state_topology_id = Some(topology.topology_id);
                state.settled.clear();
            }
            state.topology.replace(topology.clone())
        };
        if !self.config.cache_mode.is_clustered_with_state() {
            self.lock
                .notify_transaction_data_received(topology.topology_id);
            return Ok(());
        }

        if is_rebalance && fetch {
            // Chunks of an older rebalance are discarded by topology id.
            let stale = self.index.lock().drain();
            if !stale.is_empty() {
                debug!(tasks = stale.len(), "restarting transfers for new rebalance");
            }
            for task in stale {
                task.cancel_segments(&task.segments());
            }
            info!(
                rebalance_id = topology.rebalance_id,
                phase = %topology.phase,
                "rebalance started"
            );
            self.in_progress.send_replace(true);
        }

        let owned = topology.write_ch().segments_for_owner(self.local);
        let previously_owned = previous
            .as_ref()
            .map(|t| t.write_ch().segments_for_owner(self.local))
            .unwrap_or_default();
        let removed: BTreeSet<SegmentId> =
            previously_owned.difference(&owned).copied().collect();

        self.cancel_transfers(&removed);
        self.drop_transfers_from_leavers(&topology);

        let wanted = if topology.phase.is_rebalance() && self.is_state_transfer_in_progress() {
            self.segments_to_fetch(&topology)
        } else {
            BTreeSet::new()
        };

        if self.config.transactional {
            if !wanted.is_empty() {
                self.request_transactions(&topology, &wanted).await;
            }
            self.lock
                .notify_transaction_data_received(topology.topology_id);
        }

        if !wanted.is_empty() {
            self.add_transfers(&topology, wanted, HashSet::new(), None, None);
        }

        let mut purge = removed;
        let rebalance_ended = topology.phase == Phase::NoRebalance
            && previous.as_ref().map_or(false, |p| p.phase != Phase::NoRebalance);
        if rebalance_ended {
            purge.extend((0..topology.write_ch().num_segments()).filter(|s| !owned.contains(s)));
        }
        let keep_for_merge =
            topology.phase == Phase::ConflictResolution && self.config.merge_policy.is_some();
        if !purge.is_empty() && !keep_for_merge {
            self.discard_segments(&purge).await;
        }

        if topology.phase == Phase::NoRebalance {
            let leftover = self.index.lock().drain();
            for task in leftover {
                task.cancel();
            }
            if self.commit.is_tracking(TrackMode::StateTransfer) {
                self.commit.stop_track(TrackMode::StateTransfer);
            }
        }

        self.finish_if_drained();
        Ok(())
    }

    /// Apply received chunks.
    ///
    /// Chunks from an older rebalance, for segments not owned, or (unless
    /// `push`) from a sender without a matching task are dropped.
    #[tracing::instrument(skip_all, fields(node = self.local, sender, topology_id, chunks = chunks.len()))]
    pub async fn apply_state(
        &self,
        sender: NodeId,
        topology_id: TopologyId,
        chunks: Vec<StateChunk>,
        push: bool,
    ) -> Result<()> {
        let (topology, state_topology_id) = {
            let state = self.rebalance.lock();
            (state.topology.clone(), state.state_topology_id)
        };
        let Some(topology) = topology else {
            self.metrics.chunks_discarded.inc_by(chunks.len() as u64);
            return Ok(());
        };
        if !push {
            let outdated = state_topology_id.map_or(true, |id| topology_id < id);
            if outdated || !self.is_state_transfer_in_progress() {
                debug!(?state_topology_id, "discarding state from a finished or older rebalance");
                self.metrics.chunks_discarded.inc_by(chunks.len() as u64);
                return Ok(());
            }
        }

        let flags = if push && !self.commit.is_tracking(TrackMode::StateTransfer) {
            // Resolved values pushed outside a rebalance are ordinary writes.
            Flags::empty()
                .with(Flag::SkipOwnershipCheck)
                .with(Flag::SkipLocking)
        } else {
            Flags::state_transfer()
        };
        let write_ch = topology.write_ch().clone();

        let mut accepted = Vec::with_capacity(chunks.len());
        {
            let index = self.index.lock();
            for chunk in chunks {
                if !write_ch.is_segment_local_to(self.local, chunk.segment_id) {
                    trace!(segment = chunk.segment_id, "discarding chunk for segment not owned");
                    self.metrics.chunks_discarded.inc();
                    continue;
                }
                let task = if push {
                    None
                } else {
                    match index.by_segment.get(&chunk.segment_id) {
                        Some(task) if task.source() == sender => {
                            task.record_chunk();
                            Some(task.clone())
                        }
                        _ => {
                            trace!(segment = chunk.segment_id, "discarding chunk without a matching transfer");
                            self.metrics.chunks_discarded.inc();
                            continue;
                        }
                    }
                };
                accepted.push((chunk, task));
            }
        }

        let mut workers = JoinSet::new();
        let mut completions = Vec::new();
        for (chunk, task) in accepted {
            let StateChunk {
                segment_id,
                entries,
                is_last_chunk,
            } = chunk;
            if is_last_chunk {
                if let Some(task) = task {
                    completions.push((segment_id, task));
                }
            }
            if entries.is_empty() {
                self.metrics.chunks_received.inc();
                continue;
            }
            let command = Command {
                topology_id,
                flags,
                kind: CommandKind::PutMap {
                    entries: entries.into_iter().filter(|e| !e.is_expired()).collect(),
                },
            };
            workers.spawn(apply_chunk(
                self.writer.clone(),
                self.apply_permits.clone(),
                self.metrics.clone(),
                segment_id,
                command,
            ));
        }

        let joined = tokio::time::timeout(self.config.timeout, async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "chunk worker failed");
                }
            }
        })
        .await;
        if joined.is_err() {
            workers.abort_all();
            warn!(timeout_ms = self.config.timeout.as_millis() as u64, "timed out applying state");
            return Err(Error::Timeout);
        }

        for (segment, task) in completions {
            self.complete_segment(segment, &task);
        }
        self.finish_if_drained();
        Ok(())
    }

    /// Whether an inbound rebalance transfer is running.
    pub fn is_state_transfer_in_progress(&self) -> bool {
        *self.in_progress.borrow()
    }

    /// Whether the segment of `key` is still being received.
    pub fn is_state_transfer_in_progress_for_key(&self, key: &[u8]) -> bool {
        let num_segments = self.config.num_segments;
        self.index
            .lock()
            .by_segment
            .contains_key(&segment_for_key(key, num_segments))
    }

    /// Segments with an inbound task.
    pub fn inbound_segments(&self) -> BTreeSet<SegmentId> {
        self.index.lock().by_segment.keys().copied().collect()
    }

    /// Wait until the current rebalance received all of its state.
    pub async fn wait_for_inbound_drain(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.in_progress.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|running| !*running)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => Err(Error::Timeout),
        };
        result
    }

    /// Cancel every inbound task and forget all state.
    pub fn shutdown(&self) {
        let tasks = self.index.lock().drain();
        for task in tasks {
            task.cancel();
        }
        self.request_permits.close();
        self.metrics.inbound_tasks_active.set(0);
        self.in_progress.send_replace(false);
    }

    fn segments_to_fetch(&self, topology: &CacheTopology) -> BTreeSet<SegmentId> {
        let settled = self.rebalance.lock().settled.clone();
        let held = topology.current_ch.segments_for_owner(self.local);
        let index = self.index.lock();
        topology
            .write_ch()
            .segments_for_owner(self.local)
            .into_iter()
            .filter(|s| !held.contains(s) && !settled.contains(s))
            .filter(|s| !index.by_segment.contains_key(s))
            .collect()
    }

    fn pick_source(
        &self,
        topology: &CacheTopology,
        segment: SegmentId,
        excluded: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        topology
            .current_ch
            .locate_owners(segment)
            .iter()
            .copied()
            .find(|o| *o != self.local && !excluded.contains(o) && topology.is_member(*o))
    }

    fn group_by_source(
        &self,
        topology: &CacheTopology,
        segments: &BTreeSet<SegmentId>,
        excluded: &HashSet<NodeId>,
    ) -> (BTreeMap<NodeId, BTreeSet<SegmentId>>, BTreeSet<SegmentId>) {
        let mut by_source: BTreeMap<NodeId, BTreeSet<SegmentId>> = BTreeMap::new();
        let mut lost = BTreeSet::new();
        for &segment in segments {
            match self.pick_source(topology, segment, excluded) {
                Some(source) => {
                    by_source.entry(source).or_default().insert(segment);
                }
                None => {
                    lost.insert(segment);
                }
            }
        }
        (by_source, lost)
    }

    fn record_lost(&self, lost: BTreeSet<SegmentId>) {
        if lost.is_empty() {
            return;
        }
        error!(segments = ?lost, "no live owner to fetch segments from, data may be lost");
        self.metrics.segments_lost.inc_by(lost.len() as u64);
        self.rebalance.lock().settled.extend(lost);
    }

    /// Create one task per source for `segments` and start requesting.
    ///
    /// Segments another task already covers are skipped. `replacing` is
    /// swapped out in the same step, and nothing is added if it left the
    /// index meanwhile. `fallback` serves segments no other owner can.
    fn add_transfers(
        self: &Arc<Self>,
        topology: &CacheTopology,
        segments: BTreeSet<SegmentId>,
        excluded: HashSet<NodeId>,
        replacing: Option<&Arc<InboundTransferTask>>,
        fallback: Option<NodeId>,
    ) {
        let (tasks, lost) = {
            let mut index = self.index.lock();
            if let Some(old) = replacing {
                if !index.contains(old) {
                    trace!(source = old.source(), "transfer already replaced");
                    return;
                }
                index.remove_task(old);
            }
            let uncovered: BTreeSet<SegmentId> = segments
                .into_iter()
                .filter(|s| !index.by_segment.contains_key(s))
                .collect();
            let (mut by_source, mut lost) = self.group_by_source(topology, &uncovered, &excluded);
            if let Some(source) = fallback.filter(|n| topology.is_member(*n)) {
                let (served, rest): (BTreeSet<SegmentId>, BTreeSet<SegmentId>) = lost
                    .into_iter()
                    .partition(|s| topology.current_ch.locate_owners(*s).contains(&source));
                if !served.is_empty() {
                    by_source.entry(source).or_default().extend(served);
                }
                lost = rest;
            }

            let tasks: Vec<Arc<InboundTransferTask>> = by_source
                .into_iter()
                .map(|(source, segments)| {
                    Arc::new(InboundTransferTask::new(
                        self.cache_name.clone(),
                        source,
                        segments,
                        topology.topology_id,
                        self.config.timeout,
                        self.transport.clone(),
                    ))
                })
                .collect();
            for task in &tasks {
                index.insert(task);
            }
            self.metrics
                .inbound_tasks_active
                .set(index.task_count() as i64);
            (tasks, lost)
        };
        self.record_lost(lost);

        for task in tasks {
            debug!(source = task.source(), segments = ?task.segments(), "adding inbound transfer");
            self.metrics
                .segments_requested
                .inc_by(task.segments().len() as u64);
            self.spawn_request(task, excluded.clone());
        }
    }

    fn spawn_request(self: &Arc<Self>, task: Arc<InboundTransferTask>, excluded: HashSet<NodeId>) {
        let consumer = self.clone();
        tokio::spawn(async move {
            // Submissions go out one at a time; replies are awaited concurrently.
            let request = {
                let Ok(_permit) = consumer.request_permits.acquire().await else {
                    return;
                };
                let task = task.clone();
                tokio::spawn(async move { task.request_segments().await })
            };
            let result = match request.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("state request task failed: {e}"))),
            };
            match result {
                Ok(()) => {
                    if consumer.is_stalled(&task).await {
                        warn!(
                            source = task.source(),
                            segments = ?task.unfinished_segments(),
                            "no state received within the timeout, requesting again"
                        );
                        let mut excluded = excluded;
                        excluded.insert(task.source());
                        consumer.retry_transfer(&task, excluded, Some(task.source()));
                    }
                }
                Err(Error::Cancelled) => {
                    trace!(source = task.source(), "request cancelled");
                }
                Err(e) if e.is_retryable() => {
                    warn!(source = task.source(), error = %e, "state request failed, trying another owner");
                    let mut excluded = excluded;
                    excluded.insert(task.source());
                    consumer.retry_transfer(&task, excluded, None);
                }
                Err(e) => {
                    error!(source = task.source(), error = %e, "state request rejected");
                    consumer.abandon_transfer(&task);
                }
            }
        });
    }

    /// Wait for an accepted task to finish. True when it is still indexed
    /// but received no chunk for a whole timeout.
    async fn is_stalled(&self, task: &Arc<InboundTransferTask>) -> bool {
        let mut seen = task.chunks_received();
        loop {
            if tokio::time::timeout(self.config.timeout, task.await_outcome())
                .await
                .is_ok()
            {
                return false;
            }
            let now = task.chunks_received();
            if now == seen {
                return self.index.lock().contains(task);
            }
            seen = now;
        }
    }

    fn retry_transfer(
        self: &Arc<Self>,
        task: &Arc<InboundTransferTask>,
        excluded: HashSet<NodeId>,
        fallback: Option<NodeId>,
    ) {
        let Some(topology) = self.rebalance.lock().topology.clone() else {
            return;
        };
        let write_ch = topology.write_ch().clone();
        let segments: BTreeSet<SegmentId> = {
            let index = self.index.lock();
            task.unfinished_segments()
                .into_iter()
                .filter(|s| index.owns(*s, task) && write_ch.is_segment_local_to(self.local, *s))
                .collect()
        };
        task.cancel();

        if segments.is_empty() || !self.is_state_transfer_in_progress() {
            let mut index = self.index.lock();
            index.remove_task(task);
            self.metrics
                .inbound_tasks_active
                .set(index.task_count() as i64);
        } else {
            self.add_transfers(&topology, segments, excluded, Some(task), fallback);
        }
        self.finish_if_drained();
    }

    fn abandon_transfer(&self, task: &Arc<InboundTransferTask>) {
        let segments = task.unfinished_segments();
        task.cancel();
        {
            let mut index = self.index.lock();
            index.remove_task(task);
            self.metrics
                .inbound_tasks_active
                .set(index.task_count() as i64);
        }
        self.record_lost(segments);
        self.finish_if_drained();
    }

    fn cancel_transfers(&self, removed: &BTreeSet<SegmentId>) {
        if removed.is_empty() {
            return;
        }
        let mut index = self.index.lock();
        let mut affected: Vec<(Arc<InboundTransferTask>, BTreeSet<SegmentId>)> = Vec::new();
        for segment in removed {
            if let Some(task) = index.by_segment.remove(segment) {
                match affected.iter_mut().find(|(t, _)| Arc::ptr_eq(t, &task)) {
                    Some((_, segments)) => {
                        segments.insert(*segment);
                    }
                    None => affected.push((task, BTreeSet::from([*segment]))),
                }
            }
        }
        for (task, segments) in &affected {
            debug!(source = task.source(), ?segments, "segments no longer owned, cancelling");
            task.cancel_segments(segments);
            if task.outcome() != TaskOutcome::Pending {
                index.remove_task(task);
            }
        }
        self.metrics
            .inbound_tasks_active
            .set(index.task_count() as i64);
    }

    /// Drop tasks pulling from nodes that left. Their segments are picked
    /// up again by the next fetch.
    fn drop_transfers_from_leavers(&self, topology: &CacheTopology) {
        let mut index = self.index.lock();
        let leavers: Vec<NodeId> = index
            .by_source
            .keys()
            .copied()
            .filter(|source| !topology.is_member(*source))
            .collect();
        for source in leavers {
            for task in index.by_source.remove(&source).unwrap_or_default() {
                info!(source, segments = ?task.unfinished_segments(), "source left, restarting transfer");
                index.by_segment.retain(|_, t| !Arc::ptr_eq(t, &task));
                task.cancel();
            }
        }
        self.metrics
            .inbound_tasks_active
            .set(index.task_count() as i64);
    }

    fn complete_segment(&self, segment: SegmentId, task: &Arc<InboundTransferTask>) {
        let task_done = task.on_state_received(segment, true);
        let completed = {
            let mut index = self.index.lock();
            let completed = index.owns(segment, task);
            if completed {
                index.by_segment.remove(&segment);
            }
            if task_done {
                index.remove_task(task);
            }
            self.metrics
                .inbound_tasks_active
                .set(index.task_count() as i64);
            completed
        };
        if completed {
            trace!(segment, source = task.source(), "segment received");
            self.commit.stop_track_for(TrackMode::StateTransfer, segment);
            self.rebalance.lock().settled.insert(segment);
            self.metrics.segments_completed.inc();
        }
    }

    fn finish_if_drained(&self) {
        if !self.is_state_transfer_in_progress() || !self.index.lock().is_empty() {
            return;
        }
        let finished = self.in_progress.send_if_modified(|running| {
            let was_running = *running;
            *running = false;
            was_running
        });
        if finished {
            info!("inbound state transfer finished");
            self.commit.stop_track(TrackMode::StateTransfer);
        }
    }

    async fn request_transactions(&self, topology: &CacheTopology, segments: &BTreeSet<SegmentId>) {
        let mut pending = segments.clone();
        let mut excluded = HashSet::new();
        while !pending.is_empty() {
            let (by_source, lost) = self.group_by_source(topology, &pending, &excluded);
            if !lost.is_empty() {
                warn!(segments = ?lost, "no owner left to fetch transactions from");
                pending.retain(|s| !lost.contains(s));
            }
            for (source, segments) in by_source {
                let request = StateRequestCommand::new(
                    self.cache_name.clone(),
                    StateRequestType::GetTransactions,
                    self.local,
                    topology.topology_id,
                    segments.clone(),
                );
                match self
                    .transport
                    .send_state_request(source, request, self.config.timeout)
                    .await
                {
                    Ok(StateRequestReply::Transactions(transactions)) => {
                        self.apply_transactions(transactions);
                        pending.retain(|s| !segments.contains(s));
                    }
                    Ok(other) => {
                        warn!(source, reply = ?other, "unexpected reply to transaction request");
                        excluded.insert(source);
                    }
                    Err(e) => {
                        warn!(source, error = %e, "failed to fetch transactions, trying another owner");
                        excluded.insert(source);
                    }
                }
            }
        }
    }

    fn apply_transactions(&self, transactions: Vec<TransactionInfo>) {
        debug!(count = transactions.len(), "applying transactions");
        for tx in transactions {
            if self.tx_table.get_or_create_remote(tx.gtx, tx.topology_id) {
                self.tx_table.add_modifications(tx.gtx, &tx.modifications);
            }
            self.tx_table.add_backup_locks(tx.gtx, &tx.locked_keys);
        }
    }

    async fn discard_segments(&self, segments: &BTreeSet<SegmentId>) {
        let num_segments = self.config.num_segments;
        let removed = self.container.remove_segments(segments, num_segments);
        debug!(?segments, entries = removed.len(), "purged segments no longer owned");

        let Some(persistence) = &self.persistence else {
            return;
        };
        let keys = match persistence
            .load_all_keys(&|key: &[u8]| segments.contains(&segment_for_key(key, num_segments)))
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to list stored keys for purge");
                return;
            }
        };
        for key in keys {
            if let Err(e) = persistence.delete(&key).await {
                warn!(error = %e, "failed to purge stored entry");
            }
        }
    }
}

async fn apply_chunk(
    writer: Arc<LocalCommandHandler>,
    permits: Arc<Semaphore>,
    metrics: Arc<StateTransferMetrics>,
    segment: SegmentId,
    command: Command,
) {
    let Ok(_permit) = permits.acquire().await else {
        return;
    };
    let started = Instant::now();
    let total = match &command.kind {
        CommandKind::PutMap { entries } => entries.len() as u64,
        _ => 0,
    };
    let applied = match writer.execute(&command).await {
        Ok(applied) => applied as u64,
        Err(e) => {
            warn!(segment, error = %e, "failed to apply chunk");
            0
        }
    };
    let discarded = total.saturating_sub(applied);
    trace!(segment, applied, discarded, "chunk applied");
    metrics.record_chunk_applied(applied, discarded, started.elapsed());
}

impl std::fmt::Debug for StateConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock();
        f.debug_struct("StateConsumer")
            .field("local", &self.local)
            .field("cache", &self.cache_name)
            .field("in_progress", &self.is_state_transfer_in_progress())
            .field("tasks", &index.task_count())
            .field("segments", &index.by_segment.len())
            .finish()
    }
}
