//! Serves state requests from consumers on other nodes.

use crate::config::StateTransferConfig;
use crate::error::{Error, Result, TransferError};
use crate::metrics::StateTransferMetrics;
use crate::network::{StateRequestCommand, StateRequestReply, StateRequestType};
use crate::statetransfer::lock::StateTransferLock;
use crate::statetransfer::CacheComponents;
use crate::statetransfer::outbound::{OutboundContext, OutboundTransferTask};
use crate::topology::{segment_for_key, CacheTopology, TopologyHolder};
use crate::tx::{TransactionInfo, TransactionTable};
use crate::types::{CacheEntry, NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Registry {
    transfers: Mutex<HashMap<NodeId, Vec<Arc<OutboundTransferTask>>>>,
    active: watch::Sender<usize>,
}

impl Registry {
    fn add(&self, task: Arc<OutboundTransferTask>) {
        let mut transfers = self.transfers.lock();
        transfers.entry(task.destination()).or_default().push(task);
        let count = transfers.values().map(Vec::len).sum();
        self.active.send_replace(count);
    }

    fn remove(&self, task: &Arc<OutboundTransferTask>) -> bool {
        let mut transfers = self.transfers.lock();
        let mut removed = false;
        if let Some(tasks) = transfers.get_mut(&task.destination()) {
            let before = tasks.len();
            tasks.retain(|t| !Arc::ptr_eq(t, task));
            removed = tasks.len() != before;
            if tasks.is_empty() {
                transfers.remove(&task.destination());
            }
        }
        let count = transfers.values().map(Vec::len).sum();
        self.active.send_replace(count);
        removed
    }

    fn snapshot(&self) -> Vec<Arc<OutboundTransferTask>> {
        self.transfers.lock().values().flatten().cloned().collect()
    }

    fn for_destination(&self, destination: NodeId) -> Vec<Arc<OutboundTransferTask>> {
        self.transfers
            .lock()
            .get(&destination)
            .cloned()
            .unwrap_or_default()
    }
}

/// Outbound half of state transfer for one cache.
pub struct StateProvider {
    local: NodeId,
    config: Arc<StateTransferConfig>,
    topology: Arc<TopologyHolder>,
    lock: Arc<StateTransferLock>,
    tx_table: Arc<dyn TransactionTable>,
    ctx: OutboundContext,
    registry: Arc<Registry>,
    metrics: Arc<StateTransferMetrics>,
}

impl StateProvider {
    /// Create a provider.
    pub fn new(components: &CacheComponents) -> Self {
        let (active, _) = watch::channel(0);
        let config = components.config.clone();
        Self {
            local: components.transport.local_node(),
            ctx: OutboundContext {
                cache_name: config.cache_name.clone(),
                num_segments: config.num_segments,
                chunk_size: config.chunk_size,
                timeout: config.timeout,
                container: components.container.clone(),
                persistence: components.persistence.clone(),
                transport: components.transport.clone(),
                metrics: components.metrics.clone(),
            },
            config,
            topology: components.topology.clone(),
            lock: components.lock.clone(),
            tx_table: components.tx_table.clone(),
            metrics: components.metrics.clone(),
            registry: Arc::new(Registry {
                transfers: Mutex::new(HashMap::new()),
                active,
            }),
        }
    }

    /// Dispatch a state request.
    pub async fn handle_request(&self, request: StateRequestCommand) -> Result<StateRequestReply> {
        match request.kind {
            StateRequestType::GetTransactions => self
                .get_transactions_for_segments(
                    request.origin,
                    request.topology_id,
                    &request.segments,
                )
                .await
                .map(StateRequestReply::Transactions),
            StateRequestType::StartStateTransfer => {
                self.start_outbound_transfer(request.origin, request.topology_id, request.segments)
                    .await?;
                Ok(StateRequestReply::Accepted)
            }
            StateRequestType::CancelStateTransfer => {
                self.cancel_outbound_transfer(request.origin, request.topology_id, &request.segments);
                Ok(StateRequestReply::Accepted)
            }
            StateRequestType::GetSegmentEntries => self
                .get_entries_for_segments(request.origin, request.topology_id, &request.segments)
                .await
                .map(StateRequestReply::Entries),
        }
    }

    /// Cancel transfers to nodes that left the cluster.
    #[tracing::instrument(skip_all, fields(node = self.local, topology_id = topology.topology_id))]
    pub async fn on_topology_update(&self, topology: &CacheTopology, is_rebalance: bool) -> Result<()> {
        for task in self.registry.snapshot() {
            if !topology.is_member(task.destination()) {
                info!(
                    destination = task.destination(),
                    is_rebalance, "destination left, cancelling outbound transfer"
                );
                task.cancel();
                if self.registry.remove(&task) {
                    self.metrics.outbound_tasks_cancelled.inc();
                    self.metrics.outbound_tasks_active.dec();
                }
            }
        }
        Ok(())
    }

    /// Transactions touching `segments`, for a consumer at `topology_id`.
    pub async fn get_transactions_for_segments(
        &self,
        destination: NodeId,
        topology_id: TopologyId,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<Vec<TransactionInfo>> {
        self.await_requester_topology(topology_id).await?;
        self.validate_segments(segments)?;
        let transactions = self
            .tx_table
            .transactions_for_segments(segments, self.config.num_segments);
        debug!(
            destination,
            topology_id,
            count = transactions.len(),
            "serving transactions"
        );
        Ok(transactions)
    }

    /// Live entries of `segments`, for a node reconciling their owners.
    pub async fn get_entries_for_segments(
        &self,
        destination: NodeId,
        topology_id: TopologyId,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<Vec<CacheEntry>> {
        self.await_requester_topology(topology_id).await?;
        self.validate_segments(segments)?;
        let num_segments = self.config.num_segments;
        let entries: Vec<CacheEntry> = self
            .ctx
            .container
            .entries()
            .into_iter()
            .filter(|e| !e.is_expired() && segments.contains(&segment_for_key(&e.key, num_segments)))
            .collect();
        debug!(destination, topology_id, count = entries.len(), "serving entries for reconciliation");
        Ok(entries)
    }

    /// Start streaming `segments` to `destination`.
    pub async fn start_outbound_transfer(
        &self,
        destination: NodeId,
        topology_id: TopologyId,
        segments: BTreeSet<SegmentId>,
    ) -> Result<()> {
        self.await_requester_topology(topology_id).await?;
        self.validate_segments(&segments)?;

        let task = Arc::new(OutboundTransferTask::new(
            &self.ctx,
            destination,
            segments,
            topology_id,
        ));
        self.registry.add(task.clone());
        self.metrics.outbound_tasks_started.inc();
        self.metrics.outbound_tasks_active.inc();

        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match task.execute().await {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    debug!(destination = task.destination(), "outbound transfer cancelled");
                }
                Err(e) => {
                    warn!(destination = task.destination(), error = %e, "outbound transfer failed");
                }
            }
            if registry.remove(&task) {
                metrics.outbound_tasks_active.dec();
            }
        });
        Ok(())
    }

    /// Stop streaming `segments` to `destination`.
    ///
    /// Only tasks started for `topology_id` or earlier are affected, so a
    /// late cancel never hits a transfer the consumer requested afterwards.
    pub fn cancel_outbound_transfer(
        &self,
        destination: NodeId,
        topology_id: TopologyId,
        segments: &BTreeSet<SegmentId>,
    ) {
        debug!(destination, topology_id, ?segments, "cancel requested");
        for task in self.registry.for_destination(destination) {
            if task.topology_id() > topology_id {
                continue;
            }
            if task.cancel_segments(segments) && self.registry.remove(&task) {
                self.metrics.outbound_tasks_cancelled.inc();
                self.metrics.outbound_tasks_active.dec();
            }
        }
    }

    /// Whether any outbound transfer is running.
    pub fn is_state_transfer_in_progress(&self) -> bool {
        *self.registry.active.borrow() > 0
    }

    /// Number of running outbound transfers.
    pub fn active_transfers(&self) -> usize {
        *self.registry.active.borrow()
    }

    /// Wait until no outbound transfer is running.
    pub async fn wait_for_outbound_drain(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.registry.active.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(TransferError::PendingStateTransfer {
                waited_ms: timeout.as_millis() as u64,
            }
            .into()),
        };
        result
    }

    /// Cancel every outbound transfer.
    pub fn shutdown(&self) {
        for task in self.registry.snapshot() {
            task.cancel();
            if self.registry.remove(&task) {
                self.metrics.outbound_tasks_active.dec();
            }
        }
    }

    async fn await_requester_topology(&self, topology_id: TopologyId) -> Result<()> {
        self.lock
            .wait_for_topology(topology_id, self.config.timeout)
            .await
    }

    fn validate_segments(&self, segments: &BTreeSet<SegmentId>) -> Result<()> {
        let topology = self
            .topology
            .get()
            .ok_or(TransferError::NotMember(self.local))?;
        let write_ch = topology.write_ch();
        let foreign: Vec<SegmentId> = segments
            .iter()
            .copied()
            .filter(|s| !write_ch.is_segment_local_to(self.local, *s))
            .collect();
        if foreign.is_empty() {
            Ok(())
        } else {
            warn!(segments = ?foreign, "rejecting request for segments not owned locally");
            Err(TransferError::InvalidSegmentRequest {
                segments: foreign,
                node: self.local,
            }
            .into())
        }
    }
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider")
            .field("local", &self.local)
            .field("active_transfers", &self.active_transfers())
            .finish()
    }
}
