//! Per-cache coordinator of state transfer on one node.
//!
//! ```text
//!   TopologyService ──join/leave/confirm──► coordinator
//!          ▲                                    │
//!          │                        handle_topology_update
//!          │                                    ▼
//!   ┌──────┴──────────────────────────────────────────────┐
//!   │ StateTransferManager                                │
//!   │   1. reject regressions, ignore duplicates          │
//!   │   2. swap topology under the exclusive lock         │
//!   │   3. advance barriers                               │
//!   │   4. consumer + provider react concurrently         │
//!   │   5. reconcile owners in CONFLICT_RESOLUTION        │
//!   │   6. confirm the phase once local work is drained   │
//!   └─────────────────────────────────────────────────────┘
//! ```
//!
//! Topology updates are serialized; message handling is not.

use crate::command::Command;
use crate::error::{Error, NetworkError, Result, TransferError};
use crate::metrics::StateTransferMetrics;
use crate::network::{Message, MessageHandler, TopologyListener, TopologyService};
use crate::statetransfer::commit::TrackMode;
use crate::statetransfer::conflict::ConflictManager;
use crate::statetransfer::consumer::StateConsumer;
use crate::statetransfer::interceptor::{CommandHandler, LocalCommandHandler, StateTransferInterceptor};
use crate::statetransfer::provider::StateProvider;
use crate::statetransfer::rebalance::RebalanceType;
use crate::statetransfer::CacheComponents;
use crate::topology::{CacheJoinInfo, CacheTopology, Phase};
use crate::types::{NodeId, TopologyId};
use async_trait::async_trait;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Pause between join attempts while the coordinator is not ready.
const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Drives state transfer for one cache on one node.
pub struct StateTransferManager {
    me: Weak<StateTransferManager>,
    local: NodeId,
    cache_name: SmolStr,
    components: CacheComponents,
    consumer: Arc<StateConsumer>,
    provider: Arc<StateProvider>,
    conflicts: ConflictManager,
    interceptor: Arc<StateTransferInterceptor>,
    topology_service: Arc<dyn TopologyService>,
    updates: tokio::sync::Mutex<()>,
    accepting_rpcs: AtomicBool,
    join_complete: watch::Sender<bool>,
    confirmation: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl StateTransferManager {
    /// Wire a manager and its consumer, provider and interceptor.
    pub fn new(components: CacheComponents, topology_service: Arc<dyn TopologyService>) -> Arc<Self> {
        let local = components.transport.local_node();
        let cache_name = components.config.cache_name.clone();
        let consumer = Arc::new(StateConsumer::new(&components));
        let provider = Arc::new(StateProvider::new(&components));
        let conflicts = ConflictManager::new(&components, consumer.clone());
        let terminal: Arc<dyn CommandHandler> = Arc::new(LocalCommandHandler::new(&components));
        let interceptor = Arc::new(StateTransferInterceptor::new(&components, terminal));
        let (join_complete, _) = watch::channel(false);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local,
            cache_name,
            components,
            consumer,
            provider,
            conflicts,
            interceptor,
            topology_service,
            updates: tokio::sync::Mutex::new(()),
            accepting_rpcs: AtomicBool::new(false),
            join_complete,
            confirmation: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Join the cache and, if configured, wait for the initial transfer.
    #[tracing::instrument(skip(self), fields(node = self.local, cache = %self.cache_name))]
    pub async fn start(&self) -> Result<()> {
        let config = self.components.config.clone();
        config.validate()?;

        let join_info = CacheJoinInfo {
            num_segments: config.num_segments,
            num_owners: config.num_owners,
            rebalance_type: config.rebalance_type(),
            timeout: config.timeout,
        };
        let started = Instant::now();
        let deadline = started + config.join_timeout;

        let initial = loop {
            match self
                .topology_service
                .join(&self.cache_name, self.local, join_info.clone())
                .await
            {
                Ok(Some(topology)) => break topology,
                Ok(None) => trace!("coordinator not ready, retrying join"),
                Err(e) if e.is_retryable() => warn!(error = %e, "join failed, retrying"),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
        };

        info!(topology_id = initial.topology_id, "joined cache");
        match self.on_topology_update(initial).await {
            Err(Error::Transfer(TransferError::TopologyRegression { current, .. })) => {
                debug!(installed = current, "newer topology arrived before the join reply");
            }
            other => other?,
        }

        if config.await_initial_transfer {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut rx = self.join_complete.subscribe();
            match tokio::time::timeout(remaining, rx.wait_for(|done| *done)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(Error::ShuttingDown),
                Err(_) => {
                    return Err(TransferError::PendingStateTransfer {
                        waited_ms: started.elapsed().as_millis() as u64,
                    }
                    .into())
                }
            }
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "initial state transfer complete");
        }
        Ok(())
    }

    /// Leave the cache and cancel all transfers.
    #[tracing::instrument(skip(self), fields(node = self.local, cache = %self.cache_name))]
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("stopping state transfer");
        if let Some(pending) = self.confirmation.lock().take() {
            pending.abort();
        }
        let left = self.topology_service.leave(&self.cache_name, self.local).await;
        if let Err(e) = &left {
            warn!(error = %e, "failed to leave cache");
        }

        self.accepting_rpcs.store(false, Ordering::Release);
        self.consumer.shutdown();
        self.provider.shutdown();
        self.components.lock.shutdown();
        left
    }

    /// Install a topology pushed by the coordinator.
    #[tracing::instrument(skip_all, fields(node = self.local, topology_id = topology.topology_id, phase = %topology.phase))]
    pub async fn on_topology_update(&self, topology: CacheTopology) -> Result<()> {
        let _serial = self.updates.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let installed = self.components.topology.topology_id();
        let received = i64::from(topology.topology_id);
        if received < installed {
            return Err(TransferError::TopologyRegression {
                current: installed as TopologyId,
                received: topology.topology_id,
            }
            .into());
        }
        if received == installed {
            trace!("topology already installed");
            return Ok(());
        }

        let installed_at = Instant::now();
        let topology = Arc::new(topology);
        // Commands admitted for the new topology must already be tracked.
        let is_rebalance = {
            let _exclusive = self.components.lock.acquire_exclusive_topology_lock().await;
            let previous = self.components.topology.swap(topology.clone());
            let is_rebalance = topology.phase == Phase::ReadOldWriteAll
                && previous.as_ref().map_or(true, |p| {
                    p.rebalance_id != topology.rebalance_id || p.phase != Phase::ReadOldWriteAll
                });
            if is_rebalance || topology.phase == Phase::ConflictResolution {
                self.components.commit.start_track(TrackMode::StateTransfer);
            }
            if topology.is_actual_member(self.local) {
                self.accepting_rpcs.store(true, Ordering::Release);
            }
            is_rebalance
        };

        info!(
            rebalance_id = topology.rebalance_id,
            members = ?topology.members,
            is_rebalance,
            "installed topology"
        );
        self.components.metrics.topology_updates.inc();
        self.components
            .lock
            .notify_topology_installed(topology.topology_id);
        if !self.components.config.transactional {
            self.components
                .lock
                .notify_transaction_data_received(topology.topology_id);
        }

        tokio::try_join!(
            self.consumer.on_topology_update(topology.clone(), is_rebalance),
            self.provider.on_topology_update(&topology, is_rebalance),
        )?;

        if topology.phase == Phase::ConflictResolution {
            if let Some(policy) = self.components.config.merge_policy {
                if let Err(e) = self.conflicts.resolve_conflicts(&topology, policy).await {
                    warn!(error = %e, "conflict resolution failed");
                }
            }
        }

        let owns_data = match self.components.config.rebalance_type() {
            RebalanceType::None => topology.is_member(self.local),
            RebalanceType::FourPhase => {
                topology.phase == Phase::NoRebalance
                    && topology.read_ch().members().contains(&self.local)
            }
        };
        if owns_data {
            let first = self.join_complete.send_if_modified(|done| !std::mem::replace(done, true));
            if first {
                debug!("join complete");
            }
        }

        self.schedule_confirmation(topology, installed_at);
        Ok(())
    }

    /// Confirm the phase of `topology` once local work for it is drained.
    /// A newer topology aborts a confirmation that has not been sent yet.
    fn schedule_confirmation(&self, topology: Arc<CacheTopology>, installed_at: Instant) {
        let mut slot = self.confirmation.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let rebalance_type = self.components.config.rebalance_type();
        if !rebalance_type.requires_confirmation(topology.phase) {
            return;
        }
        let Some(manager) = self.me.upgrade() else {
            return;
        };

        *slot = Some(tokio::spawn(async move {
            let error = manager
                .wait_for_phase(&topology)
                .await
                .err()
                .map(|e| e.to_string());
            if let Some(e) = &error {
                warn!(topology_id = topology.topology_id, error = %e, "phase did not complete cleanly");
            }
            match manager
                .topology_service
                .confirm_rebalance_phase(
                    &manager.cache_name,
                    manager.local,
                    topology.topology_id,
                    topology.rebalance_id,
                    error,
                )
                .await
            {
                Ok(()) => {
                    debug!(topology_id = topology.topology_id, phase = %topology.phase, "phase confirmed");
                    manager
                        .components
                        .metrics
                        .record_phase_confirmed(installed_at.elapsed());
                }
                Err(e) => warn!(error = %e, "failed to confirm phase"),
            }
        }));
    }

    async fn wait_for_phase(&self, topology: &CacheTopology) -> Result<()> {
        if topology.phase != Phase::ReadOldWriteAll {
            return Ok(());
        }
        let timeout = self.components.config.timeout;
        self.consumer.wait_for_inbound_drain(timeout).await?;
        self.provider.wait_for_outbound_drain(timeout).await
    }

    /// Run a locally issued command through the interceptor.
    pub async fn invoke(&self, command: Command) -> Result<()> {
        self.interceptor.handle(None, command).await
    }

    /// Whether the initial state transfer finished.
    pub fn is_join_complete(&self) -> bool {
        *self.join_complete.borrow()
    }

    /// Whether any inbound or outbound transfer is running.
    pub fn is_state_transfer_in_progress(&self) -> bool {
        self.consumer.is_state_transfer_in_progress() || self.provider.is_state_transfer_in_progress()
    }

    /// Whether the segment of `key` is still being received.
    pub fn is_state_transfer_in_progress_for_key(&self, key: &[u8]) -> bool {
        self.consumer.is_state_transfer_in_progress_for_key(key)
    }

    /// The installed topology.
    pub fn cache_topology(&self) -> Option<Arc<CacheTopology>> {
        self.components.topology.get()
    }

    /// Components shared with the consumer and provider.
    pub fn components(&self) -> &CacheComponents {
        &self.components
    }

    /// State transfer metrics of this cache.
    pub fn metrics(&self) -> &Arc<StateTransferMetrics> {
        &self.components.metrics
    }

    fn error_reply(e: Error) -> Message {
        Message::Error(e.to_string())
    }
}

#[async_trait]
impl MessageHandler for StateTransferManager {
    async fn handle_message(&self, origin: NodeId, msg: Message) -> Result<Message> {
        let cache = match &msg {
            Message::StateRequest(req) => Some(&req.cache_name),
            Message::StateResponse(resp) => Some(&resp.cache_name),
            Message::Forwarded(cmd) => Some(&cmd.cache_name),
            _ => None,
        };
        if let Some(cache) = cache {
            if *cache != self.cache_name {
                return Ok(Self::error_reply(
                    TransferError::CacheMismatch {
                        expected: self.cache_name.to_string(),
                        received: cache.to_string(),
                    }
                    .into(),
                ));
            }
        }

        match msg {
            Message::StateRequest(req) => Ok(match self.provider.handle_request(req).await {
                Ok(reply) => Message::StateRequestReply(reply),
                Err(e) => Self::error_reply(e),
            }),
            other if !self.accepting_rpcs.load(Ordering::Acquire) => {
                debug!(origin, kind = other.kind(), "ignoring message before joining");
                Ok(Message::Ack)
            }
            Message::StateResponse(resp) => Ok(
                match self
                    .consumer
                    .apply_state(origin, resp.topology_id, resp.chunks, resp.push)
                    .await
                {
                    Ok(()) => Message::Ack,
                    Err(e) => Self::error_reply(e),
                },
            ),
            Message::Forwarded(forwarded) => Ok(
                match self
                    .interceptor
                    .handle(Some(forwarded.origin), forwarded.command)
                    .await
                {
                    Ok(()) => Message::Ack,
                    Err(e) => Self::error_reply(e),
                },
            ),
            other => Err(NetworkError::UnexpectedReply(other.kind().to_string()).into()),
        }
    }
}

#[async_trait]
impl TopologyListener for StateTransferManager {
    async fn handle_topology_update(&self, topology: CacheTopology) -> Result<()> {
        self.on_topology_update(topology).await
    }
}

impl std::fmt::Debug for StateTransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransferManager")
            .field("local", &self.local)
            .field("cache", &self.cache_name)
            .field("topology_id", &self.components.topology.topology_id())
            .field("join_complete", &self.is_join_complete())
            .finish()
    }
}
