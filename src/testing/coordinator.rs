//! Topology coordinator for test clusters.
//!
//! A single event loop owns the cluster view. Joins, leaves and phase
//! confirmations are queued to it and every topology it produces is pushed
//! to all members before the next event is handled, so members observe
//! topologies in id order.
//!
//! ```text
//!   join ──► membership update ──► READ_OLD_WRITE_ALL ─(all confirm)─►
//!   READ_ALL_WRITE_ALL ─(all confirm)─► READ_NEW_WRITE_ALL ─(all confirm)─►
//!   NO_REBALANCE (pending hash becomes current)
//! ```
//!
//! Joins that arrive while a rebalance runs are deferred until it ends.
//! A leave prunes the leaver from the current hash and restarts the
//! rebalance from scratch, as does a phase some member confirmed with an
//! error. Conflict resolution installs a CONFLICT_RESOLUTION topology over
//! the current hash, then a stable one.

use crate::config::CacheMode;
use crate::error::{Error, Result};
use crate::network::{TopologyListener, TopologyService};
use crate::statetransfer::RebalanceType;
use crate::topology::{CacheJoinInfo, CacheTopology, ConsistentHash, Phase};
use crate::types::{NodeId, TopologyId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type JoinReply = oneshot::Sender<Result<Option<CacheTopology>>>;

enum Event {
    Register {
        node: NodeId,
        listener: Arc<dyn TopologyListener>,
    },
    Join {
        node: NodeId,
        info: CacheJoinInfo,
        reply: JoinReply,
    },
    Leave {
        node: NodeId,
        reply: oneshot::Sender<()>,
    },
    Confirm {
        node: NodeId,
        topology_id: TopologyId,
        rebalance_id: u32,
        error: Option<String>,
        reply: oneshot::Sender<()>,
    },
    ResolveConflicts {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<ClusterView>,
    },
}

/// What the coordinator currently believes.
#[derive(Debug, Clone)]
pub struct ClusterView {
    /// Latest topology pushed to members.
    pub topology: Option<CacheTopology>,
    /// Members in join order.
    pub members: Vec<NodeId>,
    /// Joins waiting for the running rebalance to end.
    pub deferred_joins: usize,
    /// Confirmations that reported an error.
    pub failed_confirmations: u64,
}

impl ClusterView {
    /// Whether no rebalance is running or pending.
    pub fn is_stable(&self) -> bool {
        self.deferred_joins == 0
            && self
                .topology
                .as_ref()
                .map_or(false, |t| t.phase == Phase::NoRebalance)
    }
}

/// [`TopologyService`] driving the four-phase rebalance for one cache.
#[derive(Debug)]
pub struct TestTopologyCoordinator {
    events: mpsc::UnboundedSender<Event>,
}

impl TestTopologyCoordinator {
    /// Start the coordinator loop. Must be called within a tokio runtime.
    pub fn new(cache_mode: CacheMode) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let state = CoordinatorState {
            cache_mode,
            join_info: None,
            members: Vec::new(),
            topology: None,
            next_topology_id: 1,
            rebalance_id: 0,
            awaiting: HashSet::new(),
            phase_failed: false,
            listeners: HashMap::new(),
            deferred: VecDeque::new(),
            failed_confirmations: 0,
        };
        tokio::spawn(state.run(rx));
        Arc::new(Self { events })
    }

    /// Push topologies for `node` to `listener`.
    pub fn register(&self, node: NodeId, listener: Arc<dyn TopologyListener>) {
        let _ = self.events.send(Event::Register { node, listener });
    }

    /// Treat `node` as crashed: it is removed without being asked.
    pub async fn crash(&self, node: NodeId) -> Result<()> {
        self.leave("", node).await
    }

    /// Reconcile divergent copies across the owners of every segment.
    /// Ignored while a rebalance runs.
    pub async fn resolve_conflicts(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::ResolveConflicts { reply })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Current cluster view.
    pub async fn view(&self) -> Result<ClusterView> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Snapshot { reply })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Wait until no rebalance is running or pending.
    pub async fn wait_for_stable(&self, timeout: Duration) -> Result<CacheTopology> {
        let deadline = Instant::now() + timeout;
        loop {
            let view = self.view().await?;
            if view.is_stable() {
                if let Some(topology) = view.topology {
                    return Ok(topology);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn submit(&self, event: Event) -> Result<()> {
        self.events.send(event).map_err(|_| Error::ShuttingDown)
    }
}

#[async_trait]
impl TopologyService for TestTopologyCoordinator {
    async fn join(
        &self,
        _cache: &str,
        node: NodeId,
        join_info: CacheJoinInfo,
    ) -> Result<Option<CacheTopology>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Join {
            node,
            info: join_info,
            reply,
        })?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    async fn leave(&self, _cache: &str, node: NodeId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Leave { node, reply })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    async fn confirm_rebalance_phase(
        &self,
        _cache: &str,
        node: NodeId,
        topology_id: TopologyId,
        rebalance_id: u32,
        error: Option<String>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Confirm {
            node,
            topology_id,
            rebalance_id,
            error,
            reply,
        })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }
}

struct CoordinatorState {
    cache_mode: CacheMode,
    join_info: Option<CacheJoinInfo>,
    members: Vec<NodeId>,
    topology: Option<CacheTopology>,
    next_topology_id: TopologyId,
    rebalance_id: u32,
    awaiting: HashSet<NodeId>,
    /// Some member confirmed the running phase with an error.
    phase_failed: bool,
    listeners: HashMap<NodeId, Arc<dyn TopologyListener>>,
    deferred: VecDeque<(NodeId, CacheJoinInfo, JoinReply)>,
    failed_confirmations: u64,
}

impl CoordinatorState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Register { node, listener } => {
                    self.listeners.insert(node, listener);
                }
                Event::Join { node, info, reply } => self.handle_join(node, info, reply).await,
                Event::Leave { node, reply } => {
                    self.handle_leave(node).await;
                    let _ = reply.send(());
                }
                Event::Confirm {
                    node,
                    topology_id,
                    rebalance_id,
                    error,
                    reply,
                } => {
                    let _ = reply.send(());
                    self.handle_confirm(node, topology_id, rebalance_id, error)
                        .await;
                }
                Event::ResolveConflicts { reply } => {
                    self.handle_resolve_conflicts().await;
                    let _ = reply.send(());
                }
                Event::Snapshot { reply } => {
                    let _ = reply.send(ClusterView {
                        topology: self.topology.clone(),
                        members: self.members.clone(),
                        deferred_joins: self.deferred.len(),
                        failed_confirmations: self.failed_confirmations,
                    });
                }
            }
        }
    }

    fn rebalance_type(&self) -> RebalanceType {
        self.join_info
            .as_ref()
            .map_or(RebalanceType::FourPhase, |i| i.rebalance_type)
    }

    fn balanced_hash(&self) -> ConsistentHash {
        let (num_segments, num_owners) = self
            .join_info
            .as_ref()
            .map_or((1, 1), |i| (i.num_segments, i.num_owners));
        match self.cache_mode {
            CacheMode::Replicated => ConsistentHash::replicated(num_segments, &self.members),
            _ => ConsistentHash::distributed(num_segments, num_owners, &self.members),
        }
    }

    fn next_id(&mut self) -> TopologyId {
        let id = self.next_topology_id;
        self.next_topology_id += 1;
        id
    }

    async fn handle_join(&mut self, node: NodeId, info: CacheJoinInfo, reply: JoinReply) {
        if self.members.contains(&node) {
            let _ = reply.send(Ok(self.topology.clone()));
            return;
        }
        let rebalancing = self
            .topology
            .as_ref()
            .map_or(false, |t| t.phase != Phase::NoRebalance);
        if rebalancing {
            debug!(node, "deferring join until the rebalance ends");
            self.deferred.push_back((node, info, reply));
            return;
        }
        if self.join_info.is_none() {
            self.join_info = Some(info);
        }
        self.members.push(node);
        info!(node, members = ?self.members, "node joined");

        let id = self.next_id();
        let topology = match (&self.topology, self.rebalance_type()) {
            (Some(current), RebalanceType::FourPhase) => {
                let mut t = current.clone();
                t.topology_id = id;
                t.members = self.members.clone();
                t.actual_members = self.members.clone();
                t
            }
            _ => CacheTopology::stable(id, self.rebalance_id, self.balanced_hash()),
        };
        self.install(topology.clone()).await;
        let _ = reply.send(Ok(Some(topology.clone())));

        if self.rebalance_type() == RebalanceType::FourPhase
            && !topology.current_ch.members().contains(&node)
        {
            self.start_rebalance().await;
        }
    }

    async fn handle_leave(&mut self, node: NodeId) {
        self.listeners.remove(&node);
        self.deferred.retain(|(n, _, _)| *n != node);
        if !self.members.contains(&node) {
            return;
        }
        self.members.retain(|m| *m != node);
        self.phase_failed = false;
        info!(node, members = ?self.members, "node left");
        if self.members.is_empty() {
            self.topology = None;
            self.awaiting.clear();
            return;
        }
        let Some(current) = self.topology.as_ref().map(|t| t.current_ch.clone()) else {
            return;
        };

        let id = self.next_id();
        let mut pruned = match self.rebalance_type() {
            RebalanceType::FourPhase => {
                CacheTopology::stable(id, self.rebalance_id, current.without_members(&[node]))
            }
            RebalanceType::None => CacheTopology::stable(id, self.rebalance_id, self.balanced_hash()),
        };
        pruned.members = self.members.clone();
        pruned.actual_members = self.members.clone();
        self.awaiting.clear();
        self.install(pruned).await;

        if self.rebalance_type() == RebalanceType::FourPhase {
            self.start_rebalance().await;
        }
    }

    async fn handle_confirm(
        &mut self,
        node: NodeId,
        topology_id: TopologyId,
        rebalance_id: u32,
        error: Option<String>,
    ) {
        let Some(topology) = &self.topology else {
            return;
        };
        if topology.topology_id != topology_id || topology.rebalance_id != rebalance_id {
            debug!(node, topology_id, "ignoring stale confirmation");
            return;
        }
        if let Some(e) = error {
            warn!(node, topology_id, error = %e, "member reported a failed phase");
            self.failed_confirmations += 1;
            self.phase_failed = true;
        }
        self.awaiting.remove(&node);
        if !self.awaiting.is_empty() {
            return;
        }
        if std::mem::take(&mut self.phase_failed) {
            info!(topology_id, rebalance_id, "phase failed on some member, restarting rebalance");
            self.start_rebalance().await;
        } else {
            self.advance().await;
        }
    }

    async fn handle_resolve_conflicts(&mut self) {
        let Some(current) = self.topology.clone() else {
            return;
        };
        if current.phase != Phase::NoRebalance || !self.deferred.is_empty() {
            debug!("rebalance running, skipping conflict resolution");
            return;
        }
        let id = self.next_id();
        let mut merging = current.clone();
        merging.topology_id = id;
        merging.phase = Phase::ConflictResolution;
        info!(topology_id = id, "resolving conflicts");
        self.install(merging).await;

        let id = self.next_id();
        let mut stable = current;
        stable.topology_id = id;
        self.install(stable).await;
    }

    async fn start_rebalance(&mut self) {
        let Some(current) = self.topology.as_ref().map(|t| t.current_ch.clone()) else {
            return;
        };
        self.rebalance_id += 1;
        self.phase_failed = false;
        let id = self.next_id();
        let pending = Arc::new(self.balanced_hash());
        let topology = CacheTopology::rebalancing(
            id,
            self.rebalance_id,
            current,
            pending,
            Phase::ReadOldWriteAll,
        );
        info!(topology_id = id, rebalance_id = self.rebalance_id, "starting rebalance");
        self.awaiting = self.members.iter().copied().collect();
        self.install(topology).await;
    }

    async fn advance(&mut self) {
        let Some(topology) = self.topology.clone() else {
            return;
        };
        let next = self.rebalance_type().next_phase(topology.phase);
        let id = self.next_id();
        let pending = topology
            .pending_ch
            .clone()
            .unwrap_or_else(|| topology.current_ch.clone());

        let advanced = if next == Phase::NoRebalance {
            let mut stable =
                CacheTopology::stable(id, topology.rebalance_id, (*pending).clone());
            stable.members = self.members.clone();
            stable.actual_members = self.members.clone();
            stable
        } else {
            self.awaiting = self.members.iter().copied().collect();
            CacheTopology::rebalancing(
                id,
                topology.rebalance_id,
                topology.current_ch.clone(),
                pending,
                next,
            )
        };
        debug!(topology_id = id, phase = %next, "advancing rebalance");
        self.install(advanced).await;

        if next == Phase::NoRebalance {
            if let Some((node, info, reply)) = self.deferred.pop_front() {
                self.handle_join(node, info, reply).await;
            }
        }
    }

    /// Push `topology` to every member and wait until all have handled it.
    async fn install(&mut self, topology: CacheTopology) {
        self.topology = Some(topology.clone());
        let mut pushes = JoinSet::new();
        for member in &self.members {
            let Some(listener) = self.listeners.get(member).cloned() else {
                continue;
            };
            let topology = topology.clone();
            let member = *member;
            pushes.spawn(async move {
                (member, listener.handle_topology_update(topology).await)
            });
        }
        while let Some(pushed) = pushes.join_next().await {
            match pushed {
                Ok((_, Ok(()))) => {}
                Ok((member, Err(e))) => {
                    warn!(member, topology_id = topology.topology_id, error = %e, "topology push failed")
                }
                Err(e) => warn!(error = %e, "topology push task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(TopologyId, Phase)>>);

    #[async_trait]
    impl TopologyListener for Recorder {
        async fn handle_topology_update(&self, topology: CacheTopology) -> Result<()> {
            self.0.lock().push((topology.topology_id, topology.phase));
            Ok(())
        }
    }

    fn info() -> CacheJoinInfo {
        CacheJoinInfo {
            num_segments: 4,
            num_owners: 2,
            rebalance_type: RebalanceType::FourPhase,
            timeout: Duration::from_secs(1),
        }
    }

    async fn confirm_all(coordinator: &TestTopologyCoordinator, nodes: &[NodeId]) {
        let t = coordinator.view().await.unwrap().topology.unwrap();
        for n in nodes {
            coordinator
                .confirm_rebalance_phase("c", *n, t.topology_id, t.rebalance_id, None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_join_walks_through_all_phases() {
        let coordinator = TestTopologyCoordinator::new(CacheMode::Distributed);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        coordinator.register(1, first.clone());
        coordinator.register(2, second.clone());

        let t1 = coordinator.join("c", 1, info()).await.unwrap().unwrap();
        assert_eq!(t1.topology_id, 1);
        assert_eq!(t1.current_ch.members(), &[1]);

        let t2 = coordinator.join("c", 2, info()).await.unwrap().unwrap();
        assert_eq!(t2.members, vec![1, 2]);
        assert!(t2.pending_ch.is_none());

        for _ in 0..3 {
            confirm_all(&coordinator, &[1, 2]).await;
        }
        let stable = coordinator
            .wait_for_stable(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stable.topology_id, 6);
        assert_eq!(stable.current_ch.members(), &[1, 2]);

        let phases: Vec<Phase> = second.0.lock().iter().map(|(_, p)| *p).collect();
        assert_eq!(
            phases,
            vec![
                Phase::NoRebalance,
                Phase::ReadOldWriteAll,
                Phase::ReadAllWriteAll,
                Phase::ReadNewWriteAll,
                Phase::NoRebalance,
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_confirmation_does_not_advance() {
        let coordinator = TestTopologyCoordinator::new(CacheMode::Distributed);
        coordinator.join("c", 1, info()).await.unwrap();
        coordinator.join("c", 2, info()).await.unwrap();

        let rowa = coordinator.view().await.unwrap().topology.unwrap();
        assert_eq!(rowa.phase, Phase::ReadOldWriteAll);
        coordinator
            .confirm_rebalance_phase("c", 1, rowa.topology_id, rowa.rebalance_id, None)
            .await
            .unwrap();
        coordinator
            .confirm_rebalance_phase("c", 2, rowa.topology_id - 1, rowa.rebalance_id, None)
            .await
            .unwrap();
        let view = coordinator.view().await.unwrap();
        assert_eq!(view.topology.unwrap().topology_id, rowa.topology_id);
    }

    #[tokio::test]
    async fn test_leave_prunes_and_rebalances() {
        let coordinator = TestTopologyCoordinator::new(CacheMode::Distributed);
        coordinator.join("c", 1, info()).await.unwrap();
        coordinator.join("c", 2, info()).await.unwrap();
        for _ in 0..3 {
            confirm_all(&coordinator, &[1, 2]).await;
        }

        coordinator.leave("c", 2).await.unwrap();
        let view = coordinator.view().await.unwrap();
        let topology = view.topology.unwrap();
        assert_eq!(view.members, vec![1]);
        assert_eq!(topology.phase, Phase::ReadOldWriteAll);
        assert_eq!(topology.current_ch.members(), &[1]);
        for s in 0..4 {
            assert!(!topology.current_ch.locate_owners(s).contains(&2));
        }
    }

    #[tokio::test]
    async fn test_join_deferred_during_rebalance() {
        let coordinator = TestTopologyCoordinator::new(CacheMode::Distributed);
        coordinator.join("c", 1, info()).await.unwrap();
        coordinator.join("c", 2, info()).await.unwrap();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.join("c", 3, info()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.view().await.unwrap().deferred_joins, 1);

        for _ in 0..3 {
            confirm_all(&coordinator, &[1, 2]).await;
        }
        let joined = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(joined.members, vec![1, 2, 3]);
        let view = coordinator.view().await.unwrap();
        assert_eq!(view.topology.unwrap().phase, Phase::ReadOldWriteAll);
    }

    #[tokio::test]
    async fn test_failed_confirmation_restarts_rebalance() {
        let coordinator = TestTopologyCoordinator::new(CacheMode::Distributed);
        coordinator.join("c", 1, info()).await.unwrap();
        coordinator.join("c", 2, info()).await.unwrap();

        let rowa = coordinator.view().await.unwrap().topology.unwrap();
        assert_eq!(rowa.phase, Phase::ReadOldWriteAll);
        coordinator
            .confirm_rebalance_phase("c", 1, rowa.topology_id, rowa.rebalance_id, None)
            .await
            .unwrap();
        coordinator
            .confirm_rebalance_phase(
                "c",
                2,
                rowa.topology_id,
                rowa.rebalance_id,
                Some("timed out".to_string()),
            )
            .await
            .unwrap();

        let view = coordinator.view().await.unwrap();
        let restarted = view.topology.unwrap();
        assert_eq!(view.failed_confirmations, 1);
        assert_eq!(restarted.phase, Phase::ReadOldWriteAll);
        assert_eq!(restarted.rebalance_id, rowa.rebalance_id + 1);
        assert!(restarted.topology_id > rowa.topology_id);

        // A clean round afterwards runs to completion.
        for _ in 0..3 {
            confirm_all(&coordinator, &[1, 2]).await;
        }
        let stable = coordinator
            .wait_for_stable(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stable.current_ch.members(), &[1, 2]);
    }

    #[tokio::test]
    async fn test_conflict_resolution_returns_to_stable() {
        let coordinator = TestTopologyCoordinator::new(CacheMode::Distributed);
        let recorder = Arc::new(Recorder::default());
        coordinator.register(1, recorder.clone());
        coordinator.join("c", 1, info()).await.unwrap();

        coordinator.resolve_conflicts().await.unwrap();
        let phases: Vec<Phase> = recorder.0.lock().iter().map(|(_, p)| *p).collect();
        assert_eq!(
            phases,
            vec![Phase::NoRebalance, Phase::ConflictResolution, Phase::NoRebalance]
        );
        let view = coordinator.view().await.unwrap();
        assert!(view.is_stable());
        assert_eq!(view.topology.unwrap().topology_id, 3);
    }
}
