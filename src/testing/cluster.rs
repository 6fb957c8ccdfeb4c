//! Multi-node test cluster.
//!
//! Wires one [`StateTransferManager`] per node to a shared
//! [`InMemoryNetwork`] and [`TestTopologyCoordinator`].

use crate::command::Command;
use crate::config::StateTransferConfig;
use crate::container::{DataContainer, MokaDataContainer};
use crate::error::{Error, Result};
use crate::statetransfer::{CacheComponents, StateTransferManager};
use crate::testing::coordinator::TestTopologyCoordinator;
use crate::testing::network::InMemoryNetwork;
use crate::topology::{segment_for_key, CacheTopology};
use crate::types::{NodeId, SegmentId};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// How long cluster helpers wait for the coordinator to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// One member of a [`TestCluster`].
#[derive(Debug, Clone)]
pub struct TestNode {
    /// Node id.
    pub id: NodeId,
    /// The node's state transfer manager.
    pub manager: Arc<StateTransferManager>,
    /// The node's data container.
    pub container: Arc<MokaDataContainer>,
}

/// A set of nodes sharing one cache.
#[derive(Debug)]
pub struct TestCluster {
    /// Network connecting the nodes.
    pub network: Arc<InMemoryNetwork>,
    /// Topology coordinator.
    pub coordinator: Arc<TestTopologyCoordinator>,
    config: StateTransferConfig,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Create an empty cluster. Must be called within a tokio runtime.
    pub fn new(config: StateTransferConfig) -> Self {
        Self {
            network: InMemoryNetwork::new(config.compress_threshold),
            coordinator: TestTopologyCoordinator::new(config.cache_mode),
            config,
            nodes: BTreeMap::new(),
        }
    }

    /// Start nodes `1..=count` one after the other and wait until stable.
    pub async fn start(config: StateTransferConfig, count: u64) -> Result<Self> {
        let mut cluster = Self::new(config);
        for id in 1..=count {
            cluster.join(id).await?;
        }
        cluster.wait_for_stable().await?;
        Ok(cluster)
    }

    /// Wire `id` into the network and coordinator without starting it.
    pub fn add_node(&mut self, id: NodeId) -> Arc<StateTransferManager> {
        let container = Arc::new(MokaDataContainer::new());
        let components = CacheComponents::new(
            self.config.clone(),
            self.network.transport(id),
            container.clone(),
        );
        let manager = StateTransferManager::new(components, self.coordinator.clone());
        self.network.register(id, manager.clone());
        self.coordinator.register(id, manager.clone());
        self.nodes.insert(
            id,
            TestNode {
                id,
                manager: manager.clone(),
                container,
            },
        );
        manager
    }

    /// Add `id` and wait for its initial state transfer.
    pub async fn join(&mut self, id: NodeId) -> Result<()> {
        let manager = self.add_node(id);
        manager.start().await?;
        info!(node = id, "node started");
        Ok(())
    }

    /// Gracefully stop `id`.
    pub async fn leave(&mut self, id: NodeId) -> Result<()> {
        let node = self.nodes.remove(&id).ok_or_else(|| Error::Internal(format!("no node {id}")))?;
        node.manager.stop().await?;
        self.network.unregister(id);
        Ok(())
    }

    /// Kill `id` without letting it leave.
    pub async fn crash(&mut self, id: NodeId) -> Result<()> {
        self.nodes.remove(&id);
        self.network.crash(id);
        self.coordinator.crash(id).await
    }

    /// Wait until the coordinator has no rebalance running.
    pub async fn wait_for_stable(&self) -> Result<CacheTopology> {
        let topology = self.coordinator.wait_for_stable(SETTLE_TIMEOUT).await?;
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        while self.nodes.values().any(|n| {
            n.manager
                .cache_topology()
                .map_or(true, |t| t.topology_id < topology.topology_id)
        }) {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(topology)
    }

    /// Node `id`.
    pub fn node(&self, id: NodeId) -> Option<&TestNode> {
        self.nodes.get(&id)
    }

    /// Running nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.values()
    }

    /// Write `key` on every write owner, each at its own topology id.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let topology = self.any_topology()?;
        for owner in topology.write_ch().locate_key_owners(key.as_bytes()) {
            let Some(node) = self.nodes.get(owner) else {
                continue;
            };
            let topology_id = node
                .manager
                .cache_topology()
                .map_or(0, |t| t.topology_id);
            node.manager
                .invoke(Command::put(
                    topology_id,
                    Bytes::copy_from_slice(key.as_bytes()),
                    Bytes::copy_from_slice(value.as_bytes()),
                ))
                .await?;
        }
        Ok(())
    }

    /// Value of `key` held by node `id`.
    pub fn get(&self, id: NodeId, key: &str) -> Option<Bytes> {
        self.nodes
            .get(&id)
            .and_then(|n| n.container.get(key.as_bytes()))
            .map(|e| e.value)
    }

    /// Read owners of `key` in the latest topology.
    pub fn owners_of(&self, key: &str) -> Vec<NodeId> {
        self.any_topology()
            .map(|t| t.read_ch().locate_key_owners(key.as_bytes()).to_vec())
            .unwrap_or_default()
    }

    /// `count` distinct keys that all hash to `segment`.
    pub fn keys_in_segment(&self, segment: SegmentId, count: usize) -> Vec<String> {
        (0u64..)
            .map(|i| format!("key-{segment}-{i}"))
            .filter(|k| segment_for_key(k.as_bytes(), self.config.num_segments) == segment)
            .take(count)
            .collect()
    }

    fn any_topology(&self) -> Result<Arc<CacheTopology>> {
        self.nodes
            .values()
            .filter_map(|n| n.manager.cache_topology())
            .max_by_key(|t| t.topology_id)
            .ok_or(Error::Internal("no topology installed".into()))
    }
}
