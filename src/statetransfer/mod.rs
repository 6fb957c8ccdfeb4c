//! State transfer: moving segment data between owners as topology changes.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   coordinator ────►│    StateTransferManager      │
//!                    └──────┬───────────────┬───────┘
//!                           │               │
//!                    ┌──────▼─────┐   ┌─────▼──────┐
//!                    │  Consumer  │   │  Provider  │
//!                    │ (inbound)  │   │ (outbound) │
//!                    └──────┬─────┘   └─────┬──────┘
//!                           │               │
//!                    ┌──────▼───────────────▼──────┐
//!                    │  CommitManager / container  │
//!                    └─────────────────────────────┘
//! ```

pub mod commit;
pub mod conflict;
pub mod consumer;
pub mod inbound;
pub mod interceptor;
pub mod lock;
pub mod manager;
pub mod outbound;
pub mod provider;
pub mod rebalance;

pub use commit::{CommitManager, DiscardPolicy, TrackMode};
pub use conflict::ConflictManager;
pub use consumer::StateConsumer;
pub use inbound::{InboundTransferTask, TaskOutcome};
pub use interceptor::{CommandHandler, LocalCommandHandler, StateTransferInterceptor};
pub use lock::{StateTransferLock, VersionBarrier};
pub use manager::StateTransferManager;
pub use outbound::{OutboundContext, OutboundTransferTask};
pub use provider::StateProvider;
pub use rebalance::RebalanceType;

use crate::config::StateTransferConfig;
use crate::container::{DataContainer, PersistenceManager};
use crate::metrics::StateTransferMetrics;
use crate::network::Transport;
use crate::topology::TopologyHolder;
use crate::tx::{InMemoryTransactionTable, TransactionTable};
use std::sync::Arc;

/// Collaborators shared by the components of one cache on one node.
#[derive(Clone)]
pub struct CacheComponents {
    pub config: Arc<StateTransferConfig>,
    pub topology: Arc<TopologyHolder>,
    pub lock: Arc<StateTransferLock>,
    pub container: Arc<dyn DataContainer>,
    pub persistence: Option<Arc<dyn PersistenceManager>>,
    pub commit: Arc<CommitManager>,
    pub tx_table: Arc<dyn TransactionTable>,
    pub transport: Arc<dyn Transport>,
    pub metrics: Arc<StateTransferMetrics>,
}

impl CacheComponents {
    /// Wire fresh components around `container`.
    pub fn new(
        config: StateTransferConfig,
        transport: Arc<dyn Transport>,
        container: Arc<dyn DataContainer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            topology: Arc::new(TopologyHolder::new()),
            lock: Arc::new(StateTransferLock::new()),
            commit: Arc::new(CommitManager::new(container.clone())),
            container,
            persistence: None,
            tx_table: Arc::new(InMemoryTransactionTable::new()),
            transport,
            metrics: Arc::new(StateTransferMetrics::new()),
        }
    }

    /// Attach a persistent store.
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Use a specific transaction table.
    pub fn with_tx_table(mut self, tx_table: Arc<dyn TransactionTable>) -> Self {
        self.tx_table = tx_table;
        self
    }
}

impl std::fmt::Debug for CacheComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheComponents")
            .field("cache", &self.config.cache_name)
            .field("node", &self.transport.local_node())
            .field("topology_id", &self.topology.topology_id())
            .finish()
    }
}
