//! Testing utilities for state transfer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │  node 1    │    │  node 2    │    │  node 3    │  managers  │
//! │   └─────┬──────┘    └─────┬──────┘    └─────┬──────┘            │
//! │         │ frames          │                 │                   │
//! │   ┌─────▼─────────────────▼─────────────────▼──────┐            │
//! │   │               InMemoryNetwork                  │  crash,    │
//! │   │                                                │  hold      │
//! │   └────────────────────────────────────────────────┘            │
//! │         ▲ topologies      ▲                 ▲                   │
//! │   ┌─────┴─────────────────┴─────────────────┴──────┐            │
//! │   │            TestTopologyCoordinator             │  phases,   │
//! │   │                                                │  confirms  │
//! │   └────────────────────────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gridstate::testing::TestCluster;
//! use gridstate::StateTransferConfig;
//!
//! let config = StateTransferConfig::new("users").with_num_segments(8);
//! let mut cluster = TestCluster::start(config, 3).await?;
//! cluster.put("k", "v").await?;
//! cluster.leave(3).await?;
//! cluster.wait_for_stable().await?;
//! ```

pub mod cluster;
pub mod coordinator;
pub mod network;

#[cfg(test)]
mod rebalance_tests;

pub use cluster::{TestCluster, TestNode, SETTLE_TIMEOUT};
pub use coordinator::{ClusterView, TestTopologyCoordinator};
pub use network::{InMemoryNetwork, LocalTransport};

use std::time::{Duration, Instant};

/// Poll `condition` every 10ms until it holds or `timeout` passes.
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
