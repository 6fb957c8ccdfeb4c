//! Coordination primitives gating commands against topology changes.
//!
//! ```text
//!                   ┌──────────────────────────────┐
//!   command ───────►│ shared topology lock         │◄──── manager swaps topology
//!                   │ (exclusive only during swap) │      under the exclusive lock
//!                   └──────────────────────────────┘
//!   interceptor ───► transaction data barrier  ◄──── consumer: tx data for T ready
//!   provider ──────► topology installed barrier ◄──── manager: T installed
//! ```
//!
//! The barriers are independent so waiters on one never block callers of
//! the other.

use crate::error::{Error, Result, TransferError};
use crate::types::TopologyId;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::trace;

const UNSET: i64 = -1;
const SHUTDOWN: i64 = i64::MAX;

/// A monotonic version counter with waiters.
pub struct VersionBarrier {
    name: &'static str,
    version: Mutex<i64>,
    notify: Notify,
}

impl VersionBarrier {
    /// Create a barrier with no version reached.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            version: Mutex::new(UNSET),
            notify: Notify::new(),
        }
    }

    /// Current version, or -1 when none has been reached.
    pub fn version(&self) -> i64 {
        *self.version.lock()
    }

    /// Whether the barrier was shut down.
    pub fn is_shutdown(&self) -> bool {
        self.version() == SHUTDOWN
    }

    /// Raise the version. Lower or equal versions are ignored.
    pub fn advance(&self, version: TopologyId) {
        let mut current = self.version.lock();
        if *current == SHUTDOWN || i64::from(version) <= *current {
            return;
        }
        *current = i64::from(version);
        drop(current);
        trace!(barrier = self.name, version, "barrier advanced");
        self.notify.notify_waiters();
    }

    /// Wait until the version is at least `min`.
    ///
    /// Fails with `StateTransferInProgress` on timeout and with
    /// `ShuttingDown` once the barrier is shut down.
    pub async fn wait_for(&self, min: TopologyId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.version();
            if current == SHUTDOWN {
                return Err(Error::ShuttingDown);
            }
            if current >= i64::from(min) {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                trace!(barrier = self.name, min, current, "barrier wait timed out");
                return Err(TransferError::StateTransferInProgress { topology_id: min }.into());
            }
        }
    }

    /// Force the barrier to its sentinel and wake all waiters.
    pub fn shutdown(&self) {
        *self.version.lock() = SHUTDOWN;
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for VersionBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionBarrier")
            .field("name", &self.name)
            .field("version", &self.version())
            .finish()
    }
}

/// Per-cache topology lock and barriers.
#[derive(Debug)]
pub struct StateTransferLock {
    topology_lock: RwLock<()>,
    topology_installed: VersionBarrier,
    transaction_data: VersionBarrier,
}

impl Default for StateTransferLock {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTransferLock {
    /// Create a lock with no topology installed.
    pub fn new() -> Self {
        Self {
            topology_lock: RwLock::new(()),
            topology_installed: VersionBarrier::new("topology_installed"),
            transaction_data: VersionBarrier::new("transaction_data"),
        }
    }

    /// Held while the topology reference is replaced.
    pub async fn acquire_exclusive_topology_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.topology_lock.write().await
    }

    /// Held while a command checks ownership and executes.
    pub async fn acquire_shared_topology_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.topology_lock.read().await
    }

    /// Signal that local transaction data for `topology_id` is complete.
    pub fn notify_transaction_data_received(&self, topology_id: TopologyId) {
        self.transaction_data.advance(topology_id);
    }

    /// Wait for transaction data of `topology_id`.
    pub async fn wait_for_transaction_data(
        &self,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> Result<()> {
        self.transaction_data.wait_for(topology_id, timeout).await
    }

    /// Whether transaction data for `topology_id` is complete.
    pub fn transaction_data_received(&self, topology_id: TopologyId) -> bool {
        self.transaction_data.version() >= i64::from(topology_id)
    }

    /// Signal that `topology_id` is installed.
    pub fn notify_topology_installed(&self, topology_id: TopologyId) {
        self.topology_installed.advance(topology_id);
    }

    /// Wait for `topology_id` to be installed.
    pub async fn wait_for_topology(&self, topology_id: TopologyId, timeout: Duration) -> Result<()> {
        self.topology_installed.wait_for(topology_id, timeout).await
    }

    /// Whether `topology_id` is installed.
    pub fn topology_received(&self, topology_id: TopologyId) -> bool {
        self.topology_installed.version() >= i64::from(topology_id)
    }

    /// Release every waiter with `ShuttingDown`.
    pub fn shutdown(&self) {
        self.topology_installed.shutdown();
        self.transaction_data.shutdown();
    }
}
