//! Write-path gate for commands issued against an outdated topology.
//!
//! ```text
//!   command(topology T) ──► shared topology lock ──► compare T with current C
//!                                                     │
//!        T == C ────────────────────────────────────► execute
//!        T >  C (remote) ──► wait tx data for T ─────► re-check
//!        T <  C, transactional ──► forward to new owners, execute
//!        T <  C, remote ─────────► OutdatedTopology
//!        T <  C, local ──────────► wait tx data for C, restamp, re-check
//! ```
//!
//! The shared lock is released before any wait so a topology install is
//! never blocked behind a waiting command.

use crate::command::{Command, CommandKind, Modification};
use crate::config::StateTransferConfig;
use crate::container::{DataContainer, PersistenceManager};
use crate::error::{Result, TransferError};
use crate::network::{ForwardedCommand, Transport};
use crate::statetransfer::commit::{CommitManager, TrackMode};
use crate::statetransfer::lock::StateTransferLock;
use crate::statetransfer::CacheComponents;
use crate::topology::{segment_for_key, TopologyHolder};
use crate::tx::TransactionTable;
use crate::types::{CacheEntry, Flag, Mutation, NodeId, TopologyId, WriteOrigin};
use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A stage of the command pipeline.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a command. `origin` is `None` for locally issued commands.
    async fn handle(&self, origin: Option<NodeId>, command: Command) -> Result<()>;
}

/// Terminal stage: applies commands to the local data.
pub struct LocalCommandHandler {
    num_segments: u32,
    commit: Arc<CommitManager>,
    container: Arc<dyn DataContainer>,
    persistence: Option<Arc<dyn PersistenceManager>>,
    tx_table: Arc<dyn TransactionTable>,
}

impl LocalCommandHandler {
    pub fn new(components: &CacheComponents) -> Self {
        Self {
            num_segments: components.config.num_segments,
            commit: components.commit.clone(),
            container: components.container.clone(),
            persistence: components.persistence.clone(),
            tx_table: components.tx_table.clone(),
        }
    }

    async fn write(&self, mutation: Mutation, command: &Command) -> Result<bool> {
        let origin = command.flags.write_origin();
        let local_only = command.flags.contains(Flag::CacheModeLocal) && origin == WriteOrigin::Normal;
        let segment = segment_for_key(mutation.key(), self.num_segments);
        let stored = match (&self.persistence, command.flags.contains(Flag::SkipCacheStore)) {
            (Some(persistence), false) => Some((persistence, mutation.clone())),
            _ => None,
        };

        if !self.commit.commit(mutation, origin, segment, local_only) {
            return Ok(false);
        }
        if let Some((persistence, mutation)) = stored {
            match mutation {
                Mutation::Put(entry) => persistence.write(entry).await?,
                Mutation::Remove(key) => {
                    persistence.delete(&key).await?;
                }
            }
        }
        Ok(true)
    }

    async fn clear(&self, command: &Command) -> Result<()> {
        // History in flight must not resurrect cleared keys.
        self.commit.stop_track(TrackMode::StateTransfer);
        self.container.clear();
        if let (Some(persistence), false) =
            (&self.persistence, command.flags.contains(Flag::SkipCacheStore))
        {
            for key in persistence.load_all_keys(&|_: &[u8]| true).await? {
                persistence.delete(&key).await?;
            }
        }
        Ok(())
    }

    /// Execute `command` locally. Returns how many writes were applied.
    pub async fn execute(&self, command: &Command) -> Result<usize> {
        let mut applied = 0;
        match &command.kind {
            CommandKind::Put {
                key,
                value,
                metadata,
            } => {
                let entry = CacheEntry::with_metadata(key.clone(), value.clone(), *metadata);
                applied += usize::from(self.write(Mutation::Put(entry), command).await?);
            }
            CommandKind::Remove { key } => {
                applied += usize::from(self.write(Mutation::Remove(key.clone()), command).await?);
            }
            CommandKind::PutMap { entries } => {
                for entry in entries {
                    applied += usize::from(self.write(Mutation::Put(entry.clone()), command).await?);
                }
            }
            CommandKind::Clear => self.clear(command).await?,
            CommandKind::Prepare { gtx, modifications } => {
                self.tx_table.get_or_create_remote(*gtx, command.topology_id);
                self.tx_table.add_modifications(*gtx, modifications);
                let keys: Vec<Bytes> = modifications.iter().map(|m| m.key().clone()).collect();
                self.tx_table.add_backup_locks(*gtx, &keys);
            }
            CommandKind::Commit { gtx } => {
                if let Some(tx) = self.tx_table.remove(*gtx) {
                    for modification in tx.modifications {
                        let mutation = match modification {
                            Modification::Put(entry) => Mutation::Put(entry),
                            Modification::Remove(key) => Mutation::Remove(key),
                        };
                        applied += usize::from(self.write(mutation, command).await?);
                    }
                } else {
                    debug!(%gtx, "commit for unknown transaction");
                }
            }
            CommandKind::Rollback { gtx } => {
                self.tx_table.remove(*gtx);
            }
            CommandKind::LockControl { gtx, keys, unlock } => {
                self.tx_table.get_or_create_remote(*gtx, command.topology_id);
                if *unlock {
                    self.tx_table.release_backup_locks(*gtx, keys);
                } else {
                    self.tx_table.add_backup_locks(*gtx, keys);
                }
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl CommandHandler for LocalCommandHandler {
    async fn handle(&self, origin: Option<NodeId>, command: Command) -> Result<()> {
        trace!(?origin, topology_id = command.topology_id, "executing command");
        self.execute(&command).await.map(|_| ())
    }
}

impl std::fmt::Debug for LocalCommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCommandHandler")
            .field("num_segments", &self.num_segments)
            .finish()
    }
}

/// Rejects, retries or forwards commands stamped with an old topology.
pub struct StateTransferInterceptor {
    local: NodeId,
    cache_name: SmolStr,
    config: Arc<StateTransferConfig>,
    topology: Arc<TopologyHolder>,
    lock: Arc<StateTransferLock>,
    tx_table: Arc<dyn TransactionTable>,
    transport: Arc<dyn Transport>,
    next: Arc<dyn CommandHandler>,
}

impl StateTransferInterceptor {
    /// Create an interceptor in front of `next`.
    pub fn new(components: &CacheComponents, next: Arc<dyn CommandHandler>) -> Self {
        Self {
            local: components.transport.local_node(),
            cache_name: components.config.cache_name.clone(),
            config: components.config.clone(),
            topology: components.topology.clone(),
            lock: components.lock.clone(),
            tx_table: components.tx_table.clone(),
            transport: components.transport.clone(),
            next,
        }
    }

    fn keys_of(&self, command: &Command) -> BTreeSet<Bytes> {
        let mut keys = command.affected_keys();
        if keys.is_empty() {
            if let Some(tx) = command.gtx().and_then(|gtx| self.tx_table.get(gtx)) {
                keys.extend(tx.modifications.iter().map(|m| m.key().clone()));
                keys.extend(tx.backup_locks);
            }
        }
        keys
    }

    /// Send a stale transactional command to owners that joined since it
    /// was issued.
    async fn forward_to_new_owners(
        &self,
        origin: Option<NodeId>,
        command: &Command,
        current: TopologyId,
    ) {
        let Some(topology) = self.topology.get() else {
            return;
        };
        let write_ch = topology.write_ch();
        let targets: BTreeSet<NodeId> = self
            .keys_of(command)
            .iter()
            .flat_map(|key| write_ch.locate_key_owners(key).iter().copied())
            .filter(|node| *node != self.local && Some(*node) != origin)
            .collect();
        if targets.is_empty() {
            return;
        }

        debug!(?targets, from = command.topology_id, to = current, "forwarding stale command");
        let mut forwarded = command.clone();
        forwarded.topology_id = current;
        for target in targets {
            let msg = ForwardedCommand {
                cache_name: self.cache_name.clone(),
                origin: self.local,
                command: forwarded.clone(),
            };
            if let Err(e) = self
                .transport
                .forward_command(target, msg, self.config.timeout)
                .await
            {
                warn!(target, error = %e, "failed to forward command");
            }
        }
    }
}

#[async_trait]
impl CommandHandler for StateTransferInterceptor {
    #[tracing::instrument(skip_all, fields(node = self.local, command_topology = command.topology_id))]
    async fn handle(&self, origin: Option<NodeId>, command: Command) -> Result<()> {
        if command.bypasses_topology_check() {
            return self.next.handle(origin, command).await;
        }

        let mut command = command;
        loop {
            let guard = self.lock.acquire_shared_topology_lock().await;
            let current = self.topology.topology_id();
            let issued = i64::from(command.topology_id);

            if issued < current {
                drop(guard);
                let current = current as TopologyId;
                if command.is_transactional() {
                    self.forward_to_new_owners(origin, &command, current).await;
                    return self.next.handle(origin, command).await;
                }
                if origin.is_some() {
                    debug!(current, "rejecting remote command from an older topology");
                    return Err(TransferError::OutdatedTopology {
                        command_topology: command.topology_id,
                        current_topology: current,
                    }
                    .into());
                }
                trace!(current, "retrying local command in the current topology");
                self.lock
                    .wait_for_transaction_data(current, self.config.timeout)
                    .await?;
                command.topology_id = current;
                continue;
            }

            if issued > current && origin.is_some() {
                drop(guard);
                trace!("waiting for transaction data of a newer topology");
                self.lock
                    .wait_for_transaction_data(command.topology_id, self.config.timeout)
                    .await?;
                continue;
            }

            let result = self.next.handle(origin, command).await;
            drop(guard);
            return result;
        }
    }
}

impl std::fmt::Debug for StateTransferInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransferInterceptor")
            .field("local", &self.local)
            .field("cache", &self.cache_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{InMemoryPersistence, MokaDataContainer};
    use crate::error::Error;
    use crate::network::Message;
    use crate::topology::{CacheTopology, ConsistentHash};
    use crate::tx::GlobalTxId;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Forwards {
        sent: Mutex<Vec<(NodeId, ForwardedCommand)>>,
    }

    #[async_trait]
    impl Transport for Forwards {
        fn local_node(&self) -> NodeId {
            1
        }

        async fn send(&self, target: NodeId, msg: Message, _timeout: Duration) -> Result<Message> {
            if let Message::Forwarded(cmd) = msg {
                self.sent.lock().push((target, cmd));
            }
            Ok(Message::Ack)
        }
    }

    struct Fixture {
        components: CacheComponents,
        interceptor: StateTransferInterceptor,
        transport: Arc<Forwards>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(Forwards::default());
        let config = StateTransferConfig::new("c")
            .with_num_segments(4)
            .with_timeout(Duration::from_millis(100));
        let components = CacheComponents::new(config, transport.clone(), Arc::new(MokaDataContainer::new()))
            .with_persistence(Arc::new(InMemoryPersistence::new()));
        let local = Arc::new(LocalCommandHandler::new(&components));
        let interceptor = StateTransferInterceptor::new(&components, local);
        Fixture {
            components,
            interceptor,
            transport,
        }
    }

    fn install(components: &CacheComponents, id: TopologyId, members: &[NodeId]) {
        let ch = ConsistentHash::replicated(4, members);
        components.topology.swap(Arc::new(CacheTopology::stable(id, 1, ch)));
        components.lock.notify_topology_installed(id);
    }

    #[tokio::test]
    async fn test_current_topology_executes() {
        let f = fixture();
        install(&f.components, 3, &[1, 2]);
        f.interceptor
            .handle(Some(2), Command::put(3, "k", "v"))
            .await
            .unwrap();
        assert!(f.components.container.contains(b"k"));
        assert_eq!(f.components.persistence.as_ref().unwrap().size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_remote_command_rejected() {
        let f = fixture();
        install(&f.components, 3, &[1, 2]);
        let err = f
            .interceptor
            .handle(Some(2), Command::put(2, "k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer(TransferError::OutdatedTopology {
                command_topology: 2,
                current_topology: 3
            })
        ));
        assert!(!f.components.container.contains(b"k"));
    }

    #[tokio::test]
    async fn test_stale_local_command_retried() {
        let f = fixture();
        install(&f.components, 3, &[1, 2]);
        f.components.lock.notify_transaction_data_received(3);
        f.interceptor
            .handle(None, Command::put(1, "k", "v"))
            .await
            .unwrap();
        assert!(f.components.container.contains(b"k"));
    }

    #[tokio::test]
    async fn test_stale_local_command_times_out_without_tx_data() {
        let f = fixture();
        install(&f.components, 3, &[1, 2]);
        let err = f
            .interceptor
            .handle(None, Command::put(1, "k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer(TransferError::StateTransferInProgress { topology_id: 3 })
        ));
    }

    #[tokio::test]
    async fn test_newer_remote_command_waits_for_tx_data() {
        let f = fixture();
        install(&f.components, 3, &[1, 2]);
        let lock = f.components.lock.clone();
        let topology = f.components.topology.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let ch = ConsistentHash::replicated(4, &[1, 2]);
            topology.swap(Arc::new(CacheTopology::stable(4, 1, ch)));
            lock.notify_transaction_data_received(4);
        });
        f.interceptor
            .handle(Some(2), Command::put(4, "k", "v"))
            .await
            .unwrap();
        release.await.unwrap();
        assert!(f.components.container.contains(b"k"));
    }

    #[tokio::test]
    async fn test_stale_transaction_forwarded_to_new_owners() {
        let f = fixture();
        install(&f.components, 5, &[1, 2, 3]);
        let gtx = GlobalTxId::new();
        let prepare = Command::new(
            4,
            CommandKind::Prepare {
                gtx,
                modifications: vec![Modification::Put(CacheEntry::new("k", "v"))],
            },
        );
        f.interceptor.handle(Some(2), prepare).await.unwrap();

        let sent = f.transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 3);
        assert_eq!(sent[0].1.command.topology_id, 5);
        assert!(f.components.tx_table.get(gtx).is_some());
    }

    #[tokio::test]
    async fn test_state_transfer_writes_bypass_checks() {
        let f = fixture();
        install(&f.components, 5, &[1, 2]);
        f.components.commit.start_track(TrackMode::StateTransfer);
        let mut cmd = Command::put(1, "k", "v");
        cmd.flags = crate::types::Flags::state_transfer();
        f.interceptor.handle(Some(2), cmd).await.unwrap();
        assert!(f.components.container.contains(b"k"));
        // Skip-store flag keeps it out of the store.
        assert_eq!(f.components.persistence.as_ref().unwrap().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_applies_prepared_writes() {
        let f = fixture();
        install(&f.components, 1, &[1, 2]);
        let gtx = GlobalTxId::new();
        let prepare = Command::new(
            1,
            CommandKind::Prepare {
                gtx,
                modifications: vec![Modification::Put(CacheEntry::new("k", "v"))],
            },
        );
        f.interceptor.handle(Some(2), prepare).await.unwrap();
        assert!(!f.components.container.contains(b"k"));

        f.interceptor
            .handle(Some(2), Command::new(1, CommandKind::Commit { gtx }))
            .await
            .unwrap();
        assert!(f.components.container.contains(b"k"));
        assert!(f.components.tx_table.get(gtx).is_none());
    }

    #[tokio::test]
    async fn test_clear_stops_tracking() {
        let f = fixture();
        install(&f.components, 1, &[1]);
        f.components.commit.start_track(TrackMode::StateTransfer);
        f.interceptor
            .handle(None, Command::put(1, "k", "v"))
            .await
            .unwrap();
        f.interceptor
            .handle(None, Command::new(1, CommandKind::Clear))
            .await
            .unwrap();
        assert!(f.components.container.is_empty());
        assert!(!f.components.commit.is_tracking(TrackMode::StateTransfer));
        assert_eq!(f.components.persistence.as_ref().unwrap().size().await.unwrap(), 0);
    }
}
