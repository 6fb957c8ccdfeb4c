//! In-process network connecting the nodes of a test cluster.
//!
//! Every message is framed with the production codec on the way out and
//! decoded on the way in, so tests exercise checksums and compression.
//! Nodes can be crashed (all traffic to and from them fails with
//! [`NetworkError::Suspect`]) and individual message kinds can be held
//! back until released.

use crate::error::{Error, NetworkError, Result};
use crate::network::{decode_frame, encode_frame, Message, MessageHandler, Transport};
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

/// Routes framed messages between registered handlers.
pub struct InMemoryNetwork {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    crashed: RwLock<HashSet<NodeId>>,
    held: RwLock<HashMap<&'static str, watch::Sender<bool>>>,
    compress_threshold: usize,
    delivered: AtomicU64,
}

impl InMemoryNetwork {
    /// Create a network that compresses payloads above `compress_threshold` bytes.
    pub fn new(compress_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            crashed: RwLock::new(HashSet::new()),
            held: RwLock::new(HashMap::new()),
            compress_threshold,
            delivered: AtomicU64::new(0),
        })
    }

    /// Route messages for `node` to `handler`.
    pub fn register(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        self.crashed.write().remove(&node);
        self.handlers.write().insert(node, handler);
    }

    /// Stop routing messages to `node`.
    pub fn unregister(&self, node: NodeId) {
        self.handlers.write().remove(&node);
    }

    /// Cut `node` off; its handler is dropped.
    pub fn crash(&self, node: NodeId) {
        self.crashed.write().insert(node);
        self.unregister(node);
    }

    /// Whether `node` has been crashed.
    pub fn is_crashed(&self, node: NodeId) -> bool {
        self.crashed.read().contains(&node)
    }

    /// Delay delivery of every message of `kind` until [`Self::release`].
    pub fn hold(&self, kind: &'static str) {
        self.held
            .write()
            .entry(kind)
            .or_insert_with(|| watch::channel(true).0)
            .send_replace(true);
    }

    /// Deliver held messages of `kind` and stop holding new ones.
    pub fn release(&self, kind: &'static str) {
        if let Some(gate) = self.held.write().remove(kind) {
            gate.send_replace(false);
        }
    }

    /// Messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Transport endpoint for `node`.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node,
            network: self.clone(),
        })
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message> {
        if self.is_crashed(from) || self.is_crashed(to) {
            return Err(NetworkError::Suspect(to).into());
        }

        let gate = self.held.read().get(msg.kind()).map(|g| g.subscribe());
        if let Some(mut gate) = gate {
            trace!(from, to, kind = msg.kind(), "holding message");
            let _ = gate.wait_for(|held| !*held).await;
        }

        let handler = self
            .handlers
            .read()
            .get(&to)
            .cloned()
            .ok_or(NetworkError::UnknownNode(to))?;
        let request = decode_frame(&encode_frame(&msg, self.compress_threshold)?)?;

        let reply = tokio::time::timeout(timeout, handler.handle_message(from, request))
            .await
            .map_err(|_| Error::Timeout)??;
        if self.is_crashed(to) {
            return Err(NetworkError::Suspect(to).into());
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        decode_frame(&encode_frame(&reply, self.compress_threshold)?)
    }
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("nodes", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("crashed", &*self.crashed.read())
            .field("delivered", &self.delivered())
            .finish()
    }
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct LocalTransport {
    node: NodeId,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn send(&self, target: NodeId, msg: Message, timeout: Duration) -> Result<Message> {
        self.network.deliver(self.node, target, msg, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle_message(&self, origin: NodeId, msg: Message) -> Result<Message> {
            match msg {
                Message::Ack => Ok(Message::Error(format!("from {origin}"))),
                other => Ok(other),
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_codec() {
        let network = InMemoryNetwork::new(0);
        network.register(2, Arc::new(Echo));
        let reply = network
            .transport(1)
            .send(2, Message::Ack, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Message::Error("from 1".into()));
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn test_crashed_node_is_suspect() {
        let network = InMemoryNetwork::new(1024);
        network.register(2, Arc::new(Echo));
        network.crash(2);
        let err = network
            .transport(1)
            .send(2, Message::Ack, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_suspect());

        let err = network
            .transport(1)
            .send(3, Message::Ack, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::UnknownNode(3))));
    }

    #[tokio::test]
    async fn test_held_messages_wait_for_release() {
        let network = InMemoryNetwork::new(1024);
        network.register(2, Arc::new(Echo));
        network.hold("ack");

        let transport = network.transport(1);
        let pending = tokio::spawn(async move {
            transport
                .send(2, Message::Ack, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        network.release("ack");
        assert!(pending.await.unwrap().is_ok());
    }
}
