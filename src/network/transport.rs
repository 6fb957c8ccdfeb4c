//! Transport and coordinator seams.

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{
    ForwardedCommand, Message, StateRequestCommand, StateRequestReply, StateResponseCommand,
};
use crate::topology::{CacheJoinInfo, CacheTopology};
use crate::types::{NodeId, TopologyId};
use async_trait::async_trait;
use std::time::Duration;

/// Point-to-point messaging between cluster members.
///
/// Implementations only need [`Transport::send`]; the typed helpers map
/// replies onto the expected shape.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// This node's id.
    fn local_node(&self) -> NodeId;

    /// Send a message and wait for the reply.
    ///
    /// Fails with [`NetworkError::Suspect`] when the target is presumed dead
    /// and with [`Error::Timeout`] when no reply arrives in time.
    async fn send(&self, target: NodeId, msg: Message, timeout: Duration) -> Result<Message>;

    /// Send a state request.
    async fn send_state_request(
        &self,
        target: NodeId,
        request: StateRequestCommand,
        timeout: Duration,
    ) -> Result<StateRequestReply> {
        match self.send(target, Message::StateRequest(request), timeout).await? {
            Message::StateRequestReply(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    /// Push segment data to a consumer.
    async fn send_state_response(
        &self,
        target: NodeId,
        response: StateResponseCommand,
        timeout: Duration,
    ) -> Result<()> {
        match self.send(target, Message::StateResponse(response), timeout).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Forward a command to another node.
    async fn forward_command(
        &self,
        target: NodeId,
        command: ForwardedCommand,
        timeout: Duration,
    ) -> Result<()> {
        match self.send(target, Message::Forwarded(command), timeout).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(msg: Message) -> Error {
    match msg {
        Message::Error(e) => Error::RemoteError(e),
        other => NetworkError::UnexpectedReply(other.kind().to_string()).into(),
    }
}

/// Receives messages delivered by a transport.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and produce the reply.
    async fn handle_message(&self, origin: NodeId, msg: Message) -> Result<Message>;
}

/// Cluster-wide topology coordinator, as seen by one node.
#[async_trait]
pub trait TopologyService: Send + Sync + std::fmt::Debug {
    /// Register `node` as a member of `cache`.
    ///
    /// Returns `None` while the coordinator cannot serve joins yet.
    async fn join(
        &self,
        cache: &str,
        node: NodeId,
        join_info: CacheJoinInfo,
    ) -> Result<Option<CacheTopology>>;

    /// Remove `node` from `cache`.
    async fn leave(&self, cache: &str, node: NodeId) -> Result<()>;

    /// Confirm that `node` has completed the current phase of `topology_id`.
    async fn confirm_rebalance_phase(
        &self,
        cache: &str,
        node: NodeId,
        topology_id: TopologyId,
        rebalance_id: u32,
        error: Option<String>,
    ) -> Result<()>;
}

/// Receives topology updates pushed by the coordinator.
#[async_trait]
pub trait TopologyListener: Send + Sync + 'static {
    /// Install `topology`.
    async fn handle_topology_update(&self, topology: CacheTopology) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::StateRequestType;

    #[derive(Debug)]
    struct Scripted(Message);

    #[async_trait]
    impl Transport for Scripted {
        fn local_node(&self) -> NodeId {
            1
        }

        async fn send(&self, _target: NodeId, _msg: Message, _timeout: Duration) -> Result<Message> {
            Ok(self.0.clone())
        }
    }

    fn request() -> StateRequestCommand {
        StateRequestCommand::new(
            "c".into(),
            StateRequestType::StartStateTransfer,
            1,
            1,
            [0].into_iter().collect(),
        )
    }

    #[tokio::test]
    async fn test_typed_reply() {
        let transport = Scripted(Message::StateRequestReply(StateRequestReply::Accepted));
        let reply = transport
            .send_state_request(2, request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, StateRequestReply::Accepted);
    }

    #[tokio::test]
    async fn test_remote_error_reply() {
        let transport = Scripted(Message::Error("boom".into()));
        let err = transport
            .send_state_request(2, request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteError(ref m) if m == "boom"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unexpected_reply() {
        let transport = Scripted(Message::Ack);
        let err = transport
            .send_state_request(2, request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::UnexpectedReply(_))
        ));
    }
}
