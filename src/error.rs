//! Error types for the state transfer engine.

use crate::types::{NodeId, SegmentId, TopologyId};
use std::io;
use thiserror::Error;

/// Result type alias for state transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the state transfer engine.
#[derive(Error, Debug)]
pub enum Error {
    /// State transfer protocol errors.
    #[error("state transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The component is shutting down; barrier waiters fail fast with this.
    #[error("shutting down")]
    ShuttingDown,

    /// Error reported by a remote node.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure points at the peer rather than at the request.
    ///
    /// Retryable errors make the consumer pick another source for the
    /// same segments within the current round.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout | Error::RemoteError(_) => true,
            Error::Transfer(TransferError::StateTransferInProgress { .. }) => true,
            _ => false,
        }
    }

    /// Whether this error means a peer is presumed dead.
    pub fn is_suspect(&self) -> bool {
        matches!(self, Error::Network(NetworkError::Suspect(_)))
    }
}

/// State transfer protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// A command was issued against a topology older than the installed one.
    #[error("outdated topology: command topology {command_topology}, current {current_topology}")]
    OutdatedTopology {
        command_topology: TopologyId,
        current_topology: TopologyId,
    },

    /// Waiting for a topology or its transaction data timed out; retry later.
    #[error("state transfer in progress for topology {topology_id}")]
    StateTransferInProgress { topology_id: TopologyId },

    /// Every owner of a segment left the cluster.
    #[error("all owners lost for segment {segment}")]
    AllOwnersLost { segment: SegmentId },

    /// Join or phase confirmation did not complete in time.
    #[error("pending state transfer did not complete within {waited_ms}ms")]
    PendingStateTransfer { waited_ms: u64 },

    /// A peer asked for segments this node does not own.
    #[error("segments {segments:?} are not owned by node {node}")]
    InvalidSegmentRequest { segments: Vec<SegmentId>, node: NodeId },

    /// A topology update went backwards.
    #[error("topology regression: installed {current}, received {received}")]
    TopologyRegression {
        current: TopologyId,
        received: TopologyId,
    },

    /// The local node is not yet a member of the cache topology.
    #[error("node {0} is not a member of the cache topology")]
    NotMember(NodeId),

    /// A message addressed to a different cache.
    #[error("message for cache {received} delivered to cache {expected}")]
    CacheMismatch { expected: String, received: String },
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The target node is suspected to have crashed.
    #[error("node {0} is suspected")]
    Suspect(NodeId),

    /// The target node is not known to the transport.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer replied with an unexpected message type.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Frame checksum did not match.
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Loading a single key failed.
    #[error("failed to load key {key}: {reason}")]
    Load { key: String, reason: String },

    /// Writing or deleting a key failed.
    #[error("failed to write key {key}: {reason}")]
    Write { key: String, reason: String },

    /// I/O error.
    #[error("storage io error: {0}")]
    Io(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
