//! RPC message types exchanged between state transfer peers.

use crate::command::Command;
use crate::tx::TransactionInfo;
use crate::types::{CacheEntry, NodeId, SegmentId, TopologyId};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeSet;

/// Network message wrapper for all state transfer communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Request sent by a consumer to a provider.
    StateRequest(StateRequestCommand),

    /// Reply to a state request.
    StateRequestReply(StateRequestReply),

    /// Batch of segment data pushed by a provider.
    StateResponse(StateResponseCommand),

    /// Command re-sent to the new owners of its keys.
    Forwarded(ForwardedCommand),

    /// Empty acknowledgement for one-way messages.
    Ack,

    /// The remote handler failed.
    Error(String),
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StateRequest(_) => "state_request",
            Message::StateRequestReply(_) => "state_request_reply",
            Message::StateResponse(_) => "state_response",
            Message::Forwarded(_) => "forwarded",
            Message::Ack => "ack",
            Message::Error(_) => "error",
        }
    }
}

/// What a state request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateRequestType {
    /// Return in-flight transactions on the given segments.
    GetTransactions,
    /// Start streaming the given segments to the requester.
    StartStateTransfer,
    /// Stop streaming the given segments to the requester.
    CancelStateTransfer,
    /// Return the live entries of the given segments for reconciliation.
    GetSegmentEntries,
}

/// A consumer's request to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequestCommand {
    /// Cache the request is for.
    pub cache_name: SmolStr,

    /// Request type.
    pub kind: StateRequestType,

    /// Requesting node.
    pub origin: NodeId,

    /// Topology id of the requester.
    pub topology_id: TopologyId,

    /// Requested segments.
    pub segments: BTreeSet<SegmentId>,
}

impl StateRequestCommand {
    /// Create a new request.
    pub fn new(
        cache_name: SmolStr,
        kind: StateRequestType,
        origin: NodeId,
        topology_id: TopologyId,
        segments: BTreeSet<SegmentId>,
    ) -> Self {
        Self {
            cache_name,
            kind,
            origin,
            topology_id,
            segments,
        }
    }
}

/// Reply to a [`StateRequestCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateRequestReply {
    /// Transactions touching the requested segments.
    Transactions(Vec<TransactionInfo>),
    /// The request was accepted.
    Accepted,
    /// Live entries of the requested segments.
    Entries(Vec<CacheEntry>),
}

/// Segment data pushed from a provider to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponseCommand {
    /// Cache the data belongs to.
    pub cache_name: SmolStr,

    /// Sending node.
    pub origin: NodeId,

    /// Topology id the provider streamed under.
    pub topology_id: TopologyId,

    /// Chunks, at most one per segment.
    pub chunks: Vec<StateChunk>,

    /// Unconditional push used by conflict resolution; applied without
    /// an inbound task.
    pub push: bool,
}

/// Entries of one segment within a [`StateResponseCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChunk {
    /// Segment the entries belong to.
    pub segment_id: SegmentId,

    /// Entries.
    pub entries: Vec<CacheEntry>,

    /// Whether this is the final chunk for the segment.
    pub is_last_chunk: bool,
}

impl StateChunk {
    /// Create a chunk.
    pub fn new(segment_id: SegmentId, entries: Vec<CacheEntry>, is_last_chunk: bool) -> Self {
        Self {
            segment_id,
            entries,
            is_last_chunk,
        }
    }
}

/// A command forwarded to new owners after a topology change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedCommand {
    /// Cache the command targets.
    pub cache_name: SmolStr,

    /// Forwarding node.
    pub origin: NodeId,

    /// The command, restamped with the forwarder's topology id.
    pub command: Command,
}

/// Encode a message to bytes without framing.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode an unframed message.
pub fn decode_message(data: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_response_serialization() {
        let msg = Message::StateResponse(StateResponseCommand {
            cache_name: "users".into(),
            origin: 3,
            topology_id: 7,
            chunks: vec![StateChunk::new(2, vec![CacheEntry::new("k", "v")], true)],
            push: false,
        });

        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        if let Message::StateResponse(resp) = decoded {
            assert_eq!(resp.origin, 3);
            assert_eq!(resp.chunks.len(), 1);
            assert!(resp.chunks[0].is_last_chunk);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(Message::Ack.kind(), "ack");
        assert_eq!(Message::Error("x".into()).kind(), "error");
    }
}
