//! Network communication layer.

pub mod codec;
pub mod rpc;
pub mod transport;

pub use codec::{decode_frame, encode_frame};
pub use rpc::{
    ForwardedCommand, Message, StateChunk, StateRequestCommand, StateRequestReply,
    StateRequestType, StateResponseCommand,
};
pub use transport::{MessageHandler, TopologyListener, TopologyService, Transport};
