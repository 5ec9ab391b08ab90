//! Wire schema shared by edge workers and backends.
//!
//! Every bus payload is one JSON document discriminated by its `type` field.
//! Kept free of runtime dependencies so both sides (and non-Rust peers) can
//! track it without pulling in the bus or the transport.

mod adapter;
mod frames;
mod messages;
mod topics;

pub use adapter::{AdapterCommand, BroadcastPacket};
pub use frames::{ClientFrame, ServerFrame};
pub use messages::{
    CallbackMessage, ClientAck, ClientEvent, CloseMessage, CustomMessage, NewConnection,
    ToBackend, ToWorker, DISCONNECT_EVENT,
};
pub use topics::{Topics, DEFAULT_PREFIX};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("clientEvent for {socket_id}: ackRequested={ack_requested} disagrees with callbackId")]
    AckMismatch {
        socket_id: String,
        ack_requested: bool,
    },
}

pub type ProtoResult<T> = Result<T, ProtoError>;
