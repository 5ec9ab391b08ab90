//! Backend half of the relay.
//!
//! A [`Namespace`] subscribes to `toBackend:<channel>` and rebuilds each
//! client connection as a [`VirtualSession`]: connection hooks, middleware
//! and per-event listeners run against it as if the socket were local, while
//! every reply (emits, acknowledgments, room operations) travels back over
//! the bus to the edge worker that holds the real connection.
//!
//! Each virtual session is driven by its own task, so handlers for one
//! session run strictly in arrival order and a stalled middleware or slow
//! handler only holds up that session.

mod adapter;
mod config;
mod error;
mod middleware;
mod namespace;
mod session;

pub use adapter::{BusRoomAdapter, RoomAdapter};
pub use config::{BackendConfig, ErrorSink, Extensions};
pub use error::{AckError, AdapterError, DispatchError, HandlerError, HandlerResult};
pub use middleware::Next;
pub use namespace::Namespace;
pub use session::{Ack, BroadcastOperator, EventKey, VirtualSession};
