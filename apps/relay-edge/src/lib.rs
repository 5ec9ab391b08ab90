//! Edge half of the relay.
//!
//! Terminates client websockets, keeps one registry of live sessions per
//! channel and relays every connect, event and disconnect to the channel's
//! backend over the bus. Replies come back on `toWorker:<id>` (callbacks),
//! `toWorker:all` (close and custom messages) and the adapter topic (room
//! broadcasts and membership).
//!
//! All session state lives in a single worker task; the transport and the
//! bus only talk to it through messages.

mod config;
mod error;
mod link;
mod outbox;
mod registry;
mod rooms;
pub mod telemetry;
mod transport;
mod worker;

pub use config::{
    origin_allowed, Cli, ConfigError, ConnectHook, ConnectInfo, CustomHandler, EdgeConfig,
    WorkerConfig,
};
pub use error::EdgeError;
pub use link::{AckFn, ClientLink, Outbound};
pub use registry::ConnectOutcome;
pub use transport::{router, AppState, SOCKET_ID_PARAM};
pub use worker::{ChannelStats, EdgeWorker, TransportEvent, WorkerHandle};
