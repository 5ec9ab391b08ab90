use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_proto::{Topics, DEFAULT_PREFIX};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// What the transport knows about a connection when it is accepted.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub socket_id: String,
    pub channel: String,
    pub origin: Option<String>,
    pub query: HashMap<String, String>,
}

/// Gathers extra fields forwarded to the backend with `newConnection`.
pub type ConnectHook = Arc<dyn Fn(&ConnectInfo) -> Map<String, Value> + Send + Sync>;
/// Receives the fields of every `custom` message on `toWorker:all`.
pub type CustomHandler = Arc<dyn Fn(Map<String, Value>) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one channel is required")]
    NoChannels,
    #[error("channel `{0}` must start with '/'")]
    InvalidChannel(String),
    #[error("channel `{0}` is configured twice")]
    DuplicateChannel(String),
    #[error("worker id must not be empty")]
    EmptyWorkerId,
    #[error("worker id `all` is reserved for the broadcast topic")]
    ReservedWorkerId,
}

/// Library-level configuration of an edge worker.
#[derive(Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub channels: Vec<String>,
    pub topics: Topics,
    pub allowed_origins: Vec<String>,
    pub stats_interval: Option<Duration>,
    pub on_connect: Option<ConnectHook>,
    pub on_custom: Option<CustomHandler>,
}

impl WorkerConfig {
    pub fn new(
        worker_id: impl Into<String>,
        channels: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            channels: channels.into_iter().map(Into::into).collect(),
            topics: Topics::default(),
            allowed_origins: Vec::new(),
            stats_interval: None,
            on_connect: None,
            on_custom: None,
        }
    }

    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    pub fn on_connect(
        mut self,
        hook: impl Fn(&ConnectInfo) -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_custom(
        mut self,
        handler: impl Fn(Map<String, Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_custom = Some(Arc::new(handler));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.is_empty() {
            return Err(ConfigError::EmptyWorkerId);
        }
        if self.worker_id == "all" {
            return Err(ConfigError::ReservedWorkerId);
        }
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        for (index, channel) in self.channels.iter().enumerate() {
            if !channel.starts_with('/') {
                return Err(ConfigError::InvalidChannel(channel.clone()));
            }
            if self.channels[..index].contains(channel) {
                return Err(ConfigError::DuplicateChannel(channel.clone()));
            }
        }
        Ok(())
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        origin_allowed(&self.allowed_origins, origin)
    }
}

/// Empty allow-list accepts every origin.
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    origin.is_some_and(|origin| allowed.iter().any(|candidate| candidate == origin))
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("worker_id", &self.worker_id)
            .field("channels", &self.channels)
            .field("topics", &self.topics)
            .field("allowed_origins", &self.allowed_origins)
            .field("stats_interval", &self.stats_interval)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_custom", &self.on_custom.is_some())
            .finish()
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "relay-edge",
    author,
    version,
    about = "Edge worker relaying websocket clients to channel backends over redis"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "RELAY_EDGE_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Redis connection URI for the pub/sub bus.
    #[arg(long, env = "RELAY_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix of every bus topic.
    #[arg(long, env = "RELAY_TOPIC_PREFIX", default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Identity of this worker on `toWorker:<id>`; random when unset.
    #[arg(long, env = "RELAY_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Channels served by this worker, e.g. `/chat`.
    #[arg(long = "channel", env = "RELAY_CHANNELS", value_delimiter = ',', required = true)]
    pub channels: Vec<String>,

    /// Origins allowed to open a websocket; any origin when empty.
    #[arg(long = "allowed-origin", env = "RELAY_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Log live session counts on this interval; 0 disables.
    #[arg(long, env = "RELAY_STATS_INTERVAL_SECS", default_value_t = 0)]
    pub stats_interval_secs: u64,

    /// Upper bound on flushing disconnects during shutdown.
    #[arg(long, env = "RELAY_EDGE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

/// Validated configuration of the edge binary.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub shutdown_grace: Duration,
    pub worker: WorkerConfig,
}

impl TryFrom<Cli> for EdgeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let worker_id = cli
            .worker_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut worker = WorkerConfig::new(worker_id, cli.channels)
            .with_topics(Topics::new(cli.prefix))
            .with_allowed_origins(cli.allowed_origins);
        if cli.stats_interval_secs > 0 {
            worker = worker.with_stats_interval(Duration::from_secs(cli.stats_interval_secs));
        }
        worker.validate().context("invalid worker configuration")?;
        Ok(EdgeConfig {
            listen_addr,
            redis_url: cli.redis_url,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            worker,
        })
    }
}
