use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_backend::{BackendConfig, Namespace};
use relay_bus::RedisBus;
use relay_proto::{Topics, DEFAULT_PREFIX};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-chat", author, version, about = "Chat backend for a relay channel")]
struct Cli {
    /// Redis connection URI for the pub/sub bus.
    #[arg(long, env = "RELAY_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Prefix of every bus topic; must match the edge workers.
    #[arg(long, env = "RELAY_TOPIC_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Channel this backend owns.
    #[arg(long, env = "RELAY_CHAT_CHANNEL", default_value = relay_chat::DEFAULT_CHANNEL)]
    channel: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    info!(channel = %cli.channel, redis_url = %cli.redis_url, "starting chat backend");

    let bus = RedisBus::connect(&cli.redis_url)
        .await
        .context("failed to connect to redis")?;
    let config = BackendConfig::new(cli.channel.clone()).with_topics(Topics::new(cli.prefix));
    let namespace = Namespace::new(config, Arc::new(bus));
    relay_chat::install(&namespace);
    let listener = namespace.listen().await.context("failed to subscribe")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!(
                sessions = namespace.session_count(),
                "shutdown signal received; closing channel"
            );
            if let Err(err) = namespace.close().await {
                warn!(error = %err, "failed to announce channel close");
            }
        }
        result = listener => {
            if let Err(err) = result {
                warn!(error = %err, "backend listener failed");
            }
        }
    }
    Ok(())
}
