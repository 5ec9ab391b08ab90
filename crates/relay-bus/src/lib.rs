use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

mod redis_bus;

pub use redis_bus::RedisBus;

/// Buffered messages per topic before a slow subscriber starts lagging.
pub const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Outcome of a publish: how many subscribers the bus handed the message to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub subscribers: usize,
}

impl DeliveryReport {
    pub fn delivered(&self) -> bool {
        self.subscribers > 0
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>>;
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<DeliveryReport>;
}

/// Serialize `value` as one JSON document and publish it on `topic`.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn Bus,
    topic: &str,
    value: &T,
) -> BusResult<DeliveryReport> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(topic, Bytes::from(payload)).await
}

/// Receive the next message, logging and skipping over lag gaps.
///
/// Returns `None` once the topic sender is gone.
pub async fn recv_message(rx: &mut broadcast::Receiver<BusMessage>) -> Option<BusMessage> {
    loop {
        match rx.recv().await {
            Ok(msg) => return Some(msg),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "bus subscriber lagged; messages were dropped");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// In-memory bus for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        Ok(self.sender_for(topic).subscribe())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<DeliveryReport> {
        let sender = self.sender_for(topic);
        // A send with no receivers is a zero-subscriber delivery, not a failure.
        let subscribers = sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0);
        Ok(DeliveryReport { subscribers })
    }
}
