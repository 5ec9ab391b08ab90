use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{Bus, BusMessage, BusResult, DeliveryReport, TOPIC_CAPACITY};

/// Redis pub/sub backed bus.
///
/// PUBLISH goes through a shared connection manager and its integer reply is
/// the delivery report. Each `subscribe` call opens its own pub/sub
/// connection, so one call counts as one subscriber on the broker side.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        let (tx, rx) = broadcast::channel(TOPIC_CAPACITY);
        let subscribed = topic.to_string();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let message = BusMessage {
                    topic: msg.get_channel_name().to_string(),
                    payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                };
                if tx.send(message).is_err() {
                    debug!(
                        topic = %subscribed,
                        "last local subscriber dropped; closing redis subscription"
                    );
                    return;
                }
            }
            warn!(topic = %subscribed, "redis subscription stream ended");
        });
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<DeliveryReport> {
        let mut conn = self.publisher.clone();
        let subscribers: usize = conn.publish(topic, &payload[..]).await?;
        Ok(DeliveryReport { subscribers })
    }
}
