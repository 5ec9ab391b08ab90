use std::sync::Arc;

use async_trait::async_trait;
use relay_bus::{publish_json, Bus};
use relay_proto::{AdapterCommand, BroadcastPacket, Topics};
use tracing::debug;

use crate::error::AdapterError;

/// Room management on the edge transport, addressed by socket id.
///
/// The backend never touches sockets; these calls are the only way it
/// changes what a client receives.
#[async_trait]
pub trait RoomAdapter: Send + Sync {
    async fn remote_join(&self, namespace: &str, socket_id: &str, room: &str)
        -> Result<(), AdapterError>;
    async fn remote_leave(&self, namespace: &str, socket_id: &str, room: &str)
        -> Result<(), AdapterError>;
    async fn remote_disconnect(
        &self,
        namespace: &str,
        socket_id: &str,
        close: bool,
    ) -> Result<(), AdapterError>;
    async fn broadcast(&self, packet: BroadcastPacket) -> Result<(), AdapterError>;
}

/// Publishes [`AdapterCommand`]s on the shared adapter topic.
///
/// Directed commands succeed once at least one edge worker received them;
/// only the worker holding the socket acts on them.
pub struct BusRoomAdapter {
    bus: Arc<dyn Bus>,
    topic: String,
}

impl BusRoomAdapter {
    pub fn new(bus: Arc<dyn Bus>, topics: &Topics) -> Self {
        Self {
            bus,
            topic: topics.adapter(),
        }
    }

    async fn send_directed(
        &self,
        command: &'static str,
        message: AdapterCommand,
    ) -> Result<(), AdapterError> {
        let report = publish_json(self.bus.as_ref(), &self.topic, &message).await?;
        if report.delivered() {
            Ok(())
        } else {
            Err(AdapterError::NoWorkers { command })
        }
    }
}

#[async_trait]
impl RoomAdapter for BusRoomAdapter {
    async fn remote_join(
        &self,
        namespace: &str,
        socket_id: &str,
        room: &str,
    ) -> Result<(), AdapterError> {
        self.send_directed(
            "join",
            AdapterCommand::Join {
                namespace: namespace.to_string(),
                socket_id: socket_id.to_string(),
                room: room.to_string(),
            },
        )
        .await
    }

    async fn remote_leave(
        &self,
        namespace: &str,
        socket_id: &str,
        room: &str,
    ) -> Result<(), AdapterError> {
        self.send_directed(
            "leave",
            AdapterCommand::Leave {
                namespace: namespace.to_string(),
                socket_id: socket_id.to_string(),
                room: room.to_string(),
            },
        )
        .await
    }

    async fn remote_disconnect(
        &self,
        namespace: &str,
        socket_id: &str,
        close: bool,
    ) -> Result<(), AdapterError> {
        self.send_directed(
            "disconnect",
            AdapterCommand::Disconnect {
                namespace: namespace.to_string(),
                socket_id: socket_id.to_string(),
                close,
            },
        )
        .await
    }

    async fn broadcast(&self, packet: BroadcastPacket) -> Result<(), AdapterError> {
        let event = packet.event.clone();
        let report =
            publish_json(self.bus.as_ref(), &self.topic, &AdapterCommand::Broadcast(packet)).await?;
        // Nobody listening means nobody to deliver to.
        if !report.delivered() {
            debug!(%event, "broadcast reached no edge workers");
        }
        Ok(())
    }
}
