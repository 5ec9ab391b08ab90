//! Room-management commands a backend sends to whichever edge worker holds
//! the addressed connection. Every worker subscribes; workers that do not
//! hold the socket ignore the command.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtoResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AdapterCommand {
    Broadcast(BroadcastPacket),
    Join {
        namespace: String,
        socket_id: String,
        room: String,
    },
    Leave {
        namespace: String,
        socket_id: String,
        room: String,
    },
    Disconnect {
        namespace: String,
        socket_id: String,
        close: bool,
    },
}

/// An event addressed to a set of rooms on one channel.
///
/// Every connection sits in a room named after its own socket id, so a
/// single-session emit is a broadcast to that room. No rooms means the whole
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPacket {
    pub namespace: String,
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub except: Vec<String>,
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl BroadcastPacket {
    pub fn new(namespace: impl Into<String>, event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            namespace: namespace.into(),
            rooms: Vec::new(),
            except: Vec::new(),
            event: event.into(),
            args,
            ack_id: None,
        }
    }

    pub fn is_channel_wide(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl AdapterCommand {
    pub fn decode(payload: &[u8]) -> ProtoResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn namespace(&self) -> &str {
        match self {
            AdapterCommand::Broadcast(packet) => &packet.namespace,
            AdapterCommand::Join { namespace, .. }
            | AdapterCommand::Leave { namespace, .. }
            | AdapterCommand::Disconnect { namespace, .. } => namespace,
        }
    }
}
