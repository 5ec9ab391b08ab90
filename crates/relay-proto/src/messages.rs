use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ProtoError, ProtoResult};

/// Event name the edge relays when a client connection goes away.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Edge worker → backend, published on `toBackend:<channel>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToBackend {
    NewConnection(NewConnection),
    ClientEvent(ClientEvent),
    /// A client answered an event the backend emitted with an ack id.
    ClientAck(ClientAck),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnection {
    pub socket_id: String,
    pub channel: String,
    /// Whatever the edge's connect hook attached; copied onto the virtual session.
    #[serde(default)]
    pub additional_info: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    pub socket_id: String,
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub ack_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<u64>,
    pub worker_id: String,
}

impl ClientEvent {
    pub fn new(
        socket_id: impl Into<String>,
        channel: impl Into<String>,
        event: impl Into<String>,
        args: Vec<Value>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            socket_id: socket_id.into(),
            channel: channel.into(),
            event: event.into(),
            args,
            ack_requested: false,
            callback_id: None,
            worker_id: worker_id.into(),
        }
    }

    /// The synthetic event that tears down the backend's virtual session.
    pub fn disconnect(
        socket_id: impl Into<String>,
        channel: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self::new(socket_id, channel, DISCONNECT_EVENT, Vec::new(), worker_id)
    }

    pub fn with_callback(mut self, callback_id: u64) -> Self {
        self.ack_requested = true;
        self.callback_id = Some(callback_id);
        self
    }

    pub fn is_disconnect(&self) -> bool {
        self.event == DISCONNECT_EVENT
    }

    fn validate(&self) -> ProtoResult<()> {
        if self.ack_requested != self.callback_id.is_some() {
            return Err(ProtoError::AckMismatch {
                socket_id: self.socket_id.clone(),
                ack_requested: self.ack_requested,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAck {
    pub socket_id: String,
    pub channel: String,
    pub callback_id: u64,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Backend → edge worker, on `toWorker:<workerId>` or `toWorker:all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToWorker {
    Callback(CallbackMessage),
    Close(CloseMessage),
    Custom(CustomMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMessage {
    pub namespace: String,
    pub socket_id: String,
    pub callback_id: u64,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub namespace: String,
}

/// Free-form application message fanned out to every edge worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomMessage {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ToBackend {
    pub fn decode(payload: &[u8]) -> ProtoResult<Self> {
        let message: ToBackend = serde_json::from_slice(payload)?;
        if let ToBackend::ClientEvent(event) = &message {
            event.validate()?;
        }
        Ok(message)
    }

    pub fn encode(&self) -> ProtoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn socket_id(&self) -> &str {
        match self {
            ToBackend::NewConnection(msg) => &msg.socket_id,
            ToBackend::ClientEvent(msg) => &msg.socket_id,
            ToBackend::ClientAck(msg) => &msg.socket_id,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            ToBackend::NewConnection(msg) => &msg.channel,
            ToBackend::ClientEvent(msg) => &msg.channel,
            ToBackend::ClientAck(msg) => &msg.channel,
        }
    }

    /// Metric/log label for the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ToBackend::NewConnection(_) => "new_connection",
            ToBackend::ClientEvent(_) => "client_event",
            ToBackend::ClientAck(_) => "client_ack",
        }
    }
}

impl ToWorker {
    pub fn decode(payload: &[u8]) -> ProtoResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> ProtoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Channel the message is scoped to; custom messages are not.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            ToWorker::Callback(msg) => Some(&msg.namespace),
            ToWorker::Close(msg) => Some(&msg.namespace),
            ToWorker::Custom(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn client_event_wire_shape() {
        let event = ClientEvent::new("s1", "/chat", "ping", vec![json!(1)], "w1").with_callback(4);
        let value = serde_json::to_value(ToBackend::ClientEvent(event)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "clientEvent",
                "socketId": "s1",
                "channel": "/chat",
                "event": "ping",
                "args": [1],
                "ackRequested": true,
                "callbackId": 4,
                "workerId": "w1"
            })
        );
    }

    #[test_timeout::timeout]
    fn callback_id_is_omitted_without_ack() {
        let event = ClientEvent::new("s1", "/chat", "postMessage", vec![], "w1");
        let value = serde_json::to_value(ToBackend::ClientEvent(event)).unwrap();
        assert!(value.get("callbackId").is_none());
        assert_eq!(value["ackRequested"], json!(false));
    }

    #[test_timeout::timeout]
    fn decode_rejects_ack_flag_without_callback_id() {
        let payload = json!({
            "type": "clientEvent",
            "socketId": "s1",
            "channel": "/chat",
            "event": "ping",
            "args": [],
            "ackRequested": true,
            "workerId": "w1"
        });
        let err = ToBackend::decode(payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, ProtoError::AckMismatch { ack_requested: true, .. }));
    }

    #[test_timeout::timeout]
    fn decode_rejects_unknown_type() {
        let payload = br#"{"type":"handshake","socketId":"s1"}"#;
        assert!(matches!(
            ToBackend::decode(payload),
            Err(ProtoError::Malformed(_))
        ));
        assert!(ToWorker::decode(payload).is_err());
    }

    #[test_timeout::timeout]
    fn new_connection_defaults_missing_info() {
        let payload = br#"{"type":"newConnection","socketId":"s9","channel":"/chat"}"#;
        let ToBackend::NewConnection(msg) = ToBackend::decode(payload).unwrap() else {
            panic!("expected newConnection");
        };
        assert_eq!(msg.socket_id, "s9");
        assert!(msg.additional_info.is_empty());
    }

    #[test_timeout::timeout]
    fn custom_message_keeps_free_form_fields() {
        let payload = br#"{"type":"custom","kind":"reload","version":3}"#;
        let ToWorker::Custom(custom) = ToWorker::decode(payload).unwrap() else {
            panic!("expected custom");
        };
        assert_eq!(custom.fields.get("kind"), Some(&json!("reload")));
        assert_eq!(custom.fields.get("version"), Some(&json!(3)));
        assert!(custom.fields.get("type").is_none());

        let encoded = serde_json::to_value(ToWorker::Custom(custom)).unwrap();
        assert_eq!(encoded["type"], json!("custom"));
    }

    #[test_timeout::timeout]
    fn close_and_callback_expose_namespace() {
        let close = ToWorker::Close(CloseMessage {
            namespace: "/chat".into(),
        });
        assert_eq!(close.namespace(), Some("/chat"));
        assert_eq!(ToWorker::Custom(CustomMessage::default()).namespace(), None);
    }
}
