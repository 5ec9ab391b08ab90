//! Frames exchanged between a client and its edge worker over the websocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// `event` stays untyped so a non-string name can be reported instead of
    /// failing the whole frame.
    Event {
        event: Value,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    /// Reply to a server event that carried an ack id.
    Ack {
        ack_id: u64,
        #[serde(default)]
        args: Vec<Value>,
    },
}

/// Edge → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Connected {
        socket_id: String,
    },
    Event {
        event: String,
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    Ack {
        ack_id: u64,
        args: Vec<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn client_event_with_ack_parses() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"event","event":"ping","args":[],"ackId":1}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Event {
                event: json!("ping"),
                args: vec![],
                ack_id: Some(1),
            }
        );
    }

    #[test_timeout::timeout]
    fn non_string_event_name_still_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"event","event":42}"#).unwrap();
        let ClientFrame::Event { event, args, ack_id } = frame else {
            panic!("expected event frame");
        };
        assert!(event.as_str().is_none());
        assert!(args.is_empty());
        assert!(ack_id.is_none());
    }

    #[test_timeout::timeout]
    fn server_ack_shape() {
        let frame = ServerFrame::Ack {
            ack_id: 3,
            args: vec![json!("pong")],
        };
        assert_eq!(
            serde_json::to_value(frame).unwrap(),
            json!({"type": "ack", "ackId": 3, "args": ["pong"]})
        );
    }
}
