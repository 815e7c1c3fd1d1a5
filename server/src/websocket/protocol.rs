//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names. The
//! change payloads inside them keep the engine's camelCase shape.

use congregate_engine::{ChangeMessage, OutboundChange};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A local change to persist.
    Emit {
        /// Event name, the change type (`insert`, `update`, `delete`)
        event: String,
        payload: OutboundChange,
        /// Request ID for correlating the acknowledgment
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgment of an emitted change: the canonical record, or the
    /// error upstream hit persisting it.
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: ChangeMessage,
    },

    /// A change persisted by someone else.
    /// Sent to all connected clients except the one that made it.
    Changes {
        /// `changes.<type>`
        event: String,
        data: ChangeMessage,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        /// Error description
        message: String,
        /// Request ID from the original request (if applicable)
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Create a `changes.<type>` broadcast. The prior record only means
    /// something to the writer, so it is left out.
    pub fn changes(mut message: ChangeMessage) -> Self {
        message.prior = None;
        ServerMessage::Changes {
            event: message.kind.changes_event(),
            data: message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use congregate_engine::{ChangeType, Record};
    use serde_json::json;

    #[test]
    fn test_client_message_deserialization() {
        let json = r#"{
            "type": "emit",
            "event": "insert",
            "payload": {"type": "insert", "collection": "classes", "target": {"id": "L1", "title": "Math"}},
            "request_id": "req-1"
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Emit {
                event,
                payload,
                request_id,
            } => {
                assert_eq!(event, "insert");
                assert_eq!(payload.kind, ChangeType::Insert);
                assert_eq!(payload.target.get_str("title"), Some("Math"));
                assert_eq!(request_id, Some("req-1".to_string()));
            }
            _ => panic!("Expected Emit message"),
        }

        let json = r#"{"type": "ping"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::Pong;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let msg = ServerMessage::error("test error", Some("req-1".to_string()));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"test error""#));
        assert!(json.contains(r#""request_id":"req-1""#));
    }

    #[test]
    fn test_changes_broadcast_drops_prior() {
        let message = ChangeMessage::new(
            ChangeType::Insert,
            "classes",
            Record::new().with("id", "C1"),
        )
        .with_prior(Record::new().with("id", "L1"));

        let value = serde_json::to_value(ServerMessage::changes(message)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "changes",
                "event": "changes.insert",
                "data": {"type": "insert", "collection": "classes", "record": {"id": "C1"}}
            })
        );
    }
}
