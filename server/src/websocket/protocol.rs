//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names.

use harmony_engine::Harmonic;
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Limit pushed harmonics to these collections (all when empty).
    Subscribe {
        #[serde(default)]
        collections: Vec<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A change confirmed by the server.
    Harmonic { harmonic: Harmonic },

    /// Acknowledges a subscription.
    Subscribed { collections: Vec<String> },

    /// Response to ping.
    Pong,

    /// Error message.
    Error { message: String },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harmony_engine::DeltaOperation;
    use serde_json::json;

    #[test]
    fn test_client_message_deserialization() {
        let json = r#"{"type": "subscribe", "collections": ["todos"]}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Subscribe { collections } => assert_eq!(collections, vec!["todos"]),
            _ => panic!("Expected Subscribe message"),
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

        let msg = ServerMessage::error("test error");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"test error""#));

        let harmonic = Harmonic::new(3u64, "todos", DeltaOperation::Create, "a", Some(&json!({"id": "a"})));
        let value = serde_json::to_value(ServerMessage::Harmonic { harmonic }).unwrap();
        assert_eq!(value["type"], "harmonic");
        assert_eq!(value["harmonic"]["id"], 3);
        assert_eq!(value["harmonic"]["table_name"], "todos");
    }
}
