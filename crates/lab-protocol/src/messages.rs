//! Client/server message envelopes for the bus WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deltas::Delta;

/// Messages sent from the client to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to a resolved channel path.
    Subscribe { channel: String },
    /// Unsubscribe from a resolved channel path.
    Unsubscribe { channel: String },
    /// A client event for a channel the socket is subscribed to.
    Event { channel: String, data: Value },
    /// Keepalive.
    Ping,
}

/// Messages sent from the bus to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Initial channel state, sent exactly once per subscription before
    /// any delta for that channel.
    Snapshot { channel: String, data: Value },
    /// Incremental update to a channel's snapshot.
    Delta { channel: String, data: Delta },
    /// Server-originated event on a channel.
    Event { channel: String, data: Value },
    /// Per-channel error (unauthorized, not subscribed, load failure).
    Error { channel: String, error: String },
    /// Keepalive reply.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_round_trips() {
        let raw = r#"{"type":"subscribe","channel":"sessions"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { ref channel } if channel == "sessions"));
    }

    #[test]
    fn snapshot_serializes_with_lowercase_tag() {
        let msg = ServerMessage::Snapshot {
            channel: "projects".to_string(),
            data: json!([]),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["channel"], "projects");
    }

    #[test]
    fn ping_needs_no_fields() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }
}
