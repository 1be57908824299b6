//! Typed payloads for client events on specific channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client event on `sessionTyping/{uuid}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetTypingEvent {
    SetTyping { user_id: String, typing: bool },
}

/// Client event on `sessionBrowserInput/{uuid}`.
///
/// The command payload is opaque to the bus; it is handed to the browser
/// daemon controller as-is and the typed result envelope comes back on the
/// same channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserInputEvent {
    /// Client-chosen correlation id, echoed in the result.
    pub id: String,
    /// Daemon command payload.
    pub command: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_typing_parses() {
        let raw = r#"{"type":"set_typing","user_id":"u1","typing":true}"#;
        let event: SetTypingEvent = serde_json::from_str(raw).unwrap();
        let SetTypingEvent::SetTyping { user_id, typing } = event;
        assert_eq!(user_id, "u1");
        assert!(typing);
    }
}
