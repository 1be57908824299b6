//! Append-only per-session agent event log.
//!
//! Everything the agent sub-process surfaces (messages, tasks, branches,
//! links, file diffs, ACP events, completion) lands here as one ordered
//! stream; the channel read models are projections over it. Events carry a
//! `kind` discriminator in their JSON payload. The log is append-only and
//! never truncated.

mod repository;

pub use repository::{AgentEvent, AgentEventRepository};

use serde_json::{json, Value};

/// Well-known event kinds the read models project.
pub mod kind {
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_FRAGMENT: &str = "message_fragment";
    pub const QUESTION_REQUEST: &str = "question_request";
    pub const TASK: &str = "task";
    pub const BRANCH: &str = "branch";
    pub const LINK: &str = "link";
    pub const FILE_DIFF: &str = "file_diff";
    pub const ACP: &str = "acp";
    pub const SESSION_COMPLETE: &str = "session_complete";
}

/// Build a user message event payload.
pub fn user_message(message_id: &str, text: &str) -> Value {
    json!({
        "kind": kind::MESSAGE,
        "id": message_id,
        "role": "user",
        "text": text,
    })
}

/// Build a session-complete event payload.
pub fn session_complete() -> Value {
    json!({ "kind": kind::SESSION_COMPLETE })
}
