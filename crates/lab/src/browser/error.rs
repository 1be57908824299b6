//! Browser daemon error types.

use thiserror::Error;

/// Result type for daemon controller operations.
pub type BrowserResult<T> = Result<T, BrowserError>;

/// Errors from the browser daemon controller and orchestrator.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to start browser daemon for session {session_id}: {detail}")]
    DaemonStartFailed { session_id: String, detail: String },

    #[error("failed to stop browser daemon for session {session_id}: {detail}")]
    DaemonStopFailed { session_id: String, detail: String },

    #[error("navigation to {url} failed for session {session_id}: {detail}")]
    NavigationFailed {
        session_id: String,
        url: String,
        detail: String,
    },

    /// Transport failures and schema-invalid replies.
    #[error("browser daemon connection failed for session {session_id}: {detail}")]
    ConnectionFailed { session_id: String, detail: String },

    #[error("browser state storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error(transparent)]
    Port(#[from] crate::ports::PortError),
}

impl BrowserError {
    /// Wrap a schema-mismatch reply the way every controller call does.
    pub fn invalid_response(session_id: &str, detail: impl std::fmt::Display) -> Self {
        BrowserError::ConnectionFailed {
            session_id: session_id.to_string(),
            detail: format!("Invalid response format: {}", detail),
        }
    }
}
