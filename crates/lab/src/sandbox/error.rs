//! Sandbox provider error types.

use thiserror::Error;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors surfaced by the sandbox provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider command failed.
    #[error("provider {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Network was not found.
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    /// Failed to parse provider output.
    #[error("failed to parse provider output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation exceeded its deadline.
    #[error("provider {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::CommandFailed { .. } => "command_failed",
            ProviderError::ContainerNotFound(_) => "container_not_found",
            ProviderError::NetworkNotFound(_) => "network_not_found",
            ProviderError::ParseError(_) => "parse_error",
            ProviderError::InvalidInput(_) => "invalid_input",
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Io(_) => "io",
        }
    }
}
