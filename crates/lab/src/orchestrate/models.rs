//! Orchestration request models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of an orchestration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    Pending,
    Thinking,
    Delegating,
    Starting,
    Complete,
    Error,
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationStatus::Pending => write!(f, "pending"),
            OrchestrationStatus::Thinking => write!(f, "thinking"),
            OrchestrationStatus::Delegating => write!(f, "delegating"),
            OrchestrationStatus::Starting => write!(f, "starting"),
            OrchestrationStatus::Complete => write!(f, "complete"),
            OrchestrationStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for OrchestrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrchestrationStatus::Pending),
            "thinking" => Ok(OrchestrationStatus::Thinking),
            "delegating" => Ok(OrchestrationStatus::Delegating),
            "starting" => Ok(OrchestrationStatus::Starting),
            "complete" => Ok(OrchestrationStatus::Complete),
            "error" => Ok(OrchestrationStatus::Error),
            other => Err(format!("unknown orchestration status: {}", other)),
        }
    }
}

impl TryFrom<String> for OrchestrationStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// One orchestration request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRequest {
    pub id: String,
    pub channel_id: Option<String>,
    pub content: String,
    #[sqlx(try_from = "String")]
    pub status: OrchestrationStatus,
    pub resolved_project_id: Option<String>,
    pub resolved_session_id: Option<String>,
    pub model_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Body of `POST /orchestrate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateRequest {
    pub content: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

/// Immediate reply to `POST /orchestrate`; resolution arrives over the
/// `orchestrationStatus/{uuid}` channel or the SSE replay endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateResponse {
    pub orchestration_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
