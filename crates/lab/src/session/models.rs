//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Containers are being provisioned.
    Creating,
    /// Pre-provisioned and claimable; no title, no user messages yet.
    Pooled,
    /// Cluster is up.
    Running,
    /// Teardown in progress.
    Deleting,
    /// Provisioning failed.
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Creating => write!(f, "creating"),
            SessionStatus::Pooled => write!(f, "pooled"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Deleting => write!(f, "deleting"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(SessionStatus::Creating),
            "pooled" => Ok(SessionStatus::Pooled),
            "running" => Ok(SessionStatus::Running),
            "deleting" => Ok(SessionStatus::Deleting),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// One user-request execution environment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub title: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Id assigned by the agent sub-process once it attaches.
    pub agent_session_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    /// The session's dedicated network name.
    pub fn network_name(&self) -> String {
        network_name(&self.id)
    }
}

/// Network name for a session id.
pub fn network_name(session_id: &str) -> String {
    format!("lab-{}", session_id)
}

/// Container status within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Starting => write!(f, "starting"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ContainerStatus::Starting),
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "error" => Ok(ContainerStatus::Error),
            other => Err(format!("unknown container status: {}", other)),
        }
    }
}

impl TryFrom<String> for ContainerStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A container instance belonging to a session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionContainer {
    pub id: String,
    pub session_id: String,
    /// The container definition this instance was created from.
    pub container_id: String,
    /// Provider runtime id once created.
    pub runtime_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ContainerStatus,
    pub hostname: String,
    pub error_message: Option<String>,
}

/// Deterministic hostname for a session container: `s-<sess8>-<def8>`.
pub fn container_hostname(session_id: &str, definition_id: &str) -> String {
    let sess: String = session_id.chars().filter(|c| *c != '-').take(8).collect();
    let def: String = definition_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("s-{}-{}", sess, def)
}

/// Request body for `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub project_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub initial_message: Option<String>,
}

/// Request body for `PATCH /sessions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub agent_session_id: Option<String>,
}

/// Session plus its containers, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: Session,
    pub containers: Vec<SessionContainer>,
    pub urls: Vec<crate::proxy::RouteInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_uses_eight_chars_of_each_id() {
        let hostname = container_hostname(
            "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0",
            "11223344-5566-7788-99aa-bbccddeeff00",
        );
        assert_eq!(hostname, "s-0f1e2d3c-11223344");
    }

    #[test]
    fn network_name_prefixes_session_id() {
        assert_eq!(network_name("abc"), "lab-abc");
    }

    #[test]
    fn status_round_trips() {
        for status in [
            SessionStatus::Creating,
            SessionStatus::Pooled,
            SessionStatus::Running,
            SessionStatus::Deleting,
            SessionStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
    }
}
