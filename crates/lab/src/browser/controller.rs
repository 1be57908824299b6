//! Daemon controller: the seam to the external browser-daemon HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{BrowserError, BrowserResult};

/// Hard cap on controller calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Status reply from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub ready: bool,
    pub port: u16,
}

/// Reply from a `start` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReply {
    pub port: u16,
}

/// Typed result envelope for pass-through commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Control surface for per-session browser daemons.
#[async_trait]
pub trait DaemonController: Send + Sync {
    /// Start the daemon for a session on `stream_port`, optionally
    /// restoring `url`.
    async fn start(
        &self,
        session_id: &str,
        stream_port: u16,
        url: Option<&str>,
    ) -> BrowserResult<StartReply>;

    /// Stop the daemon. Idempotent: a missing daemon is success.
    async fn stop(&self, session_id: &str) -> BrowserResult<()>;

    async fn navigate(&self, session_id: &str, url: &str) -> BrowserResult<()>;

    /// Daemon status; `None` when no daemon exists for the session.
    async fn get_status(&self, session_id: &str) -> BrowserResult<Option<DaemonStatus>>;

    async fn get_current_url(&self, session_id: &str) -> BrowserResult<Option<String>>;

    /// Mark the viewport active (lazy materialization on first view).
    async fn launch(&self, session_id: &str) -> BrowserResult<()>;

    async fn is_healthy(&self) -> bool;

    /// Opaque command pass-through with a typed result envelope.
    async fn execute_command(&self, session_id: &str, command: Value)
        -> BrowserResult<CommandReply>;
}

/// HTTP implementation over the daemon's REST API.
#[derive(Debug, Clone)]
pub struct HttpDaemonController {
    client: Client,
    base_url: String,
}

impl HttpDaemonController {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .expect("building daemon HTTP client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn transport_error(session_id: &str, e: reqwest::Error) -> BrowserError {
        BrowserError::ConnectionFailed {
            session_id: session_id.to_string(),
            detail: e.to_string(),
        }
    }

    /// Decode a JSON reply against its schema; mismatches surface as
    /// connection failures with the offending detail.
    async fn decode<T: serde::de::DeserializeOwned>(
        session_id: &str,
        response: reqwest::Response,
    ) -> BrowserResult<T> {
        let body = response
            .text()
            .await
            .map_err(|e| Self::transport_error(session_id, e))?;
        serde_json::from_str(&body).map_err(|e| BrowserError::invalid_response(session_id, e))
    }
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    stream_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CurrentUrlReply {
    url: Option<String>,
}

#[async_trait]
impl DaemonController for HttpDaemonController {
    async fn start(
        &self,
        session_id: &str,
        stream_port: u16,
        url: Option<&str>,
    ) -> BrowserResult<StartReply> {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{}/start", session_id)))
            .json(&StartRequest { stream_port, url })
            .send()
            .await
            .map_err(|e| BrowserError::DaemonStartFailed {
                session_id: session_id.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BrowserError::DaemonStartFailed {
                session_id: session_id.to_string(),
                detail: format!("{}: {}", status, detail),
            });
        }

        Self::decode(session_id, response).await
    }

    async fn stop(&self, session_id: &str) -> BrowserResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{}/stop", session_id)))
            .send()
            .await
            .map_err(|e| BrowserError::DaemonStopFailed {
                session_id: session_id.to_string(),
                detail: e.to_string(),
            })?;

        // A daemon that is already gone counts as stopped.
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        Err(BrowserError::DaemonStopFailed {
            session_id: session_id.to_string(),
            detail: format!("{}: {}", status, detail),
        })
    }

    async fn navigate(&self, session_id: &str, url: &str) -> BrowserResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{}/navigate", session_id)))
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|e| BrowserError::NavigationFailed {
                session_id: session_id.to_string(),
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BrowserError::NavigationFailed {
                session_id: session_id.to_string(),
                url: url.to_string(),
                detail: format!("{}: {}", status, detail),
            });
        }

        Ok(())
    }

    async fn get_status(&self, session_id: &str) -> BrowserResult<Option<DaemonStatus>> {
        let response = self
            .client
            .get(self.url(&format!("/sessions/{}/status", session_id)))
            .send()
            .await
            .map_err(|e| Self::transport_error(session_id, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BrowserError::ConnectionFailed {
                session_id: session_id.to_string(),
                detail: format!("status endpoint returned {}", response.status()),
            });
        }

        Ok(Some(Self::decode(session_id, response).await?))
    }

    async fn get_current_url(&self, session_id: &str) -> BrowserResult<Option<String>> {
        let response = self
            .client
            .get(self.url(&format!("/sessions/{}/url", session_id)))
            .send()
            .await
            .map_err(|e| Self::transport_error(session_id, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BrowserError::ConnectionFailed {
                session_id: session_id.to_string(),
                detail: format!("url endpoint returned {}", response.status()),
            });
        }

        let reply: CurrentUrlReply = Self::decode(session_id, response).await?;
        Ok(reply.url)
    }

    async fn launch(&self, session_id: &str) -> BrowserResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{}/launch", session_id)))
            .send()
            .await
            .map_err(|e| Self::transport_error(session_id, e))?;

        if !response.status().is_success() {
            return Err(BrowserError::ConnectionFailed {
                session_id: session_id.to_string(),
                detail: format!("launch endpoint returned {}", response.status()),
            });
        }

        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn execute_command(
        &self,
        session_id: &str,
        command: Value,
    ) -> BrowserResult<CommandReply> {
        let response = self
            .client
            .post(self.url(&format!("/sessions/{}/command", session_id)))
            .json(&command)
            .send()
            .await
            .map_err(|e| Self::transport_error(session_id, e))?;

        if !response.status().is_success() {
            return Err(BrowserError::ConnectionFailed {
                session_id: session_id.to_string(),
                detail: format!("command endpoint returned {}", response.status()),
            });
        }

        Self::decode(session_id, response).await
    }
}
