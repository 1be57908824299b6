//! Server configuration.
//!
//! Settings are layered: defaults, then an optional TOML file, then
//! environment variables (`API_PORT`, `PROXY_BASE_DOMAIN`, ...). The
//! environment names intentionally match the deployment contract, so no
//! prefix is applied.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// Default idle timeout for proxied connections.
const DEFAULT_PROXY_IDLE_TIMEOUT_SECS: u64 = 255;

/// Top-level server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Port for the JSON API and bus WebSocket.
    pub api_port: u16,
    /// Port for the subdomain proxy listener.
    pub proxy_port: u16,
    /// Base domain the proxy parses subdomains against (e.g. "lab.test").
    pub proxy_base_domain: String,
    /// Idle timeout for proxied connections, seconds.
    pub proxy_idle_timeout_secs: u64,
    /// Base URL of the browser daemon HTTP API.
    pub browser_api_url: String,
    /// Host clients use to reach browser stream WebSockets.
    pub browser_ws_host: String,
    /// Debounce before a viewerless browser is marked undesired, ms.
    pub browser_cleanup_delay_ms: u64,
    /// Browser reconcile tick interval, ms.
    pub reconcile_interval_ms: u64,
    /// Start attempts before a browser session is parked in error.
    pub max_daemon_retries: u32,
    /// Stream port range, "lo-hi" inclusive.
    pub stream_port_range: String,
    /// SQLite database location (path or sqlite:// URL).
    pub database_url: String,
    /// Docker-compatible endpoint handed to the sandbox CLI (DOCKER_HOST).
    pub sandbox_endpoint: Option<String>,
    /// Shared volume names every session cluster mounts.
    pub shared_volumes: Vec<String>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            api_port: 4100,
            proxy_port: 4180,
            proxy_base_domain: "localhost".to_string(),
            proxy_idle_timeout_secs: DEFAULT_PROXY_IDLE_TIMEOUT_SECS,
            browser_api_url: "http://localhost:9222".to_string(),
            browser_ws_host: "localhost".to_string(),
            browser_cleanup_delay_ms: 10_000,
            reconcile_interval_ms: 5_000,
            max_daemon_retries: 3,
            stream_port_range: "9300-9500".to_string(),
            database_url: "./data/lab.db".to_string(),
            sandbox_endpoint: None,
            shared_volumes: vec![
                "workspaces".to_string(),
                "opencode-auth".to_string(),
                "browser-socket".to_string(),
            ],
        }
    }
}

impl LabConfig {
    /// Load settings from an optional file plus the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        // Bare names on purpose: API_PORT, DATABASE_URL, ... are the
        // deployment contract.
        builder = builder.add_source(Environment::default().try_parsing(true));

        let settings: LabConfig = builder
            .build()
            .context("assembling configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        self.stream_port_bounds()?;
        if self.proxy_base_domain.is_empty() {
            anyhow::bail!("PROXY_BASE_DOMAIN must not be empty");
        }
        Ok(())
    }

    /// Parse `STREAM_PORT_RANGE` ("9300-9500") into inclusive bounds.
    pub fn stream_port_bounds(&self) -> Result<(u16, u16)> {
        let (lo, hi) = self
            .stream_port_range
            .split_once('-')
            .with_context(|| format!("STREAM_PORT_RANGE must be lo-hi: {}", self.stream_port_range))?;
        let lo: u16 = lo.trim().parse().context("parsing stream port range low bound")?;
        let hi: u16 = hi.trim().parse().context("parsing stream port range high bound")?;
        if lo > hi {
            anyhow::bail!("STREAM_PORT_RANGE is inverted: {}-{}", lo, hi);
        }
        Ok((lo, hi))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn browser_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.browser_cleanup_delay_ms)
    }

    pub fn proxy_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stream_range_parses() {
        let config = LabConfig::default();
        assert_eq!(config.stream_port_bounds().unwrap(), (9300, 9500));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let config = LabConfig {
            stream_port_range: "9500-9300".to_string(),
            ..Default::default()
        };
        assert!(config.stream_port_bounds().is_err());
    }
}
