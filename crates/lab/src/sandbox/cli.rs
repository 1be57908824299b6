//! Docker-compatible CLI implementation of the sandbox provider.
//!
//! Drives the `docker` binary (or any drop-in such as podman with the
//! docker CLI shim) with JSON `--format` output. `SANDBOX_ENDPOINT` is
//! forwarded as `DOCKER_HOST` so the same binary can target a remote
//! daemon.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::error::{ProviderError, ProviderResult};
use super::events::RawEvent;
use super::spec::{validate_name, validate_runtime_id, ContainerInspect, ContainerSpec};
use super::{EventStream, SandboxProvider};

/// Hard cap on any single provider call.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer for the event stream channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// CLI-backed sandbox provider.
#[derive(Debug, Clone)]
pub struct CliSandbox {
    /// Path to the CLI binary.
    binary: String,
    /// Optional DOCKER_HOST endpoint.
    endpoint: Option<String>,
}

impl CliSandbox {
    /// Create a provider targeting the local daemon.
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            endpoint,
        }
    }

    /// Create a provider with a custom binary path.
    pub fn with_binary(binary: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            endpoint,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(ref endpoint) = self.endpoint {
            cmd.env("DOCKER_HOST", endpoint);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    /// Run a CLI invocation, enforcing the call timeout.
    async fn run(&self, name: &'static str, args: &[String]) -> ProviderResult<String> {
        let mut cmd = self.command();
        cmd.args(args);

        let output = tokio::time::timeout(CALL_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ProviderError::Timeout {
                command: name.to_string(),
                seconds: CALL_TIMEOUT.as_secs(),
            })?
            .map_err(|e| ProviderError::CommandFailed {
                command: name.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::CommandFailed {
                command: name.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check the provider is reachable; returns the version string.
    pub async fn health_check(&self) -> ProviderResult<String> {
        let out = self
            .run("version", &["version".to_string(), "--format".to_string(), "json".to_string()])
            .await?;
        Ok(out.trim().to_string())
    }
}

/// Subset of `inspect` output the core reads.
#[derive(Debug, Deserialize)]
struct RawInspect {
    #[serde(rename = "State", default)]
    state: RawState,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: RawNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
struct RawState {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<RawPortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct RawPortBinding {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

fn parse_inspect(raw: &str) -> ProviderResult<ContainerInspect> {
    let parsed: Vec<RawInspect> =
        serde_json::from_str(raw).map_err(|e| ProviderError::ParseError(e.to_string()))?;
    let first = parsed
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ParseError("empty inspect output".to_string()))?;

    let mut ports = HashMap::new();
    for (key, bindings) in first.network_settings.ports {
        // Keys look like "3000/tcp".
        let Some(container_port) = key
            .split('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let Some(host_port) = bindings
            .unwrap_or_default()
            .first()
            .and_then(|b| b.host_port.parse::<u16>().ok())
        else {
            continue;
        };
        ports.insert(container_port, host_port);
    }

    Ok(ContainerInspect {
        state: first.state.status,
        ports,
    })
}

#[async_trait]
impl SandboxProvider for CliSandbox {
    async fn create_container(&self, spec: &ContainerSpec) -> ProviderResult<String> {
        spec.validate()?;

        let mut args: Vec<String> = vec!["create".to_string()];

        if let Some(ref name) = spec.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        if let Some(ref hostname) = spec.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }
        if let Some(ref network) = spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(restart) = spec.restart {
            args.push("--restart".to_string());
            args.push(format!("on-failure:{}", restart.max_retries));
        }
        for mapping in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", mapping.host_port, mapping.container_port));
        }
        for (source, target) in &spec.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", source, target));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(ref workdir) = spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let out = self.run("create", &args).await?;
        Ok(out.trim().to_string())
    }

    async fn start_container(&self, runtime_id: &str) -> ProviderResult<()> {
        validate_runtime_id(runtime_id)?;
        self.run("start", &["start".to_string(), runtime_id.to_string()])
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        runtime_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ProviderResult<()> {
        validate_runtime_id(runtime_id)?;
        let mut args = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(runtime_id.to_string());
        self.run("stop", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, runtime_id: &str, force: bool) -> ProviderResult<()> {
        validate_runtime_id(runtime_id)?;
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(runtime_id.to_string());
        self.run("rm", &args).await?;
        Ok(())
    }

    async fn inspect(&self, runtime_id: &str) -> ProviderResult<Option<ContainerInspect>> {
        validate_runtime_id(runtime_id)?;
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "json".to_string(),
            runtime_id.to_string(),
        ];
        match self.run("inspect", &args).await {
            Ok(out) => Ok(Some(parse_inspect(&out)?)),
            // Missing containers are not an error; callers treat as gone.
            Err(ProviderError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn container_exists(&self, runtime_id: &str) -> ProviderResult<bool> {
        Ok(self.inspect(runtime_id).await?.is_some())
    }

    async fn create_network(&self, name: &str) -> ProviderResult<()> {
        validate_name(name, "network name")?;
        match self
            .run("network create", &["network".to_string(), "create".to_string(), name.to_string()])
            .await
        {
            Ok(_) => Ok(()),
            // Recreating an existing network is fine for idempotent callers.
            Err(ProviderError::CommandFailed { ref message, .. })
                if message.contains("already exists") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_network(&self, name: &str) -> ProviderResult<()> {
        validate_name(name, "network name")?;
        match self
            .run("network rm", &["network".to_string(), "rm".to_string(), name.to_string()])
            .await
        {
            Ok(_) => Ok(()),
            Err(ProviderError::CommandFailed { ref message, .. })
                if message.contains("not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn connect_network(
        &self,
        runtime_id: &str,
        network: &str,
        aliases: &[String],
    ) -> ProviderResult<()> {
        validate_runtime_id(runtime_id)?;
        validate_name(network, "network name")?;

        let mut args = vec!["network".to_string(), "connect".to_string()];
        for alias in aliases {
            validate_name(alias, "network alias")?;
            args.push("--alias".to_string());
            args.push(alias.clone());
        }
        args.push(network.to_string());
        args.push(runtime_id.to_string());
        self.run("network connect", &args).await?;
        Ok(())
    }

    async fn disconnect_network(&self, runtime_id: &str, network: &str) -> ProviderResult<()> {
        validate_runtime_id(runtime_id)?;
        validate_name(network, "network name")?;
        match self
            .run(
                "network disconnect",
                &[
                    "network".to_string(),
                    "disconnect".to_string(),
                    network.to_string(),
                    runtime_id.to_string(),
                ],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(ProviderError::CommandFailed { ref message, .. })
                if message.contains("is not connected") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn is_connected(&self, runtime_id: &str, network: &str) -> ProviderResult<bool> {
        validate_runtime_id(runtime_id)?;
        validate_name(network, "network name")?;
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            format!("{{{{json .NetworkSettings.Networks.{}}}}}", network),
            runtime_id.to_string(),
        ];
        match self.run("inspect", &args).await {
            Ok(out) => Ok(out.trim() != "null" && !out.trim().is_empty()),
            Err(ProviderError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_volume(&self, name: &str) -> ProviderResult<()> {
        validate_name(name, "volume name")?;
        self.run(
            "volume create",
            &["volume".to_string(), "create".to_string(), name.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ProviderResult<()> {
        validate_name(name, "volume name")?;
        match self
            .run("volume rm", &["volume".to_string(), "rm".to_string(), name.to_string()])
            .await
        {
            Ok(_) => Ok(()),
            Err(ProviderError::CommandFailed { ref message, .. })
                if message.contains("no such volume") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stream_events(&self, label: &str) -> ProviderResult<EventStream> {
        let filter = format!("label={}", label);
        let mut cmd = self.command();
        cmd.args(["events", "--format", "{{json .}}", "--filter", filter.as_str()]);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProviderError::CommandFailed {
            command: "events".to_string(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ProviderError::CommandFailed {
                command: "events".to_string(),
                message: "no stdout handle".to_string(),
            }
        })?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event = match serde_json::from_str::<RawEvent>(&line) {
                            Ok(raw) => raw.into_event(),
                            Err(e) => {
                                warn!("Unparseable provider event line: {}", e);
                                continue;
                            }
                        };
                        if let Some(event) = event {
                            if tx.send(event).await.is_err() {
                                // Receiver gone; kill_on_drop reaps the child.
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Provider event stream read error: {}", e);
                        break;
                    }
                }
            }
            debug!("Provider event stream closed");
            let _ = child.kill().await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_output_parses_state_and_ports() {
        let raw = r#"[{"State":{"Status":"running"},"NetworkSettings":{"Ports":{"3000/tcp":[{"HostIp":"0.0.0.0","HostPort":"41820"}],"9229/tcp":null}}}]"#;
        let inspect = parse_inspect(raw).unwrap();
        assert_eq!(inspect.state, "running");
        assert_eq!(inspect.ports.get(&3000), Some(&41820));
        assert!(!inspect.ports.contains_key(&9229));
    }

    #[test]
    fn empty_inspect_is_a_parse_error() {
        assert!(matches!(
            parse_inspect("[]"),
            Err(ProviderError::ParseError(_))
        ));
    }
}
