//! Container specifications and input validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{ProviderError, ProviderResult};

/// Restart policy applied to session containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Maximum restart attempts before the runtime gives up.
    pub max_retries: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Port mapping for containers that publish ports on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
    /// Protocol (tcp or udp).
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: default_protocol(),
        }
    }
}

/// Specification for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: Option<String>,
    /// Container hostname.
    pub hostname: Option<String>,
    /// OCI image to use.
    pub image: String,
    /// Command to run (empty keeps the image default).
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Labels for the container.
    pub labels: HashMap<String, String>,
    /// Ports published on the host.
    pub ports: Vec<PortMapping>,
    /// Volume mounts (volume name or host path -> container path).
    pub volumes: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Network to start the container on.
    pub network: Option<String>,
    /// Restart policy (on-failure) if set.
    pub restart: Option<RestartPolicy>,
}

impl ContainerSpec {
    /// Create a new spec with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all spec fields.
    ///
    /// Called before every create to keep malformed or hostile values out
    /// of the provider command line.
    pub fn validate(&self) -> ProviderResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_name(name, "container name")?;
        }
        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        for key in self.labels.keys() {
            validate_label_key(key)?;
        }
        for (source, target) in &self.volumes {
            validate_volume_source(source)?;
            validate_container_path(target)?;
        }
        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }
        if let Some(ref network) = self.network {
            validate_name(network, "network name")?;
        }

        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn volume(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push((source.into(), target.into()));
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }
}

/// Inspect result for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspect {
    /// Runtime state string ("running", "exited", ...).
    pub state: String,
    /// Published ports, container port -> host port.
    pub ports: HashMap<u16, u16>,
}

/// Validate a container ID or name.
///
/// Runtime IDs are hex strings; names are alphanumeric with `-` and `_`.
pub(crate) fn validate_runtime_id(id: &str) -> ProviderResult<()> {
    if id.is_empty() {
        return Err(ProviderError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }
    if id.len() > 128 {
        return Err(ProviderError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ProviderError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }
    Ok(())
}

pub(crate) fn validate_image_name(image: &str) -> ProviderResult<()> {
    if image.is_empty() {
        return Err(ProviderError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(ProviderError::InvalidInput(
            "image name exceeds maximum length".to_string(),
        ));
    }
    // registry/repo:tag@sha256:... character set
    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@');
    if !image.chars().all(valid_chars) || image.starts_with('-') {
        return Err(ProviderError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str, what: &str) -> ProviderResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(ProviderError::InvalidInput(format!(
            "{} must be 1-128 characters",
            what
        )));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !name.chars().all(valid_chars) || name.starts_with('-') {
        return Err(ProviderError::InvalidInput(format!(
            "{} '{}' contains invalid characters",
            what, name
        )));
    }
    Ok(())
}

pub(crate) fn validate_hostname(hostname: &str) -> ProviderResult<()> {
    if hostname.is_empty() || hostname.len() > 63 {
        return Err(ProviderError::InvalidInput(
            "hostname must be 1-63 characters".to_string(),
        ));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-';
    if !hostname.chars().all(valid_chars)
        || hostname.starts_with('-')
        || hostname.ends_with('-')
    {
        return Err(ProviderError::InvalidInput(format!(
            "hostname '{}' is not a valid DNS label",
            hostname
        )));
    }
    Ok(())
}

pub(crate) fn validate_env_var_key(key: &str) -> ProviderResult<()> {
    if key.is_empty() {
        return Err(ProviderError::InvalidInput(
            "environment variable name cannot be empty".to_string(),
        ));
    }
    let valid = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !key.chars().next().is_some_and(|c| c.is_ascii_digit());
    if !valid {
        return Err(ProviderError::InvalidInput(format!(
            "environment variable name '{}' is invalid",
            key
        )));
    }
    Ok(())
}

pub(crate) fn validate_label_key(key: &str) -> ProviderResult<()> {
    if key.is_empty() || key.len() > 128 {
        return Err(ProviderError::InvalidInput(
            "label key must be 1-128 characters".to_string(),
        ));
    }
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !key.chars().all(valid_chars) {
        return Err(ProviderError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }
    Ok(())
}

pub(crate) fn validate_volume_source(source: &str) -> ProviderResult<()> {
    if source.is_empty() {
        return Err(ProviderError::InvalidInput(
            "volume source cannot be empty".to_string(),
        ));
    }
    if source.contains(':') {
        return Err(ProviderError::InvalidInput(format!(
            "volume source '{}' must not contain ':'",
            source
        )));
    }
    Ok(())
}

pub(crate) fn validate_container_path(path: &str) -> ProviderResult<()> {
    if !path.starts_with('/') {
        return Err(ProviderError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }
    if path.contains(':') || path.contains("..") {
        return Err(ProviderError::InvalidInput(format!(
            "container path '{}' contains invalid sequences",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_spec_passes() {
        let spec = ContainerSpec::new("registry.example.com/app:1.2")
            .name("lab-abc")
            .hostname("s-abc-def")
            .env("PORT", "3000")
            .label("lab.session", "abc")
            .volume("workspaces", "/workspaces")
            .workdir("/workspaces/abc");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_shell_metacharacters_in_image() {
        let spec = ContainerSpec::new("app:1.2; rm -rf /");
        assert!(matches!(
            spec.validate(),
            Err(ProviderError::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_relative_workdir() {
        let spec = ContainerSpec::new("app:1").workdir("workspaces/abc");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_numeric_env_key() {
        let spec = ContainerSpec::new("app:1").env("1BAD", "x");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn runtime_id_rules() {
        assert!(validate_runtime_id("abc123_def-456").is_ok());
        assert!(validate_runtime_id("").is_err());
        assert!(validate_runtime_id("bad id").is_err());
    }
}
