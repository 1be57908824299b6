//! Sandbox provider interface and its CLI-backed implementation.
//!
//! The core never talks to the container runtime directly; everything goes
//! through [`SandboxProvider`] so tests can substitute a fake and the
//! production binary can point at any Docker-compatible endpoint.

mod cli;
mod error;
mod events;
mod spec;

pub use cli::CliSandbox;
pub use error::{ProviderError, ProviderResult};
pub use events::ProviderEvent;
pub use spec::{ContainerInspect, ContainerSpec, PortMapping, RestartPolicy};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

/// Label attached to every container the orchestrator creates; the event
/// monitor filters on it.
pub const SESSION_LABEL: &str = "lab.session";

/// Label carrying the owning project id.
pub const PROJECT_LABEL: &str = "lab.project";

/// Label carrying the container definition id.
pub const CONTAINER_LABEL: &str = "lab.container";

/// Stream of normalized provider events.
pub type EventStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Capabilities the core consumes from the container runtime.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a container; returns the runtime id. The container is not
    /// started.
    async fn create_container(&self, spec: &ContainerSpec) -> ProviderResult<String>;

    async fn start_container(&self, runtime_id: &str) -> ProviderResult<()>;

    async fn stop_container(
        &self,
        runtime_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ProviderResult<()>;

    async fn remove_container(&self, runtime_id: &str, force: bool) -> ProviderResult<()>;

    /// Inspect a container. `Ok(None)` when it does not exist.
    async fn inspect(&self, runtime_id: &str) -> ProviderResult<Option<ContainerInspect>>;

    async fn container_exists(&self, runtime_id: &str) -> ProviderResult<bool>;

    async fn create_network(&self, name: &str) -> ProviderResult<()>;

    async fn remove_network(&self, name: &str) -> ProviderResult<()>;

    /// Connect a container to a network with DNS aliases.
    async fn connect_network(
        &self,
        runtime_id: &str,
        network: &str,
        aliases: &[String],
    ) -> ProviderResult<()>;

    async fn disconnect_network(&self, runtime_id: &str, network: &str) -> ProviderResult<()>;

    async fn is_connected(&self, runtime_id: &str, network: &str) -> ProviderResult<bool>;

    async fn create_volume(&self, name: &str) -> ProviderResult<()>;

    async fn remove_volume(&self, name: &str) -> ProviderResult<()>;

    /// Open the provider's container event stream, filtered to containers
    /// carrying `label`. The stream ends when the provider connection
    /// drops; the caller reconnects.
    async fn stream_events(&self, label: &str) -> ProviderResult<EventStream>;
}
