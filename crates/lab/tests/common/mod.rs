//! Test utilities and common setup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use lab::api::{create_router, AppState};
use lab::browser::{
    BrowserError, BrowserOrchestrator, BrowserOrchestratorConfig, BrowserResult,
    BrowserStateRepository, CommandReply, DaemonController, DaemonStatus, StartReply,
};
use lab::bus::ChannelBus;
use lab::config::LabConfig;
use lab::db::Database;
use lab::events::AgentEventRepository;
use lab::github::GithubSettingsRepository;
use lab::logs::LogRegistry;
use lab::orchestrate::{OrchestrationRepository, OrchestrationService};
use lab::ports::{PortAllocator, PortReservationRepository};
use lab::project::ProjectRepository;
use lab::proxy::RouteTable;
use lab::sandbox::{
    ContainerInspect, ContainerSpec, EventStream, ProviderEvent, ProviderResult, SandboxProvider,
};
use lab::session::{SessionRepository, SessionService};
use lab::typing::TypingRegistry;

/// In-memory sandbox provider for tests.
///
/// Containers, networks, and volumes live in maps; `emit_event` feeds the
/// event stream the monitor consumes.
#[derive(Default)]
pub struct FakeSandbox {
    next_id: std::sync::atomic::AtomicUsize,
    pub containers: DashMap<String, String>,
    pub networks: DashMap<String, ()>,
    pub volumes: DashMap<String, ()>,
    event_txs: DashMap<usize, mpsc::Sender<ProviderEvent>>,
}

impl FakeSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a provider event into every open event stream.
    pub async fn emit_event(&self, event: ProviderEvent) {
        for tx in self.event_txs.iter() {
            let _ = tx.value().send(event.clone()).await;
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create_container(&self, spec: &ContainerSpec) -> ProviderResult<String> {
        spec.validate()?;
        let id = format!(
            "rt-{:08x}",
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        );
        self.containers.insert(id.clone(), "created".to_string());
        Ok(id)
    }

    async fn start_container(&self, runtime_id: &str) -> ProviderResult<()> {
        self.containers
            .insert(runtime_id.to_string(), "running".to_string());
        Ok(())
    }

    async fn stop_container(
        &self,
        runtime_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ProviderResult<()> {
        self.containers
            .insert(runtime_id.to_string(), "exited".to_string());
        Ok(())
    }

    async fn remove_container(&self, runtime_id: &str, _force: bool) -> ProviderResult<()> {
        self.containers.remove(runtime_id);
        Ok(())
    }

    async fn inspect(&self, runtime_id: &str) -> ProviderResult<Option<ContainerInspect>> {
        Ok(self.containers.get(runtime_id).map(|state| ContainerInspect {
            state: state.clone(),
            ports: HashMap::new(),
        }))
    }

    async fn container_exists(&self, runtime_id: &str) -> ProviderResult<bool> {
        Ok(self.containers.contains_key(runtime_id))
    }

    async fn create_network(&self, name: &str) -> ProviderResult<()> {
        self.networks.insert(name.to_string(), ());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> ProviderResult<()> {
        self.networks.remove(name);
        Ok(())
    }

    async fn connect_network(
        &self,
        _runtime_id: &str,
        _network: &str,
        _aliases: &[String],
    ) -> ProviderResult<()> {
        Ok(())
    }

    async fn disconnect_network(&self, _runtime_id: &str, _network: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn is_connected(&self, _runtime_id: &str, network: &str) -> ProviderResult<bool> {
        Ok(self.networks.contains_key(network))
    }

    async fn create_volume(&self, name: &str) -> ProviderResult<()> {
        self.volumes.insert(name.to_string(), ());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ProviderResult<()> {
        self.volumes.remove(name);
        Ok(())
    }

    async fn stream_events(&self, _label: &str) -> ProviderResult<EventStream> {
        let (tx, rx) = mpsc::channel(64);
        let key = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.event_txs.insert(key, tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Daemon controller whose daemons start instantly and stay healthy.
#[derive(Default)]
pub struct NullDaemonController {
    statuses: DashMap<String, DaemonStatus>,
}

#[async_trait]
impl DaemonController for NullDaemonController {
    async fn start(
        &self,
        session_id: &str,
        stream_port: u16,
        _url: Option<&str>,
    ) -> BrowserResult<StartReply> {
        self.statuses.insert(
            session_id.to_string(),
            DaemonStatus {
                running: true,
                ready: true,
                port: stream_port,
            },
        );
        Ok(StartReply { port: stream_port })
    }

    async fn stop(&self, session_id: &str) -> BrowserResult<()> {
        self.statuses.remove(session_id);
        Ok(())
    }

    async fn navigate(&self, _session_id: &str, _url: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn get_status(&self, session_id: &str) -> BrowserResult<Option<DaemonStatus>> {
        Ok(self.statuses.get(session_id).map(|s| s.clone()))
    }

    async fn get_current_url(&self, _session_id: &str) -> BrowserResult<Option<String>> {
        Ok(None)
    }

    async fn launch(&self, _session_id: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn execute_command(
        &self,
        session_id: &str,
        _command: Value,
    ) -> BrowserResult<CommandReply> {
        if self.statuses.contains_key(session_id) {
            Ok(CommandReply {
                id: "cmd".to_string(),
                success: true,
                data: None,
                error: None,
            })
        } else {
            Err(BrowserError::ConnectionFailed {
                session_id: session_id.to_string(),
                detail: "no daemon".to_string(),
            })
        }
    }
}

/// Fully assembled application over an in-memory database and fakes.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub sandbox: Arc<FakeSandbox>,
}

/// Create a test application with all services initialized.
pub async fn test_app() -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let config = Arc::new(LabConfig::default());

    let sandbox = FakeSandbox::new();
    let provider: Arc<dyn SandboxProvider> = sandbox.clone();

    let bus = Arc::new(ChannelBus::new());
    let routes = Arc::new(RouteTable::new(config.proxy_base_domain.clone()));
    let logs = Arc::new(LogRegistry::new());
    let typing = Arc::new(TypingRegistry::new());

    let reservations = PortReservationRepository::new(db.pool().clone());
    let ports = Arc::new(PortAllocator::new(9300, 9500, reservations.clone()));

    let browser = BrowserOrchestrator::new(
        BrowserStateRepository::new(db.pool().clone()),
        reservations,
        Arc::new(NullDaemonController::default()),
        ports,
        bus.clone(),
        BrowserOrchestratorConfig::default(),
    );

    let projects = ProjectRepository::new(db.pool().clone());
    let events = AgentEventRepository::new(db.pool().clone());
    let sessions = SessionService::new(
        SessionRepository::new(db.pool().clone()),
        projects.clone(),
        provider,
        routes.clone(),
        bus.clone(),
        browser.clone(),
        logs.clone(),
        events.clone(),
        vec!["workspaces".to_string()],
    );

    let orchestrations = OrchestrationService::new(
        OrchestrationRepository::new(db.pool().clone()),
        projects.clone(),
        sessions.clone(),
        events.clone(),
        bus.clone(),
    );

    let github = GithubSettingsRepository::new(db.pool().clone());

    let state = AppState {
        config,
        db,
        projects,
        sessions,
        browser,
        orchestrations,
        events,
        github,
        bus,
        routes,
        typing,
        logs,
    };

    TestApp {
        router: create_router(state.clone()),
        state,
        sandbox,
    }
}
