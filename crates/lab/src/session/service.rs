//! Session service - orchestrates container cluster lifecycle.
//!
//! Spawn returns as soon as the rows exist; cluster provisioning runs in
//! the background and the UI follows along on the bus. Teardown is
//! idempotent so the crash-recovery sweep can replay it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::browser::BrowserOrchestrator;
use crate::bus::ChannelBus;
use crate::events::{self, AgentEventRepository};
use crate::logs::LogRegistry;
use crate::project::{ContainerDefinition, ProjectRepository};
use crate::proxy::{RegisteredContainer, RouteTable};
use crate::sandbox::{
    ContainerSpec, ProviderError, RestartPolicy, SandboxProvider, CONTAINER_LABEL, PROJECT_LABEL,
    SESSION_LABEL,
};
use lab_protocol::{ChannelKind, Delta};

use super::models::{
    network_name, ContainerStatus, CreateSessionRequest, Session, SessionContainer,
    SessionDetail, SessionStatus,
};
use super::repository::SessionRepository;

/// Log source for orchestration lifecycle lines.
const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// Kind recorded for the shared volumes every cluster mounts.
const SHARED_VOLUME_KIND: &str = "shared";

/// Session orchestration errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project {0} has no container definitions")]
    NoContainerDefinitions(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Service for managing session clusters.
pub struct SessionService {
    repo: SessionRepository,
    projects: ProjectRepository,
    provider: Arc<dyn SandboxProvider>,
    router: Arc<RouteTable>,
    bus: Arc<ChannelBus>,
    browser: Arc<BrowserOrchestrator>,
    logs: Arc<LogRegistry>,
    events: AgentEventRepository,
    shared_volumes: Vec<String>,
    /// Per-session spawn/cleanup serialization.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionService {
    pub fn new(
        repo: SessionRepository,
        projects: ProjectRepository,
        provider: Arc<dyn SandboxProvider>,
        router: Arc<RouteTable>,
        bus: Arc<ChannelBus>,
        browser: Arc<BrowserOrchestrator>,
        logs: Arc<LogRegistry>,
        events: AgentEventRepository,
        shared_volumes: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            projects,
            provider,
            router,
            bus,
            browser,
            logs,
            events,
            shared_volumes,
            session_locks: DashMap::new(),
        })
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------

    /// Create (or claim) a session for a project. Returns immediately with
    /// the partial cluster; provisioning continues in the background.
    pub async fn spawn_session(
        self: &Arc<Self>,
        request: &CreateSessionRequest,
    ) -> Result<SessionDetail, SessionError> {
        let project = self
            .projects
            .get(&request.project_id)
            .await?
            .ok_or_else(|| SessionError::ProjectNotFound(request.project_id.clone()))?;

        let title = normalize_title(request.title.as_deref().or(request.initial_message.as_deref()));

        // A warm pooled session saves the cold start.
        if let Some(claimed) = self.repo.claim_pooled(&project.id, title.as_deref()).await? {
            info!("Claimed pooled session {} for project {}", claimed.id, project.name);
            self.repo
                .update_status(&claimed.id, SessionStatus::Running)
                .await?;
            let session = self
                .repo
                .get(&claimed.id)
                .await?
                .ok_or_else(|| SessionError::NotFound(claimed.id.clone()))?;

            self.bus
                .publish_delta(ChannelKind::Sessions, None, Delta::add(&session));

            if let Some(message) = &request.initial_message {
                self.record_user_message(&session.id, message).await;
            }

            // Refill the pool in the background.
            let this = self.clone();
            let project_id = project.id.clone();
            tokio::spawn(async move {
                this.ensure_pool(&project_id).await;
            });

            let containers = self.repo.containers_for_session(&session.id).await?;
            let urls = self.router.get_urls(&session.id);
            return Ok(SessionDetail {
                session,
                containers,
                urls,
            });
        }

        let definitions = self.projects.definitions(&project.id).await?;
        if definitions.is_empty() {
            return Err(SessionError::NoContainerDefinitions(project.id.clone()));
        }

        let session = self
            .repo
            .create(&project.id, title.as_deref(), SessionStatus::Creating)
            .await?;

        let mut containers = Vec::with_capacity(definitions.len());
        for definition in &definitions {
            containers.push(self.repo.create_container(&session.id, &definition.id).await?);
        }

        self.bus
            .publish_delta(ChannelKind::Sessions, None, Delta::add(&session));
        self.publish_container_adds(&session.id, &containers);

        if let Some(message) = &request.initial_message {
            self.record_user_message(&session.id, message).await;
        }

        let this = self.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            this.initialize_cluster(&session_id, SessionStatus::Running)
                .await;
        });

        Ok(SessionDetail {
            session,
            containers,
            urls: Vec::new(),
        })
    }

    async fn record_user_message(&self, session_id: &str, message: &str) {
        let event = events::user_message(&Uuid::new_v4().to_string(), message);
        match self.events.append(session_id, &event).await {
            Ok(stored) => {
                if let Ok(param) = Uuid::parse_str(session_id) {
                    self.bus.publish_delta(
                        ChannelKind::SessionMessages,
                        Some(param),
                        Delta::add(&stored.event_data),
                    );
                }
            }
            Err(e) => warn!("Failed to record initial message for {}: {}", session_id, e),
        }
    }

    // ------------------------------------------------------------------
    // Cluster initialization (background)
    // ------------------------------------------------------------------

    /// Bring up network, volumes, and containers for a session, then
    /// register its proxy routes. `final_status` distinguishes user
    /// sessions from pool warming.
    async fn initialize_cluster(self: &Arc<Self>, session_id: &str, final_status: SessionStatus) {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        if let Err(e) = self.initialize_cluster_inner(session_id, final_status).await {
            error!("Cluster init for session {} failed: {}", session_id, e);
            self.log_line(session_id, format!("cluster init failed: {}", e));
            if let Err(db_err) = self.repo.mark_error(session_id, &e.to_string()).await {
                error!("Failed to record session error: {}", db_err);
            }
            self.publish_session_update(session_id).await;
        }
    }

    async fn initialize_cluster_inner(
        self: &Arc<Self>,
        session_id: &str,
        final_status: SessionStatus,
    ) -> Result<(), SessionError> {
        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let definitions = self.projects.definitions(&session.project_id).await?;
        let network = network_name(session_id);

        self.provider.create_network(&network).await?;
        self.log_line(session_id, format!("network {} ready", network));

        for volume in &self.shared_volumes {
            self.provider.create_volume(volume).await?;
            self.repo
                .upsert_volume(volume, None, SHARED_VOLUME_KIND)
                .await?;
        }

        let containers = self.repo.containers_for_session(session_id).await?;
        let mut registered = Vec::with_capacity(containers.len());

        for container in &containers {
            let Some(definition) = definitions.iter().find(|d| d.id == container.container_id)
            else {
                warn!(
                    "Container {} has no definition {}; skipping",
                    container.id, container.container_id
                );
                continue;
            };

            match self
                .start_container(&session, container, definition, &network)
                .await
            {
                Ok(entry) => {
                    self.repo
                        .update_container_status(&container.id, ContainerStatus::Running, None)
                        .await?;
                    self.publish_container_update(session_id, &container.id).await;
                    self.log_line(
                        session_id,
                        format!("container {} running ({})", container.hostname, definition.image),
                    );
                    registered.push(entry);
                }
                Err(e) => {
                    // Leave the rest of the cluster up; the UI shows the
                    // partial state.
                    warn!(
                        "Container {} for session {} failed: {}",
                        container.hostname, session_id, e
                    );
                    self.repo
                        .update_container_status(
                            &container.id,
                            ContainerStatus::Error,
                            Some(&e.to_string()),
                        )
                        .await?;
                    self.publish_container_update(session_id, &container.id).await;
                    self.log_line(
                        session_id,
                        format!("container {} failed: {}", container.hostname, e),
                    );
                }
            }
        }

        let urls = self
            .router
            .register_cluster(session_id, &network, &registered);
        debug!("Session {} has {} route(s)", session_id, urls.len());

        self.repo.update_status(session_id, final_status).await?;
        self.publish_session_update(session_id).await;
        self.log_line(session_id, format!("session {}", final_status));

        // Keep the project's pool at its configured size.
        let project_id = session.project_id.clone();
        if final_status == SessionStatus::Running {
            let this = self.clone();
            tokio::spawn(async move {
                this.ensure_pool(&project_id).await;
            });
        }

        Ok(())
    }

    /// Create, start, and wire one container onto the session network.
    async fn start_container(
        &self,
        session: &Session,
        container: &SessionContainer,
        definition: &ContainerDefinition,
        network: &str,
    ) -> Result<RegisteredContainer, SessionError> {
        let mut spec = ContainerSpec::new(definition.image.clone())
            .name(format!("lab-{}", container.hostname.trim_start_matches("s-")))
            .hostname(container.hostname.clone())
            .workdir(format!("/workspaces/{}", session.id));

        spec.labels.insert(SESSION_LABEL.to_string(), session.id.clone());
        spec.labels
            .insert(PROJECT_LABEL.to_string(), session.project_id.clone());
        spec.labels
            .insert(CONTAINER_LABEL.to_string(), definition.id.clone());
        spec.restart = Some(RestartPolicy { max_retries: 3 });

        for volume in &self.shared_volumes {
            spec.volumes
                .push((volume.clone(), format!("/{}", volume)));
        }
        for (key, value) in definition.render_env(&session.id) {
            spec.env.insert(key, value);
        }
        spec.env
            .insert("LAB_SESSION_ID".to_string(), session.id.clone());

        let runtime_id = self.provider.create_container(&spec).await?;
        self.repo
            .set_container_runtime_id(&container.id, &runtime_id)
            .await?;
        self.provider.start_container(&runtime_id).await?;

        // Move the container onto the session network with one DNS alias
        // per declared port so the proxy resolves it without publishing.
        let aliases: Vec<String> = definition
            .ports
            .iter()
            .map(|p| format!("{}--{}", session.id, p.port))
            .collect();
        if let Err(e) = self.provider.disconnect_network(&runtime_id, "bridge").await {
            debug!("Disconnect from default network: {}", e);
        }
        self.provider
            .connect_network(&runtime_id, network, &aliases)
            .await?;

        let inspect = self.provider.inspect(&runtime_id).await?;
        let host_ports = inspect.map(|i| i.ports).unwrap_or_default();

        Ok(RegisteredContainer {
            container_id: definition.id.clone(),
            hostname: container.hostname.clone(),
            ports: definition
                .ports
                .iter()
                .map(|p| {
                    let port = p.port as u16;
                    (port, host_ports.get(&port).copied())
                })
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Pool
    // ------------------------------------------------------------------

    /// Drive the project's pooled-session count to its configured size,
    /// in both directions.
    pub fn ensure_pool<'a>(
        self: &'a Arc<Self>,
        project_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let project = match self.projects.get(project_id).await {
                Ok(Some(project)) => project,
                Ok(None) => return,
                Err(e) => {
                    warn!("Pool reconcile: failed to load project {}: {}", project_id, e);
                    return;
                }
            };
            if project.pool_size <= 0 {
                return;
            }

            // In-flight warms count, so concurrent reconciles do not overshoot.
            let candidates = match self.repo.count_pool_candidates(project_id).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Pool reconcile: failed to count pool for {}: {}", project_id, e);
                    return;
                }
            };

            for _ in candidates..project.pool_size {
                if let Err(e) = self.spawn_pooled(project_id).await {
                    warn!("Failed to warm pool for project {}: {}", project_id, e);
                    break;
                }
            }

            // Trim warms beyond the configured size.
            match self.repo.list_pooled_excess(project_id, project.pool_size).await {
                Ok(excess) => {
                    for session in excess {
                        info!("Trimming excess pooled session {}", session.id);
                        if let Err(e) = self.cleanup_session(&session.id).await {
                            warn!("Failed to trim pooled session {}: {}", session.id, e);
                        }
                    }
                }
                Err(e) => warn!("Pool reconcile: failed to list excess for {}: {}", project_id, e),
            }
        })
    }

    async fn spawn_pooled(self: &Arc<Self>, project_id: &str) -> Result<(), SessionError> {
        let definitions = self.projects.definitions(project_id).await?;
        if definitions.is_empty() {
            return Err(SessionError::NoContainerDefinitions(project_id.to_string()));
        }

        let session = self
            .repo
            .create(project_id, None, SessionStatus::Creating)
            .await?;
        for definition in &definitions {
            self.repo.create_container(&session.id, &definition.id).await?;
        }
        info!("Warming pooled session {} for project {}", session.id, project_id);

        let this = self.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            this.initialize_cluster(&session_id, SessionStatus::Pooled)
                .await;
        });

        Ok(())
    }

    // ------------------------------------------------------------------
    // Destroy
    // ------------------------------------------------------------------

    /// Tear a session down. Every step tolerates partial prior teardown so
    /// the recovery sweep can re-run it.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<(), SessionError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(session) = self.repo.get(session_id).await? else {
            // Already gone; nothing to do.
            return Ok(());
        };

        if session.status != SessionStatus::Deleting {
            self.repo
                .update_status(session_id, SessionStatus::Deleting)
                .await?;
        }
        self.bus
            .publish_delta(ChannelKind::Sessions, None, Delta::remove(session_id));

        for container in self.repo.containers_for_session(session_id).await? {
            let Some(runtime_id) = container.runtime_id else {
                continue;
            };
            if let Err(e) = self.provider.stop_container(&runtime_id, Some(10)).await {
                debug!("Stopping container {}: {}", runtime_id, e);
            }
            if let Err(e) = self.provider.remove_container(&runtime_id, true).await {
                debug!("Removing container {}: {}", runtime_id, e);
            }
            match self.provider.container_exists(&runtime_id).await {
                Ok(false) => {}
                Ok(true) => warn!(
                    "Container {} still exists after removal for session {}",
                    runtime_id, session_id
                ),
                Err(e) => warn!("Could not verify removal of {}: {}", runtime_id, e),
            }
        }

        if let Err(e) = self.browser.force_stop(session_id).await {
            warn!("Browser teardown for session {}: {}", session_id, e);
        }

        self.router.unregister_cluster(session_id);

        if let Err(e) = self.provider.remove_network(&network_name(session_id)).await {
            debug!("Removing network for session {}: {}", session_id, e);
        }

        self.repo.orphan_volumes_for_session(session_id).await?;
        self.repo.delete(session_id).await?;
        self.logs.remove_session(session_id);
        self.session_locks.remove(session_id);

        info!("Session {} cleaned up", session_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads and small mutations
    // ------------------------------------------------------------------

    pub async fn get_detail(&self, session_id: &str) -> Result<SessionDetail, SessionError> {
        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let containers = self.repo.containers_for_session(session_id).await?;
        let urls = self.router.get_urls(session_id);
        Ok(SessionDetail {
            session,
            containers,
            urls,
        })
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.repo.list_visible().await?)
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        title: Option<&str>,
        agent_session_id: Option<&str>,
    ) -> Result<Session, SessionError> {
        if self.repo.get(session_id).await?.is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        if let Some(title) = title {
            let normalized = normalize_title(Some(title));
            self.repo
                .update_title(session_id, normalized.as_deref())
                .await?;
        }
        if let Some(agent_session_id) = agent_session_id {
            self.repo
                .set_agent_session_id(session_id, agent_session_id)
                .await?;
        }

        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        self.bus
            .publish_delta(ChannelKind::Sessions, None, Delta::update(&session));
        Ok(session)
    }

    /// Re-drive sessions that a crash left mid-flight.
    pub async fn recovery_sweep(self: &Arc<Self>) {
        match self.repo.list_by_status(SessionStatus::Deleting).await {
            Ok(sessions) => {
                for session in sessions {
                    info!("Recovery: resuming teardown of session {}", session.id);
                    if let Err(e) = self.cleanup_session(&session.id).await {
                        error!("Recovery teardown of {} failed: {}", session.id, e);
                    }
                }
            }
            Err(e) => error!("Recovery sweep failed to list deleting sessions: {}", e),
        }

        match self.repo.list_by_status(SessionStatus::Creating).await {
            Ok(sessions) => {
                for session in sessions {
                    warn!(
                        "Recovery: session {} was mid-provisioning; marking error",
                        session.id
                    );
                    if let Err(e) = self
                        .repo
                        .mark_error(&session.id, "interrupted by server restart")
                        .await
                    {
                        error!("Recovery mark-error for {} failed: {}", session.id, e);
                    }
                }
            }
            Err(e) => error!("Recovery sweep failed to list creating sessions: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Publication helpers
    // ------------------------------------------------------------------

    fn publish_container_adds(&self, session_id: &str, containers: &[SessionContainer]) {
        let Ok(param) = Uuid::parse_str(session_id) else {
            return;
        };
        for container in containers {
            self.bus.publish_delta(
                ChannelKind::SessionContainers,
                Some(param),
                Delta::add(container),
            );
        }
    }

    async fn publish_container_update(&self, session_id: &str, container_id: &str) {
        let (Ok(param), Ok(Some(container))) = (
            Uuid::parse_str(session_id),
            self.repo.get_container(container_id).await,
        ) else {
            return;
        };
        self.bus.publish_delta(
            ChannelKind::SessionContainers,
            Some(param),
            Delta::update(&container),
        );
    }

    async fn publish_session_update(&self, session_id: &str) {
        if let Ok(Some(session)) = self.repo.get(session_id).await {
            self.bus
                .publish_delta(ChannelKind::Sessions, None, Delta::update(&session));
        }
    }

    fn log_line(&self, session_id: &str, line: String) {
        let entry = self.logs.append(session_id, ORCHESTRATOR_SOURCE, line);
        if let Ok(param) = Uuid::parse_str(session_id) {
            self.bus.publish_delta(
                ChannelKind::SessionLogs,
                Some(param),
                Delta::append(&entry),
            );
        }
    }

}

/// Collapse whitespace runs and trim; empty input becomes `None`.
fn normalize_title(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_are_normalized() {
        assert_eq!(
            normalize_title(Some("  fix   the\tlogin   bug ")).as_deref(),
            Some("fix the login bug")
        );
        assert_eq!(normalize_title(Some("   ")), None);
        assert_eq!(normalize_title(None), None);
    }
}
