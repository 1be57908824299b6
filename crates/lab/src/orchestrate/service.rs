//! Orchestration flow: resolve a project, claim or spawn a session, hand
//! the content to the agent, and narrate progress on the status channel.

use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::bus::ChannelBus;
use crate::events::{self, AgentEventRepository};
use crate::project::{Project, ProjectRepository};
use crate::prompts::{compose, session_fragments, PromptContext};
use crate::session::{CreateSessionRequest, SessionService};
use lab_protocol::{ChannelKind, Delta};

use super::models::{OrchestrateRequest, OrchestrateResponse, OrchestrationStatus};
use super::repository::OrchestrationRepository;
use super::sse::EventRing;

/// Events retained per orchestration for SSE replay.
const RING_CAPACITY: usize = 64;

/// Service driving orchestration requests to completion.
pub struct OrchestrationService {
    repo: OrchestrationRepository,
    projects: ProjectRepository,
    sessions: Arc<SessionService>,
    events: AgentEventRepository,
    bus: Arc<ChannelBus>,
    rings: DashMap<String, Arc<EventRing>>,
}

impl OrchestrationService {
    pub fn new(
        repo: OrchestrationRepository,
        projects: ProjectRepository,
        sessions: Arc<SessionService>,
        events: AgentEventRepository,
        bus: Arc<ChannelBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            projects,
            sessions,
            events,
            bus,
            rings: DashMap::new(),
        })
    }

    pub fn repository(&self) -> &OrchestrationRepository {
        &self.repo
    }

    /// SSE replay ring for an orchestration, if it is (or was) live.
    pub fn ring(&self, orchestration_id: &str) -> Option<Arc<EventRing>> {
        self.rings.get(orchestration_id).map(|r| r.clone())
    }

    /// Accept a request and resolve it in the background.
    pub async fn orchestrate(
        self: &Arc<Self>,
        request: &OrchestrateRequest,
    ) -> anyhow::Result<OrchestrateResponse> {
        let row = self
            .repo
            .create(
                &request.content,
                request.channel_id.as_deref(),
                request.model_id.as_deref(),
            )
            .await?;

        self.rings
            .insert(row.id.clone(), Arc::new(EventRing::new(RING_CAPACITY)));
        self.emit(&row.id, OrchestrationStatus::Pending, None, None, None);

        let this = self.clone();
        let orchestration_id = row.id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.resolve(&orchestration_id).await {
                warn!("Orchestration {} failed: {}", orchestration_id, e);
                if let Err(db_err) = this.repo.mark_error(&orchestration_id, &e.to_string()).await {
                    warn!("Failed to record orchestration error: {}", db_err);
                }
                this.emit(
                    &orchestration_id,
                    OrchestrationStatus::Error,
                    None,
                    None,
                    Some(e.to_string()),
                );
            }
        });

        Ok(OrchestrateResponse {
            orchestration_id: row.id,
            project_name: None,
            session_id: None,
        })
    }

    async fn resolve(&self, orchestration_id: &str) -> anyhow::Result<()> {
        let request = self
            .repo
            .get(orchestration_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("orchestration request vanished"))?;

        self.repo
            .update_status(orchestration_id, OrchestrationStatus::Thinking)
            .await?;
        self.emit(orchestration_id, OrchestrationStatus::Thinking, None, None, None);

        let project = self.pick_project(&request.content).await?;
        self.repo
            .set_resolved_project(orchestration_id, &project.id)
            .await?;
        self.repo
            .update_status(orchestration_id, OrchestrationStatus::Delegating)
            .await?;
        self.emit(
            orchestration_id,
            OrchestrationStatus::Delegating,
            Some(project.name.clone()),
            None,
            None,
        );

        self.repo
            .update_status(orchestration_id, OrchestrationStatus::Starting)
            .await?;
        self.emit(
            orchestration_id,
            OrchestrationStatus::Starting,
            Some(project.name.clone()),
            None,
            None,
        );

        let detail = self
            .sessions
            .spawn_session(&CreateSessionRequest {
                project_id: project.id.clone(),
                title: None,
                initial_message: Some(request.content.clone()),
            })
            .await?;
        let session_id = detail.session.id.clone();
        self.repo
            .set_resolved_session(orchestration_id, &session_id)
            .await?;

        // Hand the agent its composed system prompt as the first ACP event.
        let prompt = compose(
            &session_fragments(),
            &PromptContext {
                project_name: project.name.clone(),
                project_prompt: project.system_prompt.clone(),
                session_id: session_id.clone(),
                session_title: detail.session.title.clone(),
                workspace_dir: format!("/workspaces/{}", session_id),
            },
        );
        let acp_event = json!({
            "kind": events::kind::ACP,
            "phase": "system_prompt",
            "prompt": prompt,
        });
        self.events.append(&session_id, &acp_event).await?;

        self.repo
            .update_status(orchestration_id, OrchestrationStatus::Complete)
            .await?;
        self.emit(
            orchestration_id,
            OrchestrationStatus::Complete,
            Some(project.name.clone()),
            Some(session_id.clone()),
            None,
        );
        info!(
            "Orchestration {} resolved to session {} in project {}",
            orchestration_id, session_id, project.name
        );

        Ok(())
    }

    /// Pick the project whose name appears in the content; fall back to
    /// the first project.
    async fn pick_project(&self, content: &str) -> anyhow::Result<Project> {
        let projects = self.projects.list().await?;
        if projects.is_empty() {
            anyhow::bail!("no projects configured");
        }

        let lowered = content.to_lowercase();
        let matched = projects
            .iter()
            .find(|p| lowered.contains(&p.name.to_lowercase()))
            .cloned();

        Ok(matched.unwrap_or_else(|| projects[0].clone()))
    }

    fn emit(
        &self,
        orchestration_id: &str,
        status: OrchestrationStatus,
        project_name: Option<String>,
        session_id: Option<String>,
        error_message: Option<String>,
    ) {
        let payload = json!({
            "status": status,
            "projectName": project_name,
            "sessionId": session_id,
            "errorMessage": error_message,
        });

        if let Some(ring) = self.rings.get(orchestration_id) {
            ring.push(payload.clone());
        }
        if let Ok(param) = Uuid::parse_str(orchestration_id) {
            self.bus.publish_delta(
                ChannelKind::OrchestrationStatus,
                Some(param),
                Delta::patch(&payload),
            );
        }
    }
}
