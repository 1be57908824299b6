//! Application state shared across handlers.

use std::sync::Arc;

use crate::browser::BrowserOrchestrator;
use crate::bus::ChannelBus;
use crate::config::LabConfig;
use crate::db::Database;
use crate::events::AgentEventRepository;
use crate::github::GithubSettingsRepository;
use crate::logs::LogRegistry;
use crate::orchestrate::OrchestrationService;
use crate::project::ProjectRepository;
use crate::proxy::RouteTable;
use crate::session::SessionService;
use crate::typing::TypingRegistry;

/// Everything the handlers and the bus need.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LabConfig>,
    pub db: Database,
    pub projects: ProjectRepository,
    pub sessions: Arc<SessionService>,
    pub browser: Arc<BrowserOrchestrator>,
    pub orchestrations: Arc<OrchestrationService>,
    pub events: AgentEventRepository,
    pub github: GithubSettingsRepository,
    pub bus: Arc<ChannelBus>,
    pub routes: Arc<RouteTable>,
    pub typing: Arc<TypingRegistry>,
    pub logs: Arc<LogRegistry>,
}
