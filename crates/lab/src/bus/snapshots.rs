//! Per-channel snapshot loaders.
//!
//! Each channel's snapshot is a read model over the repositories and the
//! in-memory registries; the bus sends it exactly once per subscription,
//! before any delta.

use anyhow::Result;
use serde_json::{json, Value};

use crate::api::state::AppState;
use crate::events::kind;
use lab_protocol::{ChannelKind, ChannelPath};

/// Strip the projection discriminator from an event payload.
fn without_kind(mut value: Value) -> Value {
    if let Some(object) = value.as_object_mut() {
        object.remove("kind");
    }
    value
}

async fn kind_items(state: &AppState, session_id: &str, kind: &str) -> Result<Value> {
    let events = state.events.list_kind(session_id, kind).await?;
    Ok(Value::Array(
        events
            .into_iter()
            .map(|e| without_kind(e.event_data))
            .collect(),
    ))
}

/// Load the snapshot for a resolved channel path.
pub async fn load_snapshot(state: &AppState, path: &ChannelPath) -> Result<Value> {
    let session_id = path.param.map(|p| p.to_string());
    let session_id = session_id.as_deref().unwrap_or_default();

    match path.kind {
        ChannelKind::Projects => {
            let projects = state.projects.list().await?;
            Ok(serde_json::to_value(projects)?)
        }

        ChannelKind::Sessions => {
            let sessions = state.sessions.list_sessions().await?;
            Ok(serde_json::to_value(sessions)?)
        }

        ChannelKind::SessionMetadata => {
            let session = state
                .sessions
                .repository()
                .get(session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("session not found: {}", session_id))?;
            let messages = state.events.list_kind(session_id, kind::MESSAGE).await?;
            let last_message = messages.last().map(|e| e.event_data.clone());
            Ok(json!({
                "title": session.title,
                "status": session.status,
                "projectId": session.project_id,
                "lastMessage": last_message,
                "inferenceStatus": "idle",
            }))
        }

        ChannelKind::SessionContainers => {
            let containers = state
                .sessions
                .repository()
                .containers_for_session(session_id)
                .await?;
            Ok(serde_json::to_value(containers)?)
        }

        ChannelKind::SessionTyping => Ok(json!(state.typing.snapshot(session_id))),

        ChannelKind::SessionChangedFiles => kind_items(state, session_id, kind::FILE_DIFF).await,
        ChannelKind::SessionTasks => kind_items(state, session_id, kind::TASK).await,
        ChannelKind::SessionBranches => kind_items(state, session_id, kind::BRANCH).await,
        ChannelKind::SessionLinks => kind_items(state, session_id, kind::LINK).await,

        ChannelKind::SessionLogs => Ok(serde_json::to_value(state.logs.snapshot(session_id))?),

        ChannelKind::SessionMessages => {
            let messages = kind_items(state, session_id, kind::MESSAGE).await?;
            let questions = kind_items(state, session_id, kind::QUESTION_REQUEST).await?;
            Ok(json!({
                "messages": messages,
                "questionRequests": questions,
            }))
        }

        ChannelKind::SessionAcpEvents => {
            let checkpoint = state.events.checkpoint(session_id).await?;
            let events = state.events.list(session_id).await?;
            Ok(json!({
                "checkpoint": checkpoint,
                "events": events,
            }))
        }

        ChannelKind::SessionBrowserState => {
            let browser_state = state.browser.state(session_id).await?;
            let mut value = serde_json::to_value(&browser_state)?;
            if let Some(object) = value.as_object_mut() {
                let stream_url = browser_state.stream_port.map(|port| {
                    format!("ws://{}:{}", state.config.browser_ws_host, port)
                });
                object.insert("streamUrl".to_string(), json!(stream_url));
            }
            Ok(value)
        }

        ChannelKind::SessionBrowserFrames => {
            match state.browser.frame_cache().get(session_id) {
                Some(frame) => Ok(serde_json::to_value(frame)?),
                None => Ok(json!({ "lastFrame": null, "timestamp": null })),
            }
        }

        // Input is an event-only channel; the snapshot is empty.
        ChannelKind::SessionBrowserInput => Ok(json!({})),

        ChannelKind::OrchestrationStatus => {
            let request = state
                .orchestrations
                .repository()
                .get(session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("orchestration not found: {}", session_id))?;
            let project_name = match &request.resolved_project_id {
                Some(project_id) => state.projects.get(project_id).await?.map(|p| p.name),
                None => None,
            };
            Ok(json!({
                "status": request.status,
                "projectName": project_name,
                "sessionId": request.resolved_session_id,
                "errorMessage": request.error_message,
            }))
        }

        ChannelKind::SessionComplete => {
            let complete = state
                .events
                .list_kind(session_id, kind::SESSION_COMPLETE)
                .await?;
            Ok(json!({ "completed": !complete.is_empty() }))
        }
    }
}

/// Channel authorization hook. The server trusts its perimeter, so every
/// subscription is allowed; the hook is the seam a deployment with real
/// tenancy would fill in.
pub fn authorize(_state: &AppState, _path: &ChannelPath) -> bool {
    true
}
