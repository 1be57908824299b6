//! HTTP API handlers.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use log::info;
use serde_json::Value;
use tokio_stream::wrappers::BroadcastStream;

use crate::github::GithubSettings;
use crate::orchestrate::{OrchestrateRequest, OrchestrateResponse};
use crate::project::{NewProject, Project};
use crate::session::{CreateSessionRequest, Session, SessionDetail, UpdateSessionRequest};

use super::error::ApiError;
use super::state::AppState;

/// GET /health
pub async fn health() -> &'static str {
    "OK"
}

/// GET /projects
pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.projects.list().await?))
}

/// POST /projects
pub async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("project name must not be empty"));
    }
    let project = state.projects.create(&body).await?;
    info!("Created project {} ({})", project.name, project.id);
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.sessions.list_sessions().await?))
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionDetail>), ApiError> {
    let detail = state.sessions.spawn_session(&body).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    Ok(Json(state.sessions.get_detail(&session_id).await?))
}

/// PATCH /sessions/{id}
pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<UpdateSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .sessions
        .update_session(
            &session_id,
            body.title.as_deref(),
            body.agent_session_id.as_deref(),
        )
        .await?;
    Ok(Json(session))
}

/// DELETE /sessions/{id}
///
/// Teardown runs in the background; the UI observes `sessions.remove` on
/// the bus.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state
        .sessions
        .repository()
        .get(&session_id)
        .await
        .map_err(ApiError::from)?
        .is_none()
    {
        return Err(ApiError::not_found(format!("session {}", session_id)));
    }

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        if let Err(e) = sessions.cleanup_session(&session_id).await {
            log::error!("Background cleanup of session {} failed: {}", session_id, e);
        }
    });

    Ok(StatusCode::NO_CONTENT)
}

/// POST /orchestrate
pub async fn orchestrate(
    State(state): State<AppState>,
    Json(body): Json<OrchestrateRequest>,
) -> Result<(StatusCode, Json<OrchestrateResponse>), ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }
    let response = state.orchestrations.orchestrate(&body).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /orchestrate/{id}/events
///
/// SSE feed of orchestration status transitions. `Last-Event-ID` replays
/// missed events from the bounded ring.
pub async fn orchestration_events(
    State(state): State<AppState>,
    Path(orchestration_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let ring = state
        .orchestrations
        .ring(&orchestration_id)
        .ok_or_else(|| ApiError::not_found(format!("orchestration {}", orchestration_id)))?;

    let last_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);

    let live = ring.subscribe();
    let replay = ring.replay_after(last_id);

    let replayed = futures::stream::iter(replay.into_iter().map(
        |(id, payload)| -> Result<Event, Infallible> {
            Ok(Event::default().id(id.to_string()).data(payload.to_string()))
        },
    ));
    let streamed = BroadcastStream::new(live).filter_map(move |item| async move {
        match item {
            Ok((id, payload)) if id > last_id => {
                Some(Ok(Event::default().id(id.to_string()).data(payload.to_string())))
            }
            _ => None,
        }
    });

    Ok(Sse::new(replayed.chain(streamed)).keep_alive(KeepAlive::default()))
}

/// GET /github/settings
pub async fn get_github_settings(
    State(state): State<AppState>,
) -> Result<Json<GithubSettings>, ApiError> {
    Ok(Json(state.github.get().await?))
}

/// POST /github/settings
pub async fn save_github_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<GithubSettings>, ApiError> {
    if !body.is_object() {
        return Err(ApiError::bad_request("settings must be an object"));
    }
    Ok(Json(state.github.upsert(&body).await?))
}

/// DELETE /github/settings
pub async fn delete_github_settings(
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.github.delete().await?;
    Ok(StatusCode::NO_CONTENT)
}
