//! Request handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::delivery::sse::sse_response;
use crate::models::event::{Event, EventType};
use crate::models::session::{AgentType, Session, SessionStatus};
use crate::models::target::Target;
use crate::orchestrator::{LaunchRequest, Orchestrator};
use crate::{AppError, Result};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    /// Orchestrator the handlers drive.
    pub orchestrator: Arc<Orchestrator>,
    /// Fires when the server shuts down; ends open event streams.
    pub shutdown: CancellationToken,
}

/// `GET /health`.
pub async fn health() -> &'static str {
    "ok"
}

/// Query for `GET /events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Project to stream.
    pub project_id: String,
}

/// `GET /events`: the push channel.
pub async fn stream_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    sse_response(
        orchestrator.bus(),
        query.project_id,
        orchestrator.config().keepalive_interval(),
        state.shutdown.clone(),
    )
}

/// `POST /events`: publish an externally originated event.
pub async fn publish_event(
    State(state): State<ApiState>,
    Json(event): Json<Event>,
) -> Result<impl IntoResponse> {
    if event.event_type == EventType::Connected {
        return Err(AppError::Config(
            "connected events are generated by the server".into(),
        ));
    }
    let delivered = state.orchestrator.bus().emit(&event);
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}

/// Query for `GET /sessions`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Project to list.
    pub project_id: String,
    /// Optional status filter.
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

/// `GET /sessions`: polling fallback listing.
pub async fn list_sessions(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Session>>> {
    let sessions = state.orchestrator.list(&query.project_id, query.status).await?;
    Ok(Json(sessions))
}

/// `GET /sessions/{id}`.
pub async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Session>> {
    Ok(Json(state.orchestrator.session(&id).await?))
}

/// `POST /sessions`: launch.
pub async fn launch_session(
    State(state): State<ApiState>,
    Json(request): Json<LaunchRequest>,
) -> Result<impl IntoResponse> {
    let session = state.orchestrator.launch(request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `POST /sessions/{id}/cancel`.
pub async fn cancel_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Session>> {
    Ok(Json(state.orchestrator.cancel(&id).await?))
}

/// Query for `GET /sessions/resumable`.
#[derive(Debug, Deserialize)]
pub struct ResumableQuery {
    /// Project scope.
    pub project_id: String,
    /// Epic scope.
    #[serde(default)]
    pub epic_id: Option<String>,
    /// Story scope.
    #[serde(default)]
    pub user_story_id: Option<String>,
    /// Restrict to one agent type.
    #[serde(default)]
    pub agent_type: Option<AgentType>,
}

/// `GET /sessions/resumable`: newest session a new launch could resume.
pub async fn resumable_session(
    State(state): State<ApiState>,
    Query(query): Query<ResumableQuery>,
) -> Result<Json<Option<Session>>> {
    let target = Target {
        project_id: query.project_id,
        epic_id: query.epic_id,
        user_story_id: query.user_story_id,
    };
    let session = state
        .orchestrator
        .resumable_session(&target, query.agent_type)
        .await?;
    Ok(Json(session))
}
