//! API request handlers.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use tandem_protocol::{PermissionDecision, ServerEvent};

use crate::session::{ContinueRequest, RunStream, StartRequest};

use super::error::ApiResult;
use super::state::AppState;

/// Default number of entries for `/sessions/recent-cwds`.
const DEFAULT_RECENT_CWDS: usize = 10;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_runs: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_runs: state.service.controller().active_count(),
    })
}

fn sse_event(event: &ServerEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!("Failed to serialize server event: {}", e);
            Event::default().data(format!(r#"{{"error":"{}"}}"#, e))
        }
    }
}

fn run_sse(rx: RunStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = ReceiverStream::new(rx).map(|event| Ok(sse_event(&event)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Start a session; streams its events until the terminal status.
#[instrument(skip_all)]
pub async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let rx = state.service.start(request).await?;
    Ok(run_sse(rx))
}

/// Continue a session; same streaming contract as start.
#[instrument(skip_all)]
pub async fn continue_session(
    State(state): State<AppState>,
    Json(request): Json<ContinueRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let rx = state.service.continue_session(request).await?;
    Ok(run_sse(rx))
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[instrument(skip(state))]
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let stopped = state.service.stop(&session_id).await?;
    info!(stopped, "Stop requested");
    Ok(Json(StopResponse { stopped }))
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub resolved: bool,
}

#[instrument(skip(state, decision))]
pub async fn respond_permission(
    State(state): State<AppState>,
    Path((session_id, tool_use_id)): Path<(String, String)>,
    Json(decision): Json<PermissionDecision>,
) -> ApiResult<Json<ResolveResponse>> {
    let resolved = state
        .service
        .respond_permission(&session_id, &tool_use_id, decision)
        .await?;
    if !resolved {
        debug!("No pending permission to resolve");
    }
    Ok(Json(ResolveResponse { resolved }))
}

#[instrument(skip(state))]
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<ServerEvent>> {
    let sessions = state.service.list().await?;
    Ok(Json(ServerEvent::SessionList { sessions }))
}

#[derive(Debug, Deserialize)]
pub struct RecentCwdsQuery {
    pub limit: Option<usize>,
}

#[instrument(skip(state))]
pub async fn recent_cwds(
    State(state): State<AppState>,
    Query(query): Query<RecentCwdsQuery>,
) -> ApiResult<Json<Vec<String>>> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_CWDS);
    Ok(Json(state.service.recent_cwds(limit).await?))
}

#[instrument(skip(state))]
pub async fn get_session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ServerEvent>> {
    let history = state.service.history(&session_id).await?;
    Ok(Json(ServerEvent::SessionHistory {
        session_id: history.session.id,
        status: history.session.status,
        messages: history.messages,
        pending_permissions: history.pending_permissions,
    }))
}

#[instrument(skip(state))]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ServerEvent>> {
    let session = state.service.get(&session_id).await?;
    state.service.delete(&session.id).await?;
    info!(id = %session.id, "Session deleted");
    Ok(Json(ServerEvent::SessionDeleted {
        session_id: session.id,
    }))
}

/// Every event the service publishes, for observers that did not start a run.
#[instrument(skip(state))]
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.service.subscribe();
    let shutdown = state.shutdown.clone().cancelled_owned();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok(sse_event(&event)), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .take_until(shutdown);
    Sse::new(stream).keep_alive(KeepAlive::default())
}
