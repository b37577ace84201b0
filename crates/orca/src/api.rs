//! HTTP and WebSocket API surface.
//!
//! Everything REST lives under `/api`; the two long-lived sockets live
//! under `/ws`: `/ws/events` pushes workspace events to dashboards and
//! `/ws/tunnel` is the attachment point for remote CLIs.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::events::EventHub;
use crate::tunnel::{TunnelEvents, TunnelRegistry, run_tunnel};
use crate::workspace::{CreateWorkspaceRequest, InputRequest, WorkspaceService};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WorkspaceService>,
    pub hub: Arc<EventHub>,
    pub tunnels: Arc<TunnelRegistry>,
}

/// API error with a structured JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Categorize service-layer errors by message. The service reports
/// missing records as "not found" and validation problems as "invalid".
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let lower = message.to_lowercase();
        if lower.contains("not found") {
            ApiError::NotFound(message)
        } else if lower.contains("invalid") || lower.contains("requires") {
            ApiError::BadRequest(message)
        } else {
            ApiError::Internal(message)
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/workspaces",
            get(list_workspaces).post(create_workspace),
        )
        .route(
            "/api/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/api/workspaces/{id}/start", post(start_workspace))
        .route("/api/workspaces/{id}/stop", post(stop_workspace))
        .route("/api/workspaces/{id}/restart", post(restart_workspace))
        .route("/api/workspaces/{id}/log", get(workspace_log))
        .route("/api/workspaces/{id}/exec", post(exec_in_workspace))
        .route("/api/workspaces/{id}/input", post(dispatch_input))
        .route("/api/workspaces/{id}/targets", get(workspace_targets))
        .route("/ws/events", get(ws_events))
        .route("/ws/tunnel", get(ws_tunnel))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_workspaces(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "workspaces": state.service.list() }))
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkspaceRequest>,
) -> ApiResult<impl IntoResponse> {
    let workspace = state.service.create(request)?;

    // Initialization runs in the background; clients follow progress over
    // /ws/events or by polling the record.
    let service = Arc::clone(&state.service);
    let id = workspace.id.clone();
    tokio::spawn(async move {
        let _ = service.start(&id).await;
    });

    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get(&id)?))
}

async fn start_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    // Existence check up front; the actual start can take minutes.
    let workspace = state.service.get(&id)?;
    let service = Arc::clone(&state.service);
    let workspace_id = workspace.id.clone();
    tokio::spawn(async move {
        let _ = service.start(&workspace_id).await;
    });
    Ok((StatusCode::ACCEPTED, Json(workspace)))
}

async fn stop_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.stop(&id).await?))
}

async fn restart_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let workspace = state.service.get(&id)?;
    let service = Arc::clone(&state.service);
    let workspace_id = workspace.id.clone();
    tokio::spawn(async move {
        let _ = service.restart(&workspace_id).await;
    });
    Ok((StatusCode::ACCEPTED, Json(workspace)))
}

async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn workspace_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({ "lines": state.service.log(&id)? })))
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    command: Vec<String>,
}

async fn exec_in_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.command.is_empty() {
        return Err(ApiError::BadRequest("command cannot be empty".to_string()));
    }
    let output = state.service.exec(&id, &request.command).await?;
    Ok(Json(json!({ "output": output })))
}

async fn dispatch_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<InputRequest>,
) -> ApiResult<impl IntoResponse> {
    state.service.dispatch_input(&id, request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn workspace_targets(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({ "targets": state.service.targets(&id).await? })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    workspace_id: Option<String>,
}

async fn ws_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| relay_events(socket, state.hub, query.workspace_id))
}

/// Push hub events to one client until either side hangs up.
async fn relay_events(socket: WebSocket, hub: Arc<EventHub>, filter: Option<String>) {
    let mut rx = hub.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("events client lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Some(ref id) = filter {
                    if event.workspace_id() != id {
                        continue;
                    }
                }
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunnelQuery {
    workspace_id: String,
}

async fn ws_tunnel(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if !state.service.store().contains(&query.workspace_id) {
        return Err(ApiError::NotFound(format!(
            "workspace {} not found",
            query.workspace_id
        )));
    }
    let tunnels = Arc::clone(&state.tunnels);
    let events: Arc<dyn TunnelEvents> = Arc::clone(&state.service) as Arc<dyn TunnelEvents>;
    Ok(upgrade.on_upgrade(move |socket| {
        run_tunnel(socket, tunnels, events, query.workspace_id)
    }))
}
