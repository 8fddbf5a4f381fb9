use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::{Job, JobError, JobSpecification};
use crate::runtime::{Replica, RuntimeError, ShellInput, ShellOutput, ShellSession};
use crate::server::state::AppState;

const DEFAULT_SHELL: &str = "/bin/sh";

// ============================================================================
// Errors
// ============================================================================

/// A [`JobError`] rendered as `{ "error": message, "code": code }`
#[derive(Debug)]
pub struct ApiError(JobError);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self(e)
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        Self(JobError::Runtime(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Request and response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub specification: JobSpecification,
    pub user: String,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ExtendResponse {
    pub job_id: String,
    /// Total time allowance after the extension
    pub allowance_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub checked: usize,
    pub lost: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ShellQuery {
    /// Whitespace separated command, a login shell when absent
    #[serde(default)]
    pub command: Option<String>,
}

/// Resize frame sent by shell clients as JSON text
#[derive(Debug, Deserialize)]
struct ResizeFrame {
    cols: u16,
    rows: u16,
}

#[derive(Debug, Deserialize)]
pub struct TunnelRequest {
    pub port: u16,
}

#[derive(Debug, Serialize)]
pub struct TunnelResponse {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub paused: bool,
}

#[derive(Serialize)]
struct ServiceStatus {
    runtime: &'static str,
    paused: bool,
    unsuspend_queue: usize,
    tracked_jobs: usize,
    open_tunnels: usize,
    started_at: DateTime<Utc>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Service status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = ServiceStatus {
        runtime: state.runtime().name(),
        paused: state.manager.is_paused(),
        unsuspend_queue: state.manager.unsuspend_queue_len().await,
        tracked_jobs: state.manager.cache().len(),
        open_tunnels: state.open_tunnel_count(),
        started_at: state.started_at,
    };
    Json(status)
}

pub async fn register_job(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .manager
        .register_application(request.specification, &request.user, request.project.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Create a job the accounting authority already knows
pub async fn create_job(
    State(state): State<AppState>,
    Json(job): Json<Job>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.create(job).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.cancel(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn extend_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<ExtendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.seconds == 0 {
        return Err(JobError::InvalidRequest("extension must be positive".into()).into());
    }
    let allowance_secs = state
        .manager
        .extend(&job_id, Duration::from_secs(request.seconds))
        .await?;
    Ok(Json(ExtendResponse {
        job_id,
        allowance_secs,
    }))
}

pub async fn verify_jobs(
    State(state): State<AppState>,
    Json(jobs): Json<Vec<Job>>,
) -> Result<impl IntoResponse, ApiError> {
    let lost = state.manager.verify_jobs(&jobs).await?;
    Ok(Json(VerifyResponse {
        checked: jobs.len(),
        lost,
    }))
}

async fn find_replica(state: &AppState, job_id: &str, rank: u32) -> Result<Replica, ApiError> {
    state
        .runtime()
        .retrieve(job_id, rank)
        .await?
        .ok_or_else(|| RuntimeError::ReplicaNotFound(job_id.to_string(), rank).into())
}

/// Logs of one replica, either the current text or a followed stream
pub async fn logs(
    State(state): State<AppState>,
    Path((job_id, rank)): Path<(String, u32)>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let replica = find_replica(&state, &job_id, rank).await?;
    let content_type = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];

    if !query.follow {
        let text = replica.download_logs().await?;
        return Ok((content_type, text).into_response());
    }

    let stream = replica.follow_logs().await?;
    let lines = futures::stream::unfold(stream, |mut stream| async move {
        stream
            .next_line()
            .await
            .map(|line| (Ok::<_, Infallible>(format!("{line}\n")), stream))
    });
    Ok((content_type, Body::from_stream(lines)).into_response())
}

/// Interactive shell bridged over a websocket
pub async fn shell(
    State(state): State<AppState>,
    Path((job_id, rank)): Path<(String, u32)>,
    Query(query): Query<ShellQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let replica = find_replica(&state, &job_id, rank).await?;
    let command: Vec<String> = match query.command.as_deref().map(str::trim) {
        Some(command) if !command.is_empty() => {
            command.split_whitespace().map(str::to_string).collect()
        }
        _ => vec![DEFAULT_SHELL.to_string()],
    };
    let session = replica.open_shell(command).await?;
    debug!("Shell {} opened for {}/{}", session.id, job_id, rank);
    Ok(ws.on_upgrade(move |socket| bridge_shell(socket, session)))
}

fn shell_input(text: &str) -> ShellInput {
    match serde_json::from_str::<ResizeFrame>(text) {
        Ok(frame) => ShellInput::Resize {
            cols: frame.cols,
            rows: frame.rows,
        },
        Err(_) => ShellInput::Data(text.as_bytes().to_vec()),
    }
}

async fn bridge_shell(mut socket: WebSocket, mut session: ShellSession) {
    loop {
        tokio::select! {
            message = socket.recv() => {
                let input = match message {
                    Some(Ok(WsMessage::Text(text))) => shell_input(text.as_str()),
                    Some(Ok(WsMessage::Binary(data))) => ShellInput::Data(data.to_vec()),
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if session.input.send(input).await.is_err() {
                    break;
                }
            }
            output = session.output.recv() => {
                let frame = match output {
                    Some(ShellOutput::Stdout(data)) | Some(ShellOutput::Stderr(data)) => {
                        WsMessage::Binary(data.into())
                    }
                    Some(ShellOutput::Error(status)) => WsMessage::Text(status.into()),
                    Some(ShellOutput::Closed) | None => break,
                };
                if socket.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
    debug!("Shell {} closed", session.id);
}

pub async fn open_tunnel(
    State(state): State<AppState>,
    Path((job_id, rank)): Path<(String, u32)>,
    Json(request): Json<TunnelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tunnel = state
        .runtime()
        .open_tunnel(&job_id, rank, request.port)
        .await?;
    let response = TunnelResponse {
        id: tunnel.id,
        host: tunnel.host.clone(),
        port: tunnel.port,
    };
    state.register_tunnel(tunnel);
    Ok(Json(response))
}

pub async fn close_tunnel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let tunnel = state
        .take_tunnel(&id)
        .ok_or_else(|| JobError::NotFound(format!("tunnel {id}")))?;
    tunnel.close().await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn nodes(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runtime().list_nodes().await?))
}

pub async fn maintenance(
    State(state): State<AppState>,
    Json(request): Json<MaintenanceRequest>,
) -> impl IntoResponse {
    state.manager.set_maintenance(request.paused);
    Json(serde_json::json!({ "paused": state.manager.is_paused() }))
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(GlobalConcurrencyLimitLayer::new(state.max_concurrent_requests));

    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/jobs", post(register_job))
        .route("/v1/jobs/create", post(create_job))
        .route("/v1/jobs/verify", post(verify_jobs))
        .route("/v1/jobs/{id}", delete(cancel_job))
        .route("/v1/jobs/{id}/extend", post(extend_job))
        .route("/v1/jobs/{id}/{rank}/logs", get(logs))
        .route("/v1/jobs/{id}/{rank}/shell", get(shell))
        .route("/v1/jobs/{id}/{rank}/tunnel", post(open_tunnel))
        .route("/v1/tunnels/{id}", delete(close_tunnel))
        .route("/v1/nodes", get(nodes))
        .route("/v1/maintenance", put(maintenance))
        .layer(middleware)
        .with_state(state)
}
