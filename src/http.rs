//! # HTTP Façade
//!
//! Thin axum router over the lifecycle controller and connection manager.
//! Handlers only translate between JSON and the core calls; every failure is
//! rendered as `{status, message}` with a matching HTTP status code.
//!
//! ## Routes
//! - `GET  /scan` discover devices (`?timeout=<secs>`)
//! - `GET  /devices` live connections
//! - `POST /connect/:address`, `POST /disconnect/:address`
//! - `POST /start-test`, `POST /end-exercise`, `POST /end-test/:test_id`
//! - `GET  /tests/:test_id`, `DELETE /tests/:test_id`
//! - `GET  /download/:test_id` archive link, `GET /archive/:test_id` archive bytes

use crate::connection::{ConnectResponse, ConnectionInfo, ConnectionManager};
use crate::device::DiscoveredDevice;
use crate::error::{ConnectionError, ScanError, SessionError};
use crate::lifecycle::{EndExerciseResponse, EndTestResponse, LifecycleController, StartTestResponse};
use crate::session::{Exercise, NewTest, SessionSnapshot};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleController>,
    pub connections: Arc<ConnectionManager>,
    pub scan_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTestRequest {
    pub test_id: String,
    pub user_id: String,
    pub tester_id: String,
    pub exercise_type: String,
    pub exercise_name: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

impl From<StartTestRequest> for NewTest {
    fn from(request: StartTestRequest) -> Self {
        NewTest {
            test_id: request.test_id,
            user_id: request.user_id,
            tester_id: request.tester_id,
            exercise: Exercise::new(request.exercise_type, request.exercise_name),
            devices: request.devices,
        }
    }
}

/// Names the exercise that starts once the current one is closed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndExerciseRequest {
    pub test_id: String,
    pub exercise_type: String,
    pub exercise_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanParams {
    timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub download_url: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    code: StatusCode,
    tag: &'static str,
    message: String,
}

impl ApiError {
    fn new(code: StatusCode, tag: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            tag,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = StatusBody {
            status: self.tag,
            message: self.message,
        };
        (self.code, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let code = match &e {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Closed(_) => StatusCode::CONFLICT,
            SessionError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(code, e.status_tag(), e.to_string())
    }
}

impl From<ConnectionError> for ApiError {
    fn from(e: ConnectionError) -> Self {
        let code = match &e {
            ConnectionError::NotConnected(_) | ConnectionError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        ApiError::new(code, e.status_tag(), e.to_string())
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        ApiError::new(StatusCode::BAD_GATEWAY, "scan_failed", e.to_string())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scan", get(scan_devices))
        .route("/devices", get(list_devices))
        .route("/connect/:address", post(connect_device))
        .route("/disconnect/:address", post(disconnect_device))
        .route("/start-test", post(start_test))
        .route("/end-exercise", post(end_exercise))
        .route("/end-test/:test_id", post(end_test))
        .route("/tests/:test_id", get(get_test).delete(release_test))
        .route("/download/:test_id", get(download_link))
        .route("/archive/:test_id", get(download_archive))
        .with_state(state)
}

/// Serve `state` on `addr` until `shutdown` resolves.
pub async fn serve<F>(state: AppState, addr: &str, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn scan_devices(
    State(state): State<AppState>,
    Query(params): Query<ScanParams>,
) -> Result<Json<Vec<DiscoveredDevice>>, ApiError> {
    let timeout = params
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(state.scan_timeout);
    Ok(Json(state.connections.discover(timeout).await?))
}

async fn list_devices(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.connections.connected_devices())
}

async fn connect_device(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ConnectResponse>, ApiError> {
    Ok(Json(state.connections.connect(&address).await?))
}

async fn disconnect_device(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ConnectResponse>, ApiError> {
    Ok(Json(state.connections.disconnect(&address).await?))
}

async fn start_test(
    State(state): State<AppState>,
    Json(request): Json<StartTestRequest>,
) -> Json<StartTestResponse> {
    Json(state.lifecycle.start_test(request.into()))
}

async fn end_exercise(
    State(state): State<AppState>,
    Json(request): Json<EndExerciseRequest>,
) -> Result<Json<EndExerciseResponse>, ApiError> {
    let next = Exercise::new(request.exercise_type, request.exercise_name);
    Ok(Json(state.lifecycle.end_exercise(&request.test_id, next).await?))
}

async fn end_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<EndTestResponse>, ApiError> {
    Ok(Json(state.lifecycle.end_test(&test_id).await?))
}

async fn get_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.lifecycle.session_snapshot(&test_id)?))
}

async fn release_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<StatusBody>, ApiError> {
    state.lifecycle.release_test(&test_id)?;
    Ok(Json(StatusBody {
        status: "released",
        message: format!("Test {} released", test_id),
    }))
}

async fn download_link(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<DownloadResponse>, ApiError> {
    if !state.lifecycle.archive_ready(&test_id) {
        return Err(SessionError::NotFound(test_id).into());
    }
    Ok(Json(DownloadResponse {
        download_url: format!("/archive/{}", test_id),
    }))
}

async fn download_archive(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.lifecycle.archive_location(&test_id)?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "io_error",
            format!("Failed to read archive: {}", e),
        )
    })?;

    let disposition = format!("attachment; filename=\"{}_test_data.zip\"", test_id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}
