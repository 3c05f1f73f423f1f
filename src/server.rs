//! HTTP surface of the daemon. Handlers validate untrusted ids and names
//! before any disk access and translate `BerthError` into stable status
//! codes with JSON error bodies.

use crate::archive::ArchiveManager;
use crate::config::Config;
use crate::deploy::{DeploySpec, EditSpec, Orchestrator};
use crate::error::{BerthError, Result};
use crate::install::{InstallScript, VariableInput};
use crate::locks::InstanceLocks;
use crate::paths;
use crate::runtime::ContainerRuntime;
use crate::state::StateStore;
use crate::volume::VolumeManager;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<dyn StateStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub volumes: Arc<VolumeManager>,
    pub archives: Arc<ArchiveManager>,
    pub orchestrator: Orchestrator,
    pub locks: Arc<InstanceLocks>,
}

impl IntoResponse for BerthError {
    fn into_response(self) -> Response {
        let status = match &self {
            BerthError::Validation(_) => StatusCode::BAD_REQUEST,
            BerthError::OutsideRoot(_) => StatusCode::FORBIDDEN,
            BerthError::NotFound(_) => StatusCode::NOT_FOUND,
            BerthError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BerthError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BerthError::PartialFailure { .. }
            | BerthError::Runtime(_)
            | BerthError::Io(_)
            | BerthError::Http(_)
            | BerthError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("[Server] Request failed: {}", self);
        }

        let body = serde_json::json!({
            "error": self.category(),
            "detail": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/instances", post(deploy_instance).get(list_instances))
        .route("/instances/:id", get(inspect_instance).delete(delete_instance))
        .route("/instances/:id/redeploy", post(redeploy_instance))
        .route("/instances/:id/reinstall", post(reinstall_instance))
        .route("/instances/:id/edit", post(edit_instance))
        .route("/instances/:id/rename", post(rename_instance))
        .route("/instances/:id/state", get(instance_state))
        .route("/instances/:id/power/:action", post(power_action))
        .route("/instances/:id/disk-usage", get(disk_usage))
        .route("/instances/:id/archives", post(create_archive).get(list_archives))
        .route(
            "/instances/:id/archives/:name",
            get(download_archive).delete(delete_archive),
        )
        .route("/instances/:id/rollback", post(rollback_instance))
        .route("/health", get(health))
        .with_state(app_state)
}

/// Bind and serve until the listener fails.
pub async fn start_server(config: &Config, app_state: AppState) -> Result<()> {
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BerthError::Runtime(format!("failed to bind {}: {}", addr, e)))?;

    info!("[Server] Listening on {}", addr);
    let app = build_router(app_state);
    axum::serve(listener, app)
        .await
        .map_err(|e| BerthError::Runtime(format!("server error: {}", e)))?;
    Ok(())
}

#[derive(Serialize)]
struct DeployResponse {
    container_id: String,
}

async fn deploy_instance(
    State(state): State<AppState>,
    Json(spec): Json<DeploySpec>,
) -> Result<Json<DeployResponse>> {
    let container_id = state.orchestrator.deploy(spec).await?;
    Ok(Json(DeployResponse { container_id }))
}

async fn redeploy_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut spec): Json<DeploySpec>,
) -> Result<Json<DeployResponse>> {
    spec.id = id;
    let container_id = state.orchestrator.redeploy(spec).await?;
    Ok(Json(DeployResponse { container_id }))
}

#[derive(Deserialize)]
struct ReinstallRequest {
    #[serde(default)]
    scripts: Vec<InstallScript>,
    #[serde(default)]
    variables: Option<VariableInput>,
    /// Wipe the volume before re-running the install pipeline.
    #[serde(default)]
    clear_volume: bool,
}

async fn reinstall_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReinstallRequest>,
) -> Result<StatusCode> {
    state
        .orchestrator
        .reinstall(&id, request.scripts, request.variables, request.clear_volume)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn edit_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(edit): Json<EditSpec>,
) -> Result<Json<DeployResponse>> {
    let container_id = state.orchestrator.edit(&id, edit).await?;
    Ok(Json(DeployResponse { container_id }))
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
}

/// Thin runtime passthrough: the container is renamed in place, nothing
/// else (volume, archives, state record) moves with it.
async fn rename_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<StatusCode> {
    paths::validate_identifier(&id)?;
    paths::validate_identifier(&request.name)?;
    let _guard = state.locks.acquire(&id).await;
    state.runtime.rename(&id, &request.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.orchestrator.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    all: bool,
}

async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Response> {
    let containers = state.runtime.list(query.all).await?;
    Ok(Json(containers).into_response())
}

async fn inspect_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    paths::validate_identifier(&id)?;
    let info = state.runtime.inspect(&id).await?;
    Ok(Json(info).into_response())
}

#[derive(Serialize)]
struct StateResponse {
    id: String,
    state: String,
}

async fn instance_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StateResponse>> {
    paths::validate_identifier(&id)?;
    let current = state
        .state
        .get(&id)
        .await?
        .ok_or_else(|| BerthError::NotFound(format!("no state record for '{}'", id)))?;
    Ok(Json(StateResponse {
        id,
        state: current.to_string(),
    }))
}

async fn power_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Result<StatusCode> {
    paths::validate_identifier(&id)?;
    let _guard = state.locks.acquire(&id).await;
    match action.as_str() {
        "start" => state.runtime.start(&id).await?,
        "stop" => state.runtime.stop(&id).await?,
        "kill" => state.runtime.kill(&id).await?,
        "restart" => state.runtime.restart(&id).await?,
        other => {
            return Err(BerthError::Validation(format!(
                "unknown power action '{}'",
                other
            )))
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct DiskUsageResponse {
    id: String,
    bytes: u64,
    human: String,
}

async fn disk_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DiskUsageResponse>> {
    let bytes = state.volumes.tree_size(&id).await?;
    Ok(Json(DiskUsageResponse {
        human: crate::archive::human_size(bytes),
        id,
        bytes,
    }))
}

async fn create_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let _guard = state.locks.acquire(&id).await;
    let volume_dir = state.volumes.path(&id)?;
    let entry = state.archives.create(&id, &volume_dir).await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn list_archives(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let entries = state.archives.list(&id).await?;
    Ok(Json(entries).into_response())
}

async fn download_archive(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Response> {
    let (file, length) = state.archives.open_for_download(&id, &name).await?;

    // Streaming body: a client disconnect drops the stream mid-read and
    // the transfer stops there.
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", name),
        )
        .body(body)
        .map_err(|e| BerthError::Runtime(format!("failed to build response: {}", e)))?;
    Ok(response)
}

async fn delete_archive(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.archives.delete(&id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RollbackRequest {
    #[serde(default)]
    volume_id: Option<String>,
    archive: String,
}

async fn rollback_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<StatusCode> {
    paths::validate_identifier(&id)?;
    let volume_id = request.volume_id.unwrap_or_else(|| id.clone());
    let _guard = state.locks.acquire(&id).await;
    crate::rollback::rollback(&state.archives, &state.volumes, &id, &volume_id, &request.archive)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
