//! HTTP surface for the master, in standard axum idiom: a thin layer
//! of request/response DTOs and handlers over [`Farm`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use renderfarm_core::{RenderJob, SlaveInfoDto, SlaveStatus};

use crate::blobs::BlobError;
use crate::farm::{Farm, FarmError};

#[derive(Clone)]
pub struct AppState {
    pub farm: Arc<Farm>,
    pub blobs: Arc<crate::blobs::BlobStore>,
}

/// Caps the number of requests the server drives concurrently. Each
/// handler's critical section is brief (spec.md §5: "all contention is
/// brief"), but a farm with many slaves polling `get_job`/heartbeat at
/// once should still be bounded rather than spawning an unbounded
/// number of in-flight connections.
const MAX_CONCURRENT_REQUESTS: usize = 256;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/get_job", get(get_job))
        .route("/api/job_complete", post(job_complete))
        .route("/api/add_job", post(add_job))
        .route("/api/status", get(status))
        .route("/api/queue", get(queue))
        .route("/api/upload_files/{job_id}", post(upload_files))
        .route("/api/download_files/{job_id}", get(download_files))
        .route("/api/cleanup_files/{job_id}", delete(cleanup_files))
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .with_state(state)
}

fn peer_ip(addr: SocketAddr) -> String {
    addr.ip().to_string()
}

#[derive(Debug, Deserialize)]
struct PortQuery {
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    hostname: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    address: String,
}

async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let result = state.farm.register(&req.hostname, &peer_ip(addr), req.port);
    Json(RegisterResponse {
        address: result.address,
    })
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    status: SlaveStatus,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    cancel_jobs: Vec<String>,
    force_update: bool,
}

async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<PortQuery>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let result = state.farm.heartbeat(&peer_ip(addr), q.port, req.status);
    Json(HeartbeatResponse {
        cancel_jobs: result.cancel_jobs,
        force_update: result.force_update,
    })
}

async fn get_job(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<PortQuery>,
) -> Response {
    match state.farm.get_job(&peer_ip(addr), q.port) {
        Ok(job) => Json(job).into_response(),
        Err(FarmError::NotRegistered(_)) => StatusCode::FORBIDDEN.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct JobCompleteRequest {
    /// Echoed back in the request; the farm identifies the job via
    /// the caller's `active` entry (one job per slave per poll), so
    /// this is not consulted, only validated for shape.
    #[serde(default)]
    #[allow(dead_code)]
    job_id: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    cancelled: bool,
    #[serde(default)]
    error: String,
}

async fn job_complete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<PortQuery>,
    Json(req): Json<JobCompleteRequest>,
) -> StatusCode {
    // A report for a job the master no longer tracks (e.g. a slave that
    // was declared offline and then reappears) is still accepted, not
    // rejected — `Farm::job_complete` idles the slave either way.
    state
        .farm
        .job_complete(&peer_ip(addr), q.port, req.success, req.cancelled, &req.error);
    StatusCode::OK
}

/// Everything a caller may specify when submitting a job; runtime
/// fields (`status`, `progress`, ...) are never client-settable.
#[derive(Debug, Deserialize)]
struct AddJobRequest {
    project_file: String,
    #[serde(default)]
    output_path: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    options: String,
    #[serde(default)]
    layercomp: String,
    #[serde(default)]
    start_frame: Option<u32>,
    #[serde(default)]
    end_frame: Option<u32>,
    #[serde(default)]
    quiet: bool,
    #[serde(default)]
    compose_layers: bool,
    #[serde(default)]
    compose_reverse_order: bool,
    #[serde(default)]
    copy_images: bool,
    #[serde(default)]
    subfolder_project: bool,
    #[serde(default)]
    files_uploaded: bool,
}

#[derive(Debug, Serialize)]
struct AddJobResponse {
    id: String,
}

async fn add_job(State(state): State<AppState>, Json(req): Json<AddJobRequest>) -> Json<AddJobResponse> {
    let mut job = RenderJob::new(req.project_file);
    job.output_path = req.output_path.map(Into::into);
    if let Some(format) = req.format {
        job.format = format;
    }
    job.options = req.options;
    job.layercomp = req.layercomp;
    job.start_frame = req.start_frame;
    job.end_frame = req.end_frame;
    job.quiet = req.quiet;
    job.verbose = !req.quiet;
    job.compose_layers = req.compose_layers;
    job.compose_reverse_order = req.compose_reverse_order;
    job.copy_images = req.copy_images;
    job.subfolder_project = req.subfolder_project;
    job.files_uploaded = req.files_uploaded;

    let id = state.farm.add_job(job);
    Json(AddJobResponse { id })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    slaves: Vec<SlaveInfoDto>,
    pending: usize,
    active: usize,
    completed: usize,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let jobs = state.farm.get_all_farm_jobs();
    let slaves = state.farm.slaves().iter().map(SlaveInfoDto::from).collect();
    Json(StatusResponse {
        slaves,
        pending: jobs.pending.len() + jobs.reserved.len(),
        active: jobs.active.len(),
        completed: jobs.completed.len(),
    })
}

#[derive(Debug, Serialize)]
struct QueueResponse {
    pending: Vec<RenderJob>,
    reserved: Vec<RenderJob>,
    active: Vec<RenderJob>,
    completed: Vec<RenderJob>,
}

async fn queue(State(state): State<AppState>) -> Json<QueueResponse> {
    let jobs = state.farm.get_all_farm_jobs();
    Json(QueueResponse {
        pending: jobs.pending,
        reserved: jobs.reserved,
        active: jobs.active,
        completed: jobs.completed,
    })
}

async fn upload_files(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    mut multipart: Multipart,
) -> StatusCode {
    while let Ok(Some(field)) = multipart.next_field().await {
        let Ok(bytes) = field.bytes().await else {
            return StatusCode::BAD_REQUEST;
        };
        if state.blobs.store(&job_id, &bytes).is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        return StatusCode::OK;
    }
    StatusCode::BAD_REQUEST
}

async fn download_files(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.blobs.load(&job_id) {
        Ok(bytes) => bytes.into_response(),
        Err(BlobError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(BlobError::InvalidId(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(BlobError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn cleanup_files(State(state): State<AppState>, Path(job_id): Path<String>) -> StatusCode {
    match state.blobs.remove(&job_id) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
