//! Axum routes: the federation endpoint every party serves, plus the job API
//! of the scheduling party.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::{info, warn};

use crate::controller::JobController;
use crate::dag::DagSchema;
use crate::error::{Error, JobError};
use crate::federation::client::CommandService;
use crate::federation::protocol::{Command, FedRequest, FedResponse, RetCode};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn CommandService>,
    pub jobs: Arc<JobController>,
}

/// Build the router of one party.
pub fn routes(service: Arc<dyn CommandService>, jobs: Arc<JobController>) -> Router {
    let state = AppState { service, jobs };

    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/federation/{scope}/{action}", post(federation))
        .route("/v1/jobs", post(submit_job))
        .route("/v1/jobs/{job_id}", get(describe_job).delete(clean_job))
        .route("/v1/jobs/{job_id}/cancel", post(cancel_job))
        .route("/v1/jobs/{job_id}/rerun", post(rerun_job))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "fedflow"
    }))
}

// ── Federation ──────────────────────────────────────────────────────────

async fn federation(
    State(state): State<AppState>,
    Path((scope, action)): Path<(String, String)>,
    Json(request): Json<FedRequest>,
) -> impl IntoResponse {
    let Some(command) = Command::from_parts(&scope, &action) else {
        warn!(scope = %scope, action = %action, "Unknown federated command");
        return (
            StatusCode::NOT_FOUND,
            Json(FedResponse::error(
                RetCode::NotFound,
                format!("unknown command {scope}/{action}"),
            )),
        );
    };
    (StatusCode::OK, Json(state.service.handle(command, request).await))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn submit_job(State(state): State<AppState>, Json(dag): Json<DagSchema>) -> impl IntoResponse {
    match state.jobs.create_job(dag).await {
        Ok(job_id) => {
            info!(job_id = %job_id, "Job accepted");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"job_id": job_id, "status": "waiting"})),
            )
        }
        Err(e) => error_reply(e),
    }
}

async fn describe_job(State(state): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    match state.jobs.describe_job(&job_id).await {
        Ok(summary) => (StatusCode::OK, Json(serde_json::to_value(summary).unwrap_or_default())),
        Err(e) => error_reply(e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    match state.jobs.cancel_job(&job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"job_id": job_id, "status": "cancel_requested"})),
        ),
        Err(e) => error_reply(e),
    }
}

async fn rerun_job(State(state): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    match state.jobs.rerun_job(&job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"job_id": job_id, "status": "rerun_requested"})),
        ),
        Err(e) => error_reply(e),
    }
}

async fn clean_job(State(state): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    match state.jobs.clean_job(&job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"job_id": job_id, "status": "cleaned"})),
        ),
        Err(e) => error_reply(e),
    }
}

fn error_reply(error: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &error {
        Error::Dag(_) => StatusCode::BAD_REQUEST,
        Error::Job(JobError::NotFound { .. } | JobError::TaskNotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Job(JobError::NotTerminal { .. } | JobError::NotRerunnable { .. }) => StatusCode::CONFLICT,
        Error::Job(JobError::CreateFailed { .. } | JobError::FederationFailed { .. }) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": error.to_string()})))
}
