//! Job endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use batchfleet_id::JobId;

use super::{enqueue, parse_id};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::ProgressReport;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/ready", post(ready_job))
        .route("/jobs/{job_id}/progress", post(report_progress))
}

/// GET /v1/jobs/{job_id}
async fn get_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job", &ctx)?;
    let job = state
        .orchestrator()
        .jobs()
        .get(&job_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(job).into_response())
}

/// POST /v1/jobs/{job_id}/ready
async fn ready_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job", &ctx)?;
    let (job, followups) = state
        .orchestrator()
        .jobs()
        .get_ready(&job_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    enqueue(&state, &ctx, followups).await;
    Ok(Json(job).into_response())
}

/// POST /v1/jobs/{job_id}/progress
async fn report_progress(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
    body: Result<Json<ProgressReport>, JsonRejection>,
) -> Result<Response, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job", &ctx)?;
    let Json(report) = body.map_err(|e| ApiError::from_json_rejection(e, &ctx.request_id))?;

    let (job, followups) = state
        .orchestrator()
        .jobs()
        .report_progress(&job_id, report)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    enqueue(&state, &ctx, followups).await;
    Ok(Json(job).into_response())
}
