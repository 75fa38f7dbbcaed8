//! Pipeline endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use batchfleet_id::PipelineId;
use serde::Deserialize;

use super::{enqueue, parse_id, DeleteResponse, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::NewJob;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/pipelines/{pipeline_id}",
            get(get_pipeline).delete(delete_pipeline),
        )
        .route("/pipelines/{pipeline_id}/close", put(close_pipeline))
        .route("/pipelines/{pipeline_id}/resize", put(resize_pipeline))
        .route("/pipelines/{pipeline_id}/operations", get(list_operations))
        .route(
            "/pipelines/{pipeline_id}/jobs",
            post(create_job).get(list_jobs),
        )
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub size: u32,
}

/// GET /v1/pipelines/{pipeline_id}
async fn get_pipeline(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline", &ctx)?;
    let pipeline = state
        .orchestrator()
        .pipelines()
        .get(&pipeline_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(pipeline).into_response())
}

/// PUT /v1/pipelines/{pipeline_id}/close
///
/// Cancels the pipeline; the response shows the status at the time of the
/// call, and teardown continues asynchronously.
async fn close_pipeline(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline", &ctx)?;
    let (pipeline, followups) = state
        .orchestrator()
        .pipelines()
        .cancel(&pipeline_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    enqueue(&state, &ctx, followups).await;
    Ok(Json(pipeline).into_response())
}

/// PUT /v1/pipelines/{pipeline_id}/resize
async fn resize_pipeline(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
    body: Result<Json<ResizeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline", &ctx)?;
    let Json(req) = body.map_err(|e| ApiError::from_json_rejection(e, &ctx.request_id))?;
    if req.size == 0 {
        return Err(
            ApiError::bad_request("invalid_size", "size must be at least 1")
                .with_request_id(ctx.request_id),
        );
    }

    let (operation, followups) = state
        .orchestrator()
        .lifecycle()
        .resize(&pipeline_id, req.size)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    enqueue(&state, &ctx, followups).await;
    Ok((StatusCode::ACCEPTED, Json(operation)).into_response())
}

/// DELETE /v1/pipelines/{pipeline_id}
async fn delete_pipeline(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline", &ctx)?;
    state
        .orchestrator()
        .pipelines()
        .destroy(&pipeline_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(DeleteResponse { ok: true }).into_response())
}

/// GET /v1/pipelines/{pipeline_id}/operations
async fn list_operations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline", &ctx)?;
    let items = state
        .orchestrator()
        .pipelines()
        .operations(&pipeline_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(ListResponse { items }).into_response())
}

/// POST /v1/pipelines/{pipeline_id}/jobs
///
/// Returns 201 for a new job and 200 when `id_by_client` matched an
/// existing one.
async fn create_job(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
    body: Result<Json<NewJob>, JsonRejection>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline", &ctx)?;
    let Json(input) = body.map_err(|e| ApiError::from_json_rejection(e, &ctx.request_id))?;

    let (job, created, followups) = state
        .orchestrator()
        .jobs()
        .create(&pipeline_id, input)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    enqueue(&state, &ctx, followups).await;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(job)).into_response())
}

/// GET /v1/pipelines/{pipeline_id}/jobs
async fn list_jobs(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse_id(&pipeline_id, "pipeline", &ctx)?;
    let items = state
        .orchestrator()
        .jobs()
        .list(&pipeline_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(ListResponse { items }).into_response())
}
