//! Task endpoints for external schedulers.
//!
//! Each call runs one handler and schedules its follow-ups. A non-2xx
//! response tells the scheduler to redeliver.

use axum::{
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use batchfleet_id::{JobId, OperationId, OrgId, PipelineId};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::{header_string, RequestContext, REQUEST_ID_HEADER};
use crate::state::AppState;
use crate::tasks::Task;

pub const TASK_TOKEN_HEADER: &str = "x-batchfleet-task-token";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks/pipelines/{pipeline_id}/start", post(start))
        .route("/tasks/pipelines/{pipeline_id}/close", post(close))
        .route("/tasks/pipelines/{pipeline_id}/subscribe", post(subscribe))
        .route("/tasks/operations/{operation_id}/watch", post(watch))
        .route("/tasks/jobs/{job_id}/publish", post(publish))
        .route("/tasks/orgs/{org_id}/admit", post(admit))
}

/// Proof that the caller presented the task token.
pub struct TaskCaller;

impl FromRequestParts<AppState> for TaskCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = header_string(&parts.headers, TASK_TOKEN_HEADER);
        match (state.task_token(), presented.as_deref()) {
            (Some(expected), Some(presented)) if expected == presented => Ok(Self),
            _ => {
                let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
                    .unwrap_or_else(|| "unknown".to_string());
                Err(
                    ApiError::forbidden("forbidden", "Missing or invalid task token")
                        .with_request_id(request_id),
                )
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub ok: bool,
    pub task: Task,
}

async fn run(state: &AppState, ctx: &RequestContext, task: Task) -> Result<Response, ApiError> {
    state
        .orchestrator()
        .dispatch(task)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(TaskResponse { ok: true, task }).into_response())
}

fn parse<T: std::str::FromStr>(raw: &str, ctx: &RequestContext) -> Result<T, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_id", format!("Invalid ID: {raw}"))
            .with_request_id(ctx.request_id.clone())
    })
}

async fn start(
    _caller: TaskCaller,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse(&pipeline_id, &ctx)?;
    run(&state, &ctx, Task::Start { pipeline_id }).await
}

async fn close(
    _caller: TaskCaller,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse(&pipeline_id, &ctx)?;
    run(&state, &ctx, Task::Close { pipeline_id }).await
}

async fn subscribe(
    _caller: TaskCaller,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(pipeline_id): Path<String>,
) -> Result<Response, ApiError> {
    let pipeline_id: PipelineId = parse(&pipeline_id, &ctx)?;
    run(&state, &ctx, Task::Subscribe { pipeline_id }).await
}

async fn watch(
    _caller: TaskCaller,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(operation_id): Path<String>,
) -> Result<Response, ApiError> {
    let operation_id: OperationId = parse(&operation_id, &ctx)?;
    run(&state, &ctx, Task::Watch { operation_id }).await
}

async fn publish(
    _caller: TaskCaller,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id: JobId = parse(&job_id, &ctx)?;
    run(&state, &ctx, Task::Publish { job_id }).await
}

async fn admit(
    _caller: TaskCaller,
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(org_id): Path<String>,
) -> Result<Response, ApiError> {
    let org_id: OrgId = parse(&org_id, &ctx)?;
    run(&state, &ctx, Task::Admit { org_id }).await
}
