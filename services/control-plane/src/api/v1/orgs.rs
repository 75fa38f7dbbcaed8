//! Organization endpoints, plus the pipelines grouped under them.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use batchfleet_id::OrgId;

use super::{enqueue, parse_id, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{NewOrganization, NewPipeline};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orgs", post(create_org).get(list_orgs))
        .route("/orgs/{org_id}", get(get_org))
        .route(
            "/orgs/{org_id}/pipelines",
            post(create_pipeline).get(list_pipelines),
        )
}

/// POST /v1/orgs
async fn create_org(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Result<Json<NewOrganization>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(input) = body.map_err(|e| ApiError::from_json_rejection(e, &ctx.request_id))?;
    let org = state
        .orchestrator()
        .create_organization(input)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;

    tracing::info!(org_id = %org.id, request_id = %ctx.request_id, "Organization created");
    Ok((StatusCode::CREATED, Json(org)).into_response())
}

/// GET /v1/orgs
async fn list_orgs(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Response, ApiError> {
    let items = state
        .orchestrator()
        .list_organizations()
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(ListResponse { items }).into_response())
}

/// GET /v1/orgs/{org_id}
async fn get_org(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(org_id): Path<String>,
) -> Result<Response, ApiError> {
    let org_id: OrgId = parse_id(&org_id, "org", &ctx)?;
    let org = state
        .orchestrator()
        .get_organization(&org_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(org).into_response())
}

/// POST /v1/orgs/{org_id}/pipelines
async fn create_pipeline(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(org_id): Path<String>,
    body: Result<Json<NewPipeline>, JsonRejection>,
) -> Result<Response, ApiError> {
    let org_id: OrgId = parse_id(&org_id, "org", &ctx)?;
    let Json(input) = body.map_err(|e| ApiError::from_json_rejection(e, &ctx.request_id))?;

    let (pipeline, followups) = state
        .orchestrator()
        .pipelines()
        .create(&org_id, input)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    enqueue(&state, &ctx, followups).await;

    Ok((StatusCode::CREATED, Json(pipeline)).into_response())
}

/// GET /v1/orgs/{org_id}/pipelines
async fn list_pipelines(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(org_id): Path<String>,
) -> Result<Response, ApiError> {
    let org_id: OrgId = parse_id(&org_id, "org", &ctx)?;
    let items = state
        .orchestrator()
        .pipelines()
        .list(&org_id)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, &ctx.request_id))?;
    Ok(Json(ListResponse { items }).into_response())
}
