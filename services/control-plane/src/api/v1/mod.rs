//! API v1 routes.

mod jobs;
mod orgs;
mod pipelines;

use std::str::FromStr;

use axum::Router;
use serde::Serialize;
use tracing::warn;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;
use crate::tasks::Followup;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(orgs::routes())
        .merge(pipelines::routes())
        .merge(jobs::routes())
}

/// Response for list endpoints.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

fn parse_id<T: FromStr>(raw: &str, entity: &str, ctx: &RequestContext) -> Result<T, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request(
            format!("invalid_{entity}_id"),
            format!("Invalid {entity} ID format"),
        )
        .with_request_id(ctx.request_id.clone())
    })
}

/// Schedule the work a request produced.
///
/// The mutation is already persisted; a lost follow-up is recovered by the
/// refresh worker, so a scheduling failure does not fail the request.
async fn enqueue(state: &AppState, ctx: &RequestContext, followups: Vec<Followup>) {
    if let Err(e) = state.orchestrator().enqueue(followups).await {
        warn!(request_id = %ctx.request_id, error = %e, "Failed to schedule follow-up tasks");
    }
}
