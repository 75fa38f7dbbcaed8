//! Health endpoints: `/healthz` and `/livez` answer while the process runs,
//! `/readyz` also requires the store to answer.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "control-plane";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub store: ComponentStatus,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResponse {
    fn report(healthy: bool, components: Option<ComponentHealth>) -> Self {
        Self {
            status: if healthy { "ok" } else { "degraded" },
            service: SERVICE,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Utc::now().to_rfc3339(),
            components,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse::report(true, None))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.orchestrator().store().ping().await {
        Ok(()) => ComponentStatus {
            status: "ok",
            message: None,
        },
        Err(e) => ComponentStatus {
            status: "unavailable",
            message: Some(e.to_string()),
        },
    };
    let ready = store.message.is_none();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse::report(
            ready,
            Some(ComponentHealth { store }),
        )),
    )
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_reports_ok_without_components() {
        let Json(body) = healthz().await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.service, SERVICE);
        assert!(body.components.is_none());
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        assert_eq!(livez().await, StatusCode::OK);
    }
}
