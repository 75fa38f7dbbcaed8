mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use batchfleet_control_plane::{api, model::PipelineStatus, state::AppState};
use common::Harness;
use serde_json::{json, Value};
use tower::ServiceExt;

const TASK_TOKEN: &str = "task-secret";

fn router(h: &Harness) -> Router {
    api::create_router(AppState::new(
        h.orchestrator.clone(),
        Some(TASK_TOKEN.to_string()),
    ))
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value, Option<String>) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body, content_type)
}

fn pipeline_body(name: &str, tokens: i64) -> Value {
    json!({
        "name": name,
        "project_id": "proj-1",
        "zone": "us-central1-a",
        "instance": {
            "machine_type": "n1-standard-1",
            "boot_disk": { "source_image": "projects/cos-cloud/global/images/family/cos-stable" }
        },
        "container": { "image": "busybox", "size": 1 },
        "target_size": 1,
        "token_consumption": tokens
    })
}

async fn create_org(app: &Router, budget: i64) -> String {
    let (status, body, _) = call(
        app,
        Method::POST,
        "/v1/orgs",
        Some(json!({ "name": "acme", "token_budget": budget })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = Harness::new();
    let app = router(&h);

    let (status, body, _) = call(&app, Method::GET, "/healthz", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body, _) = call(&app, Method::GET, "/readyz", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["components"]["store"]["status"], "ok");

    let (status, _, _) = call(&app, Method::GET, "/livez", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_org_crud() {
    let h = Harness::new();
    let app = router(&h);

    let org_id = create_org(&app, 10).await;

    let (status, body, _) = call(&app, Method::GET, &format!("/v1/orgs/{org_id}"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_budget"], 10);

    let (status, body, _) = call(&app, Method::GET, "/v1/orgs", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_errors_are_problem_details() {
    let h = Harness::new();
    let app = router(&h);

    let (status, body, content_type) = call(
        &app,
        Method::GET,
        "/v1/orgs/not-an-id",
        None,
        &[("x-request-id", "req-123")],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(content_type.as_deref(), Some("application/problem+json"));
    assert_eq!(body["code"], "invalid_org_id");
    assert_eq!(body["request_id"], "req-123");

    let missing = batchfleet_id::OrgId::new();
    let (status, body, _) =
        call(&app, Method::GET, &format!("/v1/orgs/{missing}"), None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "organization_not_found");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_invalid_pipeline_is_rejected_with_fields() {
    let h = Harness::new();
    let app = router(&h);
    let org_id = create_org(&app, 10).await;

    let mut body = pipeline_body("Bad_Name", 1);
    body["target_size"] = json!(0);
    let (status, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/orgs/{org_id}/pipelines"),
        Some(body),
        &[],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_failed");
    let mut fields: Vec<_> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap().to_string())
        .collect();
    fields.sort();
    assert_eq!(fields, vec!["name", "target_size"]);

    let (_, body, _) = call(
        &app,
        Method::GET,
        &format!("/v1/orgs/{org_id}/pipelines"),
        None,
        &[],
    )
    .await;
    assert!(body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_out_of_range_pulling_interval_is_rejected() {
    let h = Harness::new();
    let app = router(&h);
    let org_id = create_org(&app, 10).await;

    let mut body = pipeline_body("render", 1);
    body["pulling"] = json!({ "interval_seconds": 0 });
    let (status, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/orgs/{org_id}/pipelines"),
        Some(body),
        &[],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let fields: Vec<_> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(fields, vec!["pulling.interval_seconds"]);
}

#[tokio::test]
async fn test_pipeline_lifecycle_over_http() {
    let h = Harness::new();
    let app = router(&h);
    let org_id = create_org(&app, 10).await;

    let (status, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/orgs/{org_id}/pipelines"),
        Some(pipeline_body("render", 4)),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "reserved");
    let pipeline_id = body["id"].as_str().unwrap().to_string();

    // Destroying a live pipeline is refused.
    let (status, body, _) = call(
        &app,
        Method::DELETE,
        &format!("/v1/pipelines/{pipeline_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_operation");

    let (status, body, _) = call(
        &app,
        Method::PUT,
        &format!("/v1/pipelines/{pipeline_id}/close"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");
    assert_eq!(body["cancelled"], true);

    let (_, body, _) = call(&app, Method::GET, &format!("/v1/orgs/{org_id}"), None, &[]).await;
    assert_eq!(body["token_budget"], 10);

    let (status, body, _) = call(
        &app,
        Method::DELETE,
        &format!("/v1/pipelines/{pipeline_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_task_endpoints_require_token() {
    let h = Harness::new();
    let app = router(&h);
    let org_id = create_org(&app, 10).await;
    let (_, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/orgs/{org_id}/pipelines"),
        Some(pipeline_body("render", 4)),
        &[],
    )
    .await;
    let pipeline_id = body["id"].as_str().unwrap().to_string();
    let uri = format!("/tasks/pipelines/{pipeline_id}/start");

    let (status, body, _) = call(&app, Method::POST, &uri, None, &[]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, _, _) = call(
        &app,
        Method::POST,
        &uri,
        None,
        &[("x-batchfleet-task-token", "wrong")],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body, _) = call(
        &app,
        Method::POST,
        &uri,
        None,
        &[("x-batchfleet-task-token", TASK_TOKEN)],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["task"]["kind"], "start");

    let pipeline_id = pipeline_id.parse().unwrap();
    assert_eq!(h.status(&pipeline_id).await, PipelineStatus::Deploying);
}

#[tokio::test]
async fn test_job_create_and_progress() {
    let h = Harness::new();
    let app = router(&h);
    let org_id = create_org(&app, 10).await;
    let (_, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/orgs/{org_id}/pipelines"),
        Some(pipeline_body("render", 4)),
        &[],
    )
    .await;
    let pipeline_id = body["id"].as_str().unwrap().to_string();
    let jobs_uri = format!("/v1/pipelines/{pipeline_id}/jobs");

    let job = json!({ "id_by_client": "frame-1", "message": { "data": "aGVsbG8=" } });
    let (status, body, _) = call(&app, Method::POST, &jobs_uri, Some(job.clone()), &[]).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "Ready");
    let job_id = body["id"].as_str().unwrap().to_string();

    let (status, body, _) = call(&app, Method::POST, &jobs_uri, Some(job), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], job_id.as_str());

    let (status, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/jobs/{job_id}/progress"),
        Some(json!({
            "step": "EXECUTING",
            "step_status": "STARTING",
            "host": "worker-1"
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Ready");
    assert_eq!(body["hostname"], "worker-1");

    let (status, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/jobs/{job_id}/progress"),
        Some(json!({ "step": "ACKSENDING", "step_status": "SUCCESS", "completed": true })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Success");

    let (status, body, _) = call(
        &app,
        Method::POST,
        &format!("/v1/jobs/{job_id}/progress"),
        Some(json!({ "step": "BOGUS", "step_status": "SUCCESS" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_body");

    let (_, body, _) = call(&app, Method::GET, &jobs_uri, None, &[]).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}
