//! Google Cloud adapter: Deployment Manager for deployments, Compute Engine
//! for instance-group resizes.

use std::time::Duration;

use async_trait::async_trait;
use batchfleet_reconcile::{OperationError, OperationStatus, RemoteOperation};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{GatewayError, Issued, RemoteGateway};
use crate::model::{OperationService, Pipeline, RemoteHandle};

/// Endpoints and credentials for the Google APIs.
#[derive(Debug, Clone)]
pub struct GcpConfig {
    pub deployment_manager_url: String,
    pub compute_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            deployment_manager_url: "https://www.googleapis.com/deploymentmanager/v2".to_string(),
            compute_url: "https://compute.googleapis.com/compute/v1".to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<OperationError>,
}

/// Operation resource as both APIs return it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationBody {
    name: String,
    #[serde(default)]
    operation_type: String,
    status: String,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct DeploymentBody {
    operation: Option<OperationBody>,
}

fn parse_status(raw: &str) -> Result<OperationStatus, GatewayError> {
    OperationStatus::parse(raw).map_err(|e| GatewayError::Transient(e.to_string()))
}

/// Deployment Manager operation.
#[derive(Debug, Clone)]
pub struct DeploymentOperation {
    pub name: String,
    pub operation_type: String,
    status: OperationStatus,
    errors: Vec<OperationError>,
    end_time: Option<String>,
}

impl TryFrom<OperationBody> for DeploymentOperation {
    type Error = GatewayError;

    fn try_from(body: OperationBody) -> Result<Self, Self::Error> {
        Ok(Self {
            status: parse_status(&body.status)?,
            name: body.name,
            operation_type: body.operation_type,
            errors: body.error.unwrap_or_default().errors,
            end_time: body.end_time,
        })
    }
}

impl RemoteOperation for DeploymentOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> OperationStatus {
        self.status
    }

    fn errors(&self) -> Vec<OperationError> {
        self.errors.clone()
    }

    fn end_time(&self) -> Option<&str> {
        self.end_time.as_deref()
    }
}

/// Compute Engine zone operation.
#[derive(Debug, Clone)]
pub struct ComputeOperation {
    pub name: String,
    pub operation_type: String,
    status: OperationStatus,
    errors: Vec<OperationError>,
    end_time: Option<String>,
}

impl TryFrom<OperationBody> for ComputeOperation {
    type Error = GatewayError;

    fn try_from(body: OperationBody) -> Result<Self, Self::Error> {
        Ok(Self {
            status: parse_status(&body.status)?,
            name: body.name,
            operation_type: body.operation_type,
            errors: body.error.unwrap_or_default().errors,
            end_time: body.end_time,
        })
    }
}

impl RemoteOperation for ComputeOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> OperationStatus {
        self.status
    }

    fn errors(&self) -> Vec<OperationError> {
        self.errors.clone()
    }

    fn end_time(&self) -> Option<&str> {
        self.end_time.as_deref()
    }
}

/// [`RemoteGateway`] over the Google Cloud REST APIs.
pub struct GcpGateway {
    client: reqwest::Client,
    config: GcpConfig,
}

impl GcpGateway {
    pub fn new(config: GcpConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, GatewayError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(GatewayError::AlreadyExists(what.to_string())),
            _ => {
                warn!(status = %status, body = %body, what, "Remote call failed");
                Err(GatewayError::Transient(format!("{what}: {status}")))
            }
        }
    }

    fn deployments_url(&self, project_id: &str) -> String {
        format!(
            "{}/projects/{}/global/deployments",
            self.config.deployment_manager_url, project_id
        )
    }

    fn deployment_handle(pipeline: &Pipeline, operation: &DeploymentOperation) -> RemoteHandle {
        RemoteHandle {
            project_id: pipeline.project_id.clone(),
            zone: String::new(),
            name: operation.name.clone(),
        }
    }

    async fn deployment_call(
        &self,
        pipeline: &Pipeline,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Issued, GatewayError> {
        let body: OperationBody = self.send(request, what).await?;
        let operation = DeploymentOperation::try_from(body)?;
        Ok(Issued {
            handle: Self::deployment_handle(pipeline, &operation),
            operation: Box::new(operation),
        })
    }
}

#[async_trait]
impl RemoteGateway for GcpGateway {
    async fn create(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError> {
        let content = serde_json::to_string(&deployment_config(pipeline))
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        let body = json!({
            "name": pipeline.deployment(),
            "target": { "config": { "content": content } },
        });
        debug!(pipeline_id = %pipeline.id, deployment = pipeline.deployment(), "Inserting deployment");

        let request = self
            .request(Method::POST, &self.deployments_url(&pipeline.project_id))
            .json(&body);
        self.deployment_call(pipeline, request, "insert deployment").await
    }

    async fn delete(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError> {
        let url = format!(
            "{}/{}",
            self.deployments_url(&pipeline.project_id),
            pipeline.deployment()
        );
        debug!(pipeline_id = %pipeline.id, deployment = pipeline.deployment(), "Deleting deployment");

        let request = self.request(Method::DELETE, &url);
        self.deployment_call(pipeline, request, "delete deployment").await
    }

    async fn resize(&self, pipeline: &Pipeline, size: u32) -> Result<Issued, GatewayError> {
        let url = format!(
            "{}/projects/{}/zones/{}/instanceGroupManagers/{}/resize",
            self.config.compute_url,
            pipeline.project_id,
            pipeline.zone,
            pipeline.instance_group_name()
        );
        debug!(pipeline_id = %pipeline.id, size, "Resizing instance group");

        let request = self
            .request(Method::POST, &url)
            .query(&[("size", size)]);
        let body: OperationBody = self.send(request, "resize instance group").await?;
        let operation = ComputeOperation::try_from(body)?;
        Ok(Issued {
            handle: RemoteHandle {
                project_id: pipeline.project_id.clone(),
                zone: pipeline.zone.clone(),
                name: operation.name.clone(),
            },
            operation: Box::new(operation),
        })
    }

    async fn get(
        &self,
        service: OperationService,
        handle: &RemoteHandle,
    ) -> Result<Box<dyn RemoteOperation>, GatewayError> {
        match service {
            OperationService::Deploy | OperationService::Delete => {
                let url = format!(
                    "{}/projects/{}/global/operations/{}",
                    self.config.deployment_manager_url, handle.project_id, handle.name
                );
                let body: OperationBody = self
                    .send(self.request(Method::GET, &url), "get deployment operation")
                    .await?;
                Ok(Box::new(DeploymentOperation::try_from(body)?))
            }
            OperationService::Resize => {
                let url = format!(
                    "{}/projects/{}/zones/{}/operations/{}",
                    self.config.compute_url, handle.project_id, handle.zone, handle.name
                );
                let body: OperationBody = self
                    .send(self.request(Method::GET, &url), "get zone operation")
                    .await?;
                Ok(Box::new(ComputeOperation::try_from(body)?))
            }
        }
    }

    async fn latest_operation(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError> {
        let url = format!(
            "{}/{}",
            self.deployments_url(&pipeline.project_id),
            pipeline.deployment()
        );
        let deployment: DeploymentBody = self
            .send(self.request(Method::GET, &url), "get deployment")
            .await?;
        let body = deployment
            .operation
            .ok_or_else(|| GatewayError::NotFound("deployment operation".to_string()))?;
        let operation = DeploymentOperation::try_from(body)?;
        Ok(Issued {
            handle: Self::deployment_handle(pipeline, &operation),
            operation: Box::new(operation),
        })
    }
}

/// Resources for one pipeline: job and progress topics with their
/// subscriptions, an instance template and a managed instance group.
pub fn deployment_config(pipeline: &Pipeline) -> Value {
    let mut resources = Vec::new();
    for (kind, ack_deadline) in [("job", 600), ("progress", 30)] {
        let topic = format!("{}-{kind}-topic", pipeline.name);
        let subscription = format!("{}-{kind}-subscription", pipeline.name);
        resources.push(json!({
            "type": "pubsub.v1.topic",
            "name": topic,
            "properties": { "topic": topic },
        }));
        resources.push(json!({
            "type": "pubsub.v1.subscription",
            "name": subscription,
            "properties": {
                "subscription": subscription,
                "topic": format!("$(ref.{topic}.name)"),
                "ackDeadlineSeconds": ack_deadline,
            },
        }));
    }

    let instance = &pipeline.instance;
    let mut scheduling = json!({ "preemptible": instance.preemptible });
    let mut properties = json!({
        "machineType": instance.machine_type,
        "metadata": {
            "items": [
                { "key": "container-image", "value": pipeline.container.image },
                { "key": "container-size", "value": pipeline.container.size.to_string() },
                { "key": "container-command", "value": pipeline.container.command },
                { "key": "docker-run-options", "value": pipeline.container.docker_run_options },
                { "key": "job-subscription", "value": format!("{}-job-subscription", pipeline.name) },
                { "key": "progress-topic", "value": format!("{}-progress-topic", pipeline.name) },
                { "key": "stackdriver-agent", "value": instance.stackdriver_agent.to_string() },
            ],
        },
        "networkInterfaces": [{
            "network": format!(
                "https://www.googleapis.com/compute/v1/projects/{}/global/networks/default",
                pipeline.project_id
            ),
            "accessConfigs": [{ "name": "external-nat", "type": "ONE_TO_ONE_NAT" }],
        }],
        "serviceAccounts": [{
            "scopes": [
                "https://www.googleapis.com/auth/devstorage.full_control",
                "https://www.googleapis.com/auth/pubsub",
                "https://www.googleapis.com/auth/logging.write",
                "https://www.googleapis.com/auth/monitoring.write",
            ],
        }],
        "disks": [{
            "deviceName": "boot",
            "type": "PERSISTENT",
            "boot": true,
            "autoDelete": true,
            "initializeParams": {
                "sourceImage": instance.boot_disk.source_image,
                "diskSizeGb": instance.boot_disk.disk_size_gb,
                "diskType": instance.boot_disk.disk_type,
            },
        }],
    });
    if instance.gpu_accelerators.count > 0 {
        scheduling["onHostMaintenance"] = json!("TERMINATE");
        properties["guestAccelerators"] = json!([{
            "acceleratorCount": instance.gpu_accelerators.count,
            "acceleratorType": instance.gpu_accelerators.accelerator_type,
        }]);
    }
    properties["scheduling"] = scheduling;

    let template = format!("{}-it", pipeline.name);
    resources.push(json!({
        "type": "compute.v1.instanceTemplate",
        "name": template,
        "properties": { "zone": pipeline.zone, "properties": properties },
    }));
    resources.push(json!({
        "type": "compute.v1.instanceGroupManager",
        "name": pipeline.instance_group_name(),
        "properties": {
            "baseInstanceName": format!("{}-instance", pipeline.name),
            "instanceTemplate": format!("$(ref.{template}.selfLink)"),
            "targetSize": pipeline.target_size,
            "zone": pipeline.zone,
        },
    }));

    json!({ "resources": resources })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pipeline::fixtures::new_pipeline;
    use batchfleet_id::OrgId;

    #[test]
    fn test_operation_body_with_errors() {
        let body: OperationBody = serde_json::from_value(json!({
            "name": "operation-1",
            "operationType": "insert",
            "status": "DONE",
            "error": { "errors": [{ "code": "QUOTA_EXCEEDED", "message": "no cpus" }] },
        }))
        .unwrap();
        let op = DeploymentOperation::try_from(body).unwrap();
        assert_eq!(op.status(), OperationStatus::Done);
        assert_eq!(op.errors().len(), 1);
        assert_eq!(op.errors()[0].code, "QUOTA_EXCEEDED");
        assert_eq!(op.errors()[0].location, "");
    }

    #[test]
    fn test_unknown_status_is_transient() {
        let body: OperationBody =
            serde_json::from_value(json!({ "name": "operation-1", "status": "EXPLODED" })).unwrap();
        assert!(matches!(
            ComputeOperation::try_from(body),
            Err(GatewayError::Transient(_))
        ));
    }

    #[test]
    fn test_deployment_config_resources() {
        let mut input = new_pipeline("pipeline-1");
        input.instance.gpu_accelerators.count = 1;
        let pipeline = Pipeline::new(OrgId::new(), input);
        let config = deployment_config(&pipeline);

        let resources = config["resources"].as_array().unwrap();
        let names: Vec<&str> = resources
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "pipeline-1-job-topic",
                "pipeline-1-job-subscription",
                "pipeline-1-progress-topic",
                "pipeline-1-progress-subscription",
                "pipeline-1-it",
                "pipeline-1-igm",
            ]
        );
        let it = &resources[4]["properties"]["properties"];
        assert_eq!(it["scheduling"]["onHostMaintenance"], "TERMINATE");
        assert_eq!(resources[5]["properties"]["targetSize"], 2);
    }
}
