//! In-memory fakes for the control plane's collaborators.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use batchfleet_control_plane::bus::{BusError, OutboundMessage, ProgressSource, Publisher, ReceivedMessage};
use batchfleet_control_plane::db::{MemoryStore, Store};
use batchfleet_control_plane::model::{
    Job, JobStatus, NewJob, NewOrganization, NewPipeline, OperationService, Organization, Pipeline,
    PipelineOperation, PipelineStatus, RemoteHandle, JOB_ID_ATTRIBUTE,
};
use batchfleet_control_plane::orchestrator::{Collaborators, Orchestrator, Settings};
use batchfleet_control_plane::remote::{GatewayError, Issued, RemoteGateway};
use batchfleet_control_plane::tasks::{Task, TaskError, TaskScheduler};
use batchfleet_id::{JobId, OperationId, OrgId, PipelineId, TaskId};
use batchfleet_reconcile::{OperationError, OperationStatus, RemoteOperation};
use chrono::{DateTime, Utc};

// =============================================================================
// Remote gateway
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeOperation {
    pub name: String,
    pub status: OperationStatus,
    pub errors: Vec<OperationError>,
}

impl RemoteOperation for FakeOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> OperationStatus {
        self.status
    }

    fn errors(&self) -> Vec<OperationError> {
        self.errors.clone()
    }
}

/// Records every call and keeps operations in memory. New operations start
/// `RUNNING` and stay there until [`FakeGateway::finish`] is called.
#[derive(Default)]
pub struct FakeGateway {
    operations: Mutex<HashMap<String, FakeOperation>>,
    latest: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    counter: AtomicU64,

    /// `create` reports the deployment as already existing.
    pub create_conflict: AtomicBool,

    /// `delete` reports the deployment as missing.
    pub delete_missing: AtomicBool,

    /// Every call fails with a transient error.
    pub unavailable: AtomicBool,

    /// `resize` yields for a while before answering.
    pub slow_resize: AtomicBool,
}

impl FakeGateway {
    fn issue(&self, verb: &str, pipeline: &Pipeline) -> Result<Issued, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transient("unavailable".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{verb}-{}-{n}", pipeline.name);
        let operation = FakeOperation {
            name: name.clone(),
            status: OperationStatus::Running,
            errors: Vec::new(),
        };
        self.operations
            .lock()
            .unwrap()
            .insert(name.clone(), operation.clone());
        self.latest
            .lock()
            .unwrap()
            .insert(pipeline.name.clone(), name.clone());
        Ok(Issued {
            handle: RemoteHandle {
                project_id: pipeline.project_id.clone(),
                zone: pipeline.zone.clone(),
                name,
            },
            operation: Box::new(operation),
        })
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Resolve an operation, failing it if `errors` is non-empty.
    pub fn finish(&self, name: &str, errors: Vec<OperationError>) {
        let mut operations = self.operations.lock().unwrap();
        let operation = operations.get_mut(name).expect("unknown operation");
        operation.status = OperationStatus::Done;
        operation.errors = errors;
    }

    /// Drop an operation so polling it reports not found.
    pub fn forget(&self, name: &str) {
        self.operations.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl RemoteGateway for FakeGateway {
    async fn create(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError> {
        self.record(format!("create:{}", pipeline.name));
        if self.create_conflict.load(Ordering::SeqCst) {
            return Err(GatewayError::AlreadyExists(pipeline.name.clone()));
        }
        self.issue("deploy", pipeline)
    }

    async fn delete(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError> {
        self.record(format!("delete:{}", pipeline.name));
        if self.delete_missing.load(Ordering::SeqCst) {
            return Err(GatewayError::NotFound(pipeline.name.clone()));
        }
        self.issue("delete", pipeline)
    }

    async fn resize(&self, pipeline: &Pipeline, size: u32) -> Result<Issued, GatewayError> {
        self.record(format!("resize:{}:{size}", pipeline.name));
        if self.slow_resize.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.issue("resize", pipeline)
    }

    async fn get(
        &self,
        _service: OperationService,
        handle: &RemoteHandle,
    ) -> Result<Box<dyn RemoteOperation>, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transient("unavailable".into()));
        }
        self.operations
            .lock()
            .unwrap()
            .get(&handle.name)
            .cloned()
            .map(|op| Box::new(op) as Box<dyn RemoteOperation>)
            .ok_or_else(|| GatewayError::NotFound(handle.name.clone()))
    }

    async fn latest_operation(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError> {
        self.record(format!("latest:{}", pipeline.name));
        let name = self
            .latest
            .lock()
            .unwrap()
            .get(&pipeline.name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(pipeline.name.clone()))?;
        let operation = self
            .operations
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.clone()))?;
        Ok(Issued {
            handle: RemoteHandle {
                project_id: pipeline.project_id.clone(),
                zone: pipeline.zone.clone(),
                name,
            },
            operation: Box::new(operation),
        })
    }
}

// =============================================================================
// Message bus
// =============================================================================

#[derive(Default)]
pub struct FakePublisher {
    published: Mutex<Vec<(String, OutboundMessage)>>,
    counter: AtomicU64,
    pub fail: AtomicBool,
    overtake: Mutex<Option<(Arc<MemoryStore>, JobStatus)>>,
}

impl FakePublisher {
    pub fn published(&self) -> Vec<(String, OutboundMessage)> {
        self.published.lock().unwrap().clone()
    }

    /// While the next publish is in flight, move the job to `status` as a
    /// worker report would.
    pub fn overtake_with(&self, store: Arc<MemoryStore>, status: JobStatus) {
        *self.overtake.lock().unwrap() = Some((store, status));
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(&self, topic: &str, message: &OutboundMessage) -> Result<String, BusError> {
        let overtake = self.overtake.lock().unwrap().take();
        if let Some((store, status)) = overtake {
            let job_id: JobId = message.attributes[JOB_ID_ATTRIBUTE].parse().unwrap();
            let mut job = store.get_job(&job_id).await.unwrap().unwrap();
            let from = job.status;
            job.status = status;
            assert!(store.update_job(&job, &[from]).await.unwrap());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BusError::Transient("publish rejected".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), message.clone()));
        Ok(format!("msg-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }
}

#[derive(Default)]
pub struct FakeProgressSource {
    queued: Mutex<HashMap<String, Vec<ReceivedMessage>>>,
    acked: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl FakeProgressSource {
    /// Queue a progress message on `subscription`.
    pub fn push(
        &self,
        subscription: &str,
        attributes: &[(&str, &str)],
        data: Option<&str>,
        publish_time: DateTime<Utc>,
    ) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let message = ReceivedMessage {
            ack_id: format!("ack-{n}"),
            message_id: format!("progress-{n}"),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            data: data.map(str::to_string),
            publish_time,
        };
        self.queued
            .lock()
            .unwrap()
            .entry(subscription.to_string())
            .or_default()
            .push(message);
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressSource for FakeProgressSource {
    async fn pull(&self, subscription: &str, max: u32) -> Result<Vec<ReceivedMessage>, BusError> {
        let mut queued = self.queued.lock().unwrap();
        let messages = queued.entry(subscription.to_string()).or_default();
        let take = messages.len().min(max as usize);
        Ok(messages.drain(..take).collect())
    }

    async fn acknowledge(&self, _subscription: &str, ack_ids: &[String]) -> Result<(), BusError> {
        self.acked.lock().unwrap().extend_from_slice(ack_ids);
        Ok(())
    }
}

// =============================================================================
// Task scheduler
// =============================================================================

/// Keeps scheduled tasks for the test to run explicitly.
#[derive(Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<(Task, DateTime<Utc>)>>,

    /// Reject `Publish` tasks as a closed queue would.
    pub reject_publish: AtomicBool,
}

impl RecordingScheduler {
    pub fn pending(&self) -> Vec<Task> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(task, _)| *task)
            .collect()
    }

    /// Remove and return tasks due within a second.
    pub fn take_due(&self) -> Vec<Task> {
        let horizon = Utc::now() + chrono::Duration::seconds(1);
        let mut scheduled = self.scheduled.lock().unwrap();
        let (due, later): (Vec<_>, Vec<_>) =
            scheduled.drain(..).partition(|(_, eta)| *eta <= horizon);
        *scheduled = later;
        due.into_iter().map(|(task, _)| task).collect()
    }

    /// Remove and return everything, regardless of ETA.
    pub fn take_all(&self) -> Vec<Task> {
        self.scheduled
            .lock()
            .unwrap()
            .drain(..)
            .map(|(task, _)| task)
            .collect()
    }
}

#[async_trait]
impl TaskScheduler for RecordingScheduler {
    async fn schedule(&self, task: Task, eta: DateTime<Utc>) -> Result<TaskId, TaskError> {
        if matches!(task, Task::Publish { .. }) && self.reject_publish.load(Ordering::SeqCst) {
            return Err(TaskError::QueueClosed);
        }
        self.scheduled.lock().unwrap().push((task, eta));
        Ok(TaskId::new())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub publisher: Arc<FakePublisher>,
    pub progress: Arc<FakeProgressSource>,
    pub scheduler: Arc<RecordingScheduler>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());
        let progress = Arc::new(FakeProgressSource::default());
        let scheduler = Arc::new(RecordingScheduler::default());

        let orchestrator = Arc::new(Orchestrator::new(
            Collaborators {
                store: store.clone(),
                gateway: gateway.clone(),
                publisher: publisher.clone(),
                progress: progress.clone(),
                scheduler: scheduler.clone(),
            },
            Settings {
                poll_interval: Duration::from_secs(30),
                publish_retry: Duration::from_secs(30),
            },
        ));

        Self {
            store,
            gateway,
            publisher,
            progress,
            scheduler,
            orchestrator,
        }
    }

    /// A second orchestrator over the same collaborators, as another
    /// replica of the service would run.
    pub fn replica(&self) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Collaborators {
                store: self.store.clone(),
                gateway: self.gateway.clone(),
                publisher: self.publisher.clone(),
                progress: self.progress.clone(),
                scheduler: self.scheduler.clone(),
            },
            Settings {
                poll_interval: Duration::from_secs(30),
                publish_retry: Duration::from_secs(30),
            },
        ))
    }

    pub async fn org(&self, token_budget: i64) -> Organization {
        self.orchestrator
            .create_organization(NewOrganization {
                name: "acme".to_string(),
                memo: String::new(),
                token_budget,
            })
            .await
            .unwrap()
    }

    /// Create a pipeline and schedule its follow-ups.
    pub async fn pipeline(&self, org_id: &OrgId, input: NewPipeline) -> Pipeline {
        let (pipeline, followups) = self
            .orchestrator
            .pipelines()
            .create(org_id, input)
            .await
            .unwrap();
        self.orchestrator.enqueue(followups).await.unwrap();
        pipeline
    }

    pub async fn job(&self, pipeline_id: &PipelineId, id_by_client: &str) -> Job {
        let (job, _, followups) = self
            .orchestrator
            .jobs()
            .create(
                pipeline_id,
                NewJob {
                    id_by_client: Some(id_by_client.to_string()),
                    message: Default::default(),
                    ready: true,
                },
            )
            .await
            .unwrap();
        self.orchestrator.enqueue(followups).await.unwrap();
        job
    }

    pub async fn cancel(&self, pipeline_id: &PipelineId) -> Pipeline {
        let (pipeline, followups) = self
            .orchestrator
            .pipelines()
            .cancel(pipeline_id)
            .await
            .unwrap();
        self.orchestrator.enqueue(followups).await.unwrap();
        pipeline
    }

    /// Run due tasks, and the tasks they schedule, until none are due.
    pub async fn settle(&self) {
        for _ in 0..100 {
            let due = self.scheduler.take_due();
            if due.is_empty() {
                return;
            }
            for task in due {
                self.orchestrator.dispatch(task).await.unwrap();
            }
        }
        panic!("tasks did not settle");
    }

    /// Run every scheduled task once, delayed ones included, then settle.
    pub async fn tick(&self) {
        for task in self.scheduler.take_all() {
            self.orchestrator.dispatch(task).await.unwrap();
        }
        self.settle().await;
    }

    pub async fn get(&self, pipeline_id: &PipelineId) -> Pipeline {
        self.store.get_pipeline(pipeline_id).await.unwrap().unwrap()
    }

    pub async fn status(&self, pipeline_id: &PipelineId) -> PipelineStatus {
        self.get(pipeline_id).await.status
    }

    pub async fn budget(&self, org_id: &OrgId) -> i64 {
        self.store
            .get_organization(org_id)
            .await
            .unwrap()
            .unwrap()
            .token_budget
    }

    pub async fn operations(&self, pipeline_id: &PipelineId) -> Vec<PipelineOperation> {
        self.store.list_operations(pipeline_id).await.unwrap()
    }

    /// Pretend nothing has touched the operation for `age`.
    pub async fn age_operation(&self, operation_id: &OperationId, age: Duration) {
        let mut op = self.store.get_operation(operation_id).await.unwrap().unwrap();
        op.updated_at = op.updated_at - chrono::Duration::from_std(age).unwrap();
        self.store.update_operation(&op).await.unwrap();
    }

    /// Number of scheduled `watch` tasks for the operation.
    pub fn pending_watches(&self, operation_id: &OperationId) -> usize {
        self.scheduler
            .pending()
            .into_iter()
            .filter(|task| *task == Task::Watch { operation_id: *operation_id })
            .count()
    }

    /// Name of the newest operation of `service` on the pipeline.
    pub async fn latest_operation(
        &self,
        pipeline_id: &PipelineId,
        service: OperationService,
    ) -> PipelineOperation {
        self.operations(pipeline_id)
            .await
            .into_iter()
            .rev()
            .find(|op| op.service == service)
            .expect("no operation")
    }

    /// Resolve the pipeline's pending deploy successfully and run the watch.
    pub async fn open(&self, pipeline_id: &PipelineId) {
        let op = self
            .latest_operation(pipeline_id, OperationService::Deploy)
            .await;
        self.gateway.finish(&op.handle.name, Vec::new());
        self.orchestrator
            .dispatch(Task::Watch {
                operation_id: op.id,
            })
            .await
            .unwrap();
        self.settle().await;
    }
}

/// A valid pipeline request with the given name and token cost.
pub fn new_pipeline(name: &str, token_consumption: i64) -> NewPipeline {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "project_id": "proj-1",
        "zone": "us-central1-a",
        "instance": {
            "machine_type": "n1-standard-1",
            "boot_disk": {
                "source_image": "https://www.googleapis.com/compute/v1/projects/cos-cloud/global/images/family/cos-stable"
            }
        },
        "container": { "image": "busybox", "size": 1 },
        "target_size": 2,
        "token_consumption": token_consumption,
    }))
    .unwrap()
}

pub fn remote_error(message: &str) -> OperationError {
    OperationError {
        code: "QUOTA_EXCEEDED".to_string(),
        location: String::new(),
        message: message.to_string(),
    }
}
