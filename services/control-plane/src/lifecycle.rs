//! Pipeline lifecycle: provision, open, resize and tear down pipelines by
//! issuing remote operations and polling them to resolution.
//!
//! Every handler guards on the pipeline status it expects and returns
//! success without side effects when the guard does not match, so
//! redelivered tasks are harmless.

use std::sync::Arc;
use std::time::Duration;

use batchfleet_id::{OperationId, PipelineId};
use batchfleet_reconcile::{OperationError, Verdict};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::admission::Admission;
use crate::db::Store;
use crate::error::{OrchestratorError, Result};
use crate::model::{JobStatus, OperationService, Pipeline, PipelineOperation, PipelineStatus};
use crate::remote::{Issued, RemoteGateway};
use crate::tasks::{Followup, Task};

/// Poll intervals without progress after which an operation's watch is
/// presumed lost.
const STALE_POLLS: u32 = 3;

pub struct Lifecycle {
    store: Arc<dyn Store>,
    gateway: Arc<dyn RemoteGateway>,
    admission: Arc<Admission>,
    poll_interval: Duration,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn RemoteGateway>,
        admission: Arc<Admission>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            admission,
            poll_interval,
        }
    }

    fn watch(&self, operation: &PipelineOperation) -> Followup {
        Followup::now(Task::Watch {
            operation_id: operation.id,
        })
    }

    async fn record(
        &self,
        pipeline: &Pipeline,
        service: OperationService,
        issued: Issued,
        message: &str,
    ) -> Result<PipelineOperation> {
        let operation = PipelineOperation::started(
            pipeline.id,
            service,
            issued.handle,
            issued.operation.as_ref(),
            message,
        );
        self.store.insert_operation(&operation).await?;
        Ok(operation)
    }

    async fn unresolved_operation(
        &self,
        pipeline_id: &PipelineId,
        service: OperationService,
    ) -> Result<Option<PipelineOperation>> {
        Ok(self
            .store
            .list_operations(pipeline_id)
            .await?
            .into_iter()
            .rev()
            .find(|op| op.service == service && !op.is_resolved()))
    }

    /// Provision a `Reserved` pipeline.
    ///
    /// A pipeline already `Building` is resumed: a deploy operation stored
    /// by an earlier attempt is reused, and a deployment that already
    /// exists remotely is adopted.
    #[instrument(skip(self), fields(pipeline_id = %pipeline_id))]
    pub async fn start(&self, pipeline_id: &PipelineId) -> Result<Vec<Followup>> {
        let Some(mut pipeline) = self.store.get_pipeline(pipeline_id).await? else {
            warn!("Pipeline not found; dropping start");
            return Ok(Vec::new());
        };

        match pipeline.status {
            PipelineStatus::Reserved => {
                pipeline.status = PipelineStatus::Building;
                if !self
                    .store
                    .update_pipeline(&pipeline, &[PipelineStatus::Reserved])
                    .await?
                {
                    debug!("Pipeline left Reserved concurrently; skipping start");
                    return Ok(Vec::new());
                }
            }
            PipelineStatus::Building => {
                if let Some(operation) = self
                    .unresolved_operation(pipeline_id, OperationService::Deploy)
                    .await?
                {
                    info!(operation_id = %operation.id, "Resuming start with stored operation");
                    return self.enter_deploying(pipeline, operation).await;
                }
            }
            status => {
                debug!(%status, "Pipeline not reserved; skipping start");
                return Ok(Vec::new());
            }
        }

        let operation = match self.gateway.create(&pipeline).await {
            Ok(issued) => {
                self.record(&pipeline, OperationService::Deploy, issued, "start")
                    .await?
            }
            Err(e) if e.is_already_exists() => {
                info!("Deployment already exists; adopting its latest operation");
                match self
                    .unresolved_operation(pipeline_id, OperationService::Deploy)
                    .await?
                {
                    Some(operation) => operation,
                    None => {
                        let issued = self.gateway.latest_operation(&pipeline).await?;
                        self.record(&pipeline, OperationService::Deploy, issued, "adopted")
                            .await?
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.enter_deploying(pipeline, operation).await
    }

    async fn enter_deploying(
        &self,
        mut pipeline: Pipeline,
        operation: PipelineOperation,
    ) -> Result<Vec<Followup>> {
        pipeline.deployment_name = Some(pipeline.deployment().to_string());
        pipeline.status = PipelineStatus::Deploying;
        if !self
            .store
            .update_pipeline(&pipeline, &[PipelineStatus::Building])
            .await?
        {
            debug!("Pipeline left Building concurrently");
            return Ok(Vec::new());
        }
        info!(operation_id = %operation.id, "Pipeline deploying");
        Ok(vec![self.watch(&operation)])
    }

    /// Poll one operation and act on the result.
    #[instrument(skip(self), fields(operation_id = %operation_id))]
    pub async fn watch_operation(&self, operation_id: &OperationId) -> Result<Vec<Followup>> {
        let Some(mut operation) = self.store.get_operation(operation_id).await? else {
            warn!("Operation not found; dropping watch");
            return Ok(Vec::new());
        };
        let Some(pipeline) = self.store.get_pipeline(&operation.pipeline_id).await? else {
            warn!("Pipeline not found; dropping watch");
            return Ok(Vec::new());
        };

        let expected = operation.service.expected_pipeline_status();
        if pipeline.status != expected || operation.is_resolved() {
            debug!(status = %pipeline.status, "Duplicate watch; nothing to do");
            return Ok(Vec::new());
        }

        if !operation.is_issued() {
            warn!("Operation was claimed but never issued; abandoning");
            operation.resolve_unpolled("never issued");
            self.store.update_operation(&operation).await?;
            return Ok(Vec::new());
        }

        let remote = match self.gateway.get(operation.service, &operation.handle).await {
            Ok(remote) => remote,
            Err(e) if e.is_not_found() && operation.service == OperationService::Delete => {
                info!("Delete operation not found; resource is gone");
                operation.resolve_unpolled("not found");
                return self.closed(&pipeline, &operation).await;
            }
            Err(e) => return Err(e.into()),
        };

        match operation.record_poll(remote.as_ref()) {
            Verdict::InProgress { status_changed } => {
                if status_changed {
                    debug!(status = %operation.remote_status, "Operation status changed");
                }
                self.store.update_operation(&operation).await?;
                Ok(vec![Followup::after(
                    Task::Watch {
                        operation_id: operation.id,
                    },
                    self.poll_interval,
                )])
            }
            Verdict::Succeeded => self.succeeded(pipeline, operation).await,
            Verdict::Failed(errors) => self.failed(pipeline, operation, errors).await,
        }
    }

    async fn succeeded(
        &self,
        mut pipeline: Pipeline,
        operation: PipelineOperation,
    ) -> Result<Vec<Followup>> {
        match operation.service {
            OperationService::Deploy => {
                pipeline.status = PipelineStatus::Opened;
                if !self
                    .store
                    .update_pipeline(&pipeline, &[PipelineStatus::Deploying])
                    .await?
                {
                    return Ok(Vec::new());
                }
                self.store.update_operation(&operation).await?;
                info!(pipeline_id = %pipeline.id, "Pipeline opened");
                self.open_followups(&pipeline.id).await
            }
            OperationService::Delete => self.closed(&pipeline, &operation).await,
            OperationService::Resize => {
                if let Some(size) = operation.target_size {
                    pipeline.target_size = size;
                }
                if !self
                    .store
                    .update_pipeline(&pipeline, &[PipelineStatus::Opened])
                    .await?
                {
                    return Ok(Vec::new());
                }
                self.store.update_operation(&operation).await?;
                info!(pipeline_id = %pipeline.id, target_size = pipeline.target_size, "Pipeline resized");
                Ok(Vec::new())
            }
        }
    }

    async fn failed(
        &self,
        mut pipeline: Pipeline,
        operation: PipelineOperation,
        errors: Vec<OperationError>,
    ) -> Result<Vec<Followup>> {
        let (from, to) = match operation.service {
            OperationService::Deploy => (PipelineStatus::Deploying, PipelineStatus::Broken),
            OperationService::Delete => (PipelineStatus::Closing, PipelineStatus::ClosingError),
            OperationService::Resize => {
                warn!(pipeline_id = %pipeline.id, errors = ?errors, "Resize failed");
                self.store.update_operation(&operation).await?;
                return Ok(Vec::new());
            }
        };

        pipeline.status = to;
        if !self.store.update_pipeline(&pipeline, &[from]).await? {
            return Ok(Vec::new());
        }
        self.store.update_operation(&operation).await?;
        warn!(pipeline_id = %pipeline.id, status = %to, errors = ?errors, "Remote operation failed");

        // A cancel that arrived while deploying is honored once the deploy
        // resolves, whichever way it went.
        if to == PipelineStatus::Broken && self.is_cancelled(&pipeline.id).await? {
            return Ok(vec![Followup::now(Task::Close {
                pipeline_id: pipeline.id,
            })]);
        }
        Ok(Vec::new())
    }

    async fn is_cancelled(&self, pipeline_id: &PipelineId) -> Result<bool> {
        Ok(self
            .store
            .get_pipeline(pipeline_id)
            .await?
            .is_some_and(|p| p.cancelled))
    }

    /// Follow-ups for a pipeline that just opened.
    async fn open_followups(&self, pipeline_id: &PipelineId) -> Result<Vec<Followup>> {
        let Some(pipeline) = self.store.get_pipeline(pipeline_id).await? else {
            return Ok(Vec::new());
        };
        if pipeline.cancelled {
            info!(pipeline_id = %pipeline.id, "Pipeline was cancelled while deploying; closing");
            return Ok(vec![Followup::now(Task::Close {
                pipeline_id: pipeline.id,
            })]);
        }

        let mut followups: Vec<Followup> = self
            .store
            .list_jobs(pipeline_id)
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Ready)
            .map(|job| Followup::now(Task::Publish { job_id: job.id }))
            .collect();
        followups.push(Followup::now(Task::Subscribe {
            pipeline_id: pipeline.id,
        }));
        Ok(followups)
    }

    async fn closed(
        &self,
        pipeline: &Pipeline,
        operation: &PipelineOperation,
    ) -> Result<Vec<Followup>> {
        let Some(followups) = self
            .admission
            .release(pipeline, &[PipelineStatus::Closing])
            .await?
        else {
            return Ok(Vec::new());
        };
        self.store.update_operation(operation).await?;
        info!(pipeline_id = %pipeline.id, "Pipeline closed");
        Ok(followups)
    }

    /// Tear down an `Opened`, `Broken` or `ClosingError` pipeline.
    #[instrument(skip(self), fields(pipeline_id = %pipeline_id))]
    pub async fn close(&self, pipeline_id: &PipelineId) -> Result<Vec<Followup>> {
        let Some(mut pipeline) = self.store.get_pipeline(pipeline_id).await? else {
            warn!("Pipeline not found; dropping close");
            return Ok(Vec::new());
        };
        let from = pipeline.status;
        if !from.is_closable() {
            debug!(status = %from, "Pipeline not closable; skipping close");
            return Ok(Vec::new());
        }
        if from == PipelineStatus::Opened {
            if let Some(resize) = self
                .unresolved_operation(pipeline_id, OperationService::Resize)
                .await?
            {
                info!(operation_id = %resize.id, "Resize in flight; deferring close");
                return Ok(vec![Followup::after(
                    Task::Close {
                        pipeline_id: pipeline.id,
                    },
                    self.poll_interval,
                )]);
            }
        }

        let issued = match self.gateway.delete(&pipeline).await {
            Ok(issued) => issued,
            Err(e) if e.is_not_found() => {
                info!("Deployment not found; closing without delete");
                return Ok(self
                    .admission
                    .release(&pipeline, &[from])
                    .await?
                    .unwrap_or_default());
            }
            Err(e) => return Err(e.into()),
        };

        let operation = self
            .record(&pipeline, OperationService::Delete, issued, "start")
            .await?;
        pipeline.status = PipelineStatus::Closing;
        if !self.store.update_pipeline(&pipeline, &[from]).await? {
            debug!("Pipeline changed concurrently; dropping close");
            return Ok(Vec::new());
        }
        info!(operation_id = %operation.id, "Pipeline closing");
        Ok(vec![self.watch(&operation)])
    }

    /// Resize an `Opened` pipeline with no operation in flight.
    #[instrument(skip(self), fields(pipeline_id = %pipeline_id))]
    pub async fn resize(
        &self,
        pipeline_id: &PipelineId,
        size: u32,
    ) -> Result<(PipelineOperation, Vec<Followup>)> {
        let pipeline = self
            .store
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("pipeline", pipeline_id))?;
        if pipeline.status != PipelineStatus::Opened {
            return Err(OrchestratorError::InvalidOperation(format!(
                "cannot resize a pipeline in status {}",
                pipeline.status
            )));
        }

        let mut operation = PipelineOperation::claimed(&pipeline, OperationService::Resize);
        operation.target_size = Some(size);
        if !self
            .store
            .insert_operation_exclusive(&operation, PipelineStatus::Opened)
            .await?
        {
            return Err(OrchestratorError::Conflict(
                "another resize is in flight or the pipeline left opened".to_string(),
            ));
        }

        match self.gateway.resize(&pipeline, size).await {
            Ok(issued) => {
                operation.issued(issued.handle, issued.operation.as_ref(), "start");
                self.store.update_operation(&operation).await?;
            }
            Err(e) => {
                operation.resolve_unpolled("resize request failed");
                self.store.update_operation(&operation).await?;
                return Err(e.into());
            }
        }
        info!(operation_id = %operation.id, size, "Resize requested");

        let followups = vec![self.watch(&operation)];
        Ok((operation, followups))
    }

    /// Grow an opened pipeline's instance group when its working jobs
    /// outnumber the container slots. Returns the resize watch, if any.
    #[instrument(skip(self), fields(pipeline_id = %pipeline_id))]
    pub async fn scale_for_jobs(&self, pipeline_id: &PipelineId) -> Result<Vec<Followup>> {
        let Some(pipeline) = self.store.get_pipeline(pipeline_id).await? else {
            return Ok(Vec::new());
        };
        let scaler = pipeline.job_scaler;
        if pipeline.status != PipelineStatus::Opened
            || pipeline.cancelled
            || !scaler.can_scale(pipeline.target_size)
        {
            return Ok(Vec::new());
        }

        let working = self
            .store
            .list_jobs(pipeline_id)
            .await?
            .iter()
            .filter(|job| job.status.is_working())
            .count();
        let Some(size) = scaler.desired_size(working, pipeline.container.size, pipeline.target_size)
        else {
            return Ok(Vec::new());
        };

        info!(working, from = pipeline.target_size, to = size, "Job shortage; growing instance group");
        match self.resize(pipeline_id, size).await {
            Ok((_, followups)) => Ok(followups),
            Err(OrchestratorError::Conflict(_)) => {
                debug!("Resize already in flight; not scaling");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-arm watches whose task chain may have been lost.
    ///
    /// A live watch touches its operation every poll, so only operations
    /// left untouched for [`STALE_POLLS`] poll intervals are re-armed.
    pub async fn rearm_watches(&self) -> Result<Vec<Followup>> {
        let max_age = chrono::Duration::from_std(self.poll_interval.saturating_mul(STALE_POLLS))
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let now = Utc::now();
        let stuck = self
            .store
            .pipelines_with_status(
                None,
                &[
                    PipelineStatus::Deploying,
                    PipelineStatus::Closing,
                    PipelineStatus::Opened,
                ],
            )
            .await?;

        let mut followups = Vec::new();
        for pipeline in stuck {
            let service = match pipeline.status {
                PipelineStatus::Deploying => OperationService::Deploy,
                PipelineStatus::Closing => OperationService::Delete,
                _ => OperationService::Resize,
            };
            match self.unresolved_operation(&pipeline.id, service).await? {
                Some(operation) if operation.is_stale(now, max_age) => {
                    info!(operation_id = %operation.id, "Re-arming stale watch");
                    followups.push(self.watch(&operation));
                }
                Some(_) => {}
                None if service != OperationService::Resize => {
                    warn!(pipeline_id = %pipeline.id, status = %pipeline.status, "No unresolved operation to watch");
                }
                None => {}
            }
        }
        Ok(followups)
    }
}
