//! Caller-facing pipeline operations: create, cancel, destroy.

use std::sync::Arc;

use batchfleet_id::{OrgId, PipelineId};
use tracing::{debug, info, instrument};
use validator::Validate;

use crate::admission::Admission;
use crate::db::Store;
use crate::error::{OrchestratorError, Result};
use crate::model::{NewPipeline, Pipeline, PipelineOperation, PipelineStatus};
use crate::tasks::{Followup, Task};

/// Attempts before a cancel racing with lifecycle transitions gives up.
const CANCEL_ATTEMPTS: usize = 5;

pub struct Pipelines {
    store: Arc<dyn Store>,
    admission: Arc<Admission>,
}

impl Pipelines {
    pub fn new(store: Arc<dyn Store>, admission: Arc<Admission>) -> Self {
        Self { store, admission }
    }

    pub async fn get(&self, pipeline_id: &PipelineId) -> Result<Pipeline> {
        self.store
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("pipeline", pipeline_id))
    }

    pub async fn list(&self, org_id: &OrgId) -> Result<Vec<Pipeline>> {
        if self.store.get_organization(org_id).await?.is_none() {
            return Err(OrchestratorError::not_found("organization", org_id));
        }
        Ok(self.store.list_pipelines(org_id).await?)
    }

    pub async fn operations(&self, pipeline_id: &PipelineId) -> Result<Vec<PipelineOperation>> {
        self.get(pipeline_id).await?;
        Ok(self.store.list_operations(pipeline_id).await?)
    }

    /// Persist a new pipeline, queue it, and run admission once.
    #[instrument(skip(self, input), fields(org_id = %org_id))]
    pub async fn create(
        &self,
        org_id: &OrgId,
        input: NewPipeline,
    ) -> Result<(Pipeline, Vec<Followup>)> {
        input.validate()?;
        if self.store.get_organization(org_id).await?.is_none() {
            return Err(OrchestratorError::not_found("organization", org_id));
        }

        let mut pipeline = Pipeline::new(*org_id, input);
        self.store.insert_pipeline(&pipeline).await?;

        pipeline.status = PipelineStatus::Pending;
        self.store
            .update_pipeline(&pipeline, &[PipelineStatus::Created])
            .await?;
        info!(pipeline_id = %pipeline.id, tokens = pipeline.token_consumption, "Pipeline queued");

        let followups = self.admission.try_admit(org_id).await?;
        let pipeline = self.get(&pipeline.id).await?;
        Ok((pipeline, followups))
    }

    /// Cancel a pipeline in whatever state it is in.
    ///
    /// Queued pipelines close at once, a `Reserved` one returning its
    /// tokens. Deploying pipelines are flagged and close once the deploy
    /// resolves. Open ones get a `close` task.
    #[instrument(skip(self), fields(pipeline_id = %pipeline_id))]
    pub async fn cancel(&self, pipeline_id: &PipelineId) -> Result<(Pipeline, Vec<Followup>)> {
        for _ in 0..CANCEL_ATTEMPTS {
            let pipeline = self.get(pipeline_id).await?;
            let status = pipeline.status;
            let mut cancelled = pipeline.clone();
            cancelled.cancelled = true;

            let followups = match status {
                PipelineStatus::Closing | PipelineStatus::Closed => {
                    debug!(%status, "Pipeline already closing");
                    return Ok((pipeline, Vec::new()));
                }
                PipelineStatus::Created | PipelineStatus::Pending => {
                    cancelled.status = PipelineStatus::Closed;
                    if !self.store.update_pipeline(&cancelled, &[status]).await? {
                        continue;
                    }
                    Vec::new()
                }
                PipelineStatus::Reserved => {
                    if !self.store.update_pipeline(&cancelled, &[status]).await? {
                        continue;
                    }
                    match self.admission.release(&cancelled, &[status]).await? {
                        Some(followups) => followups,
                        None => continue,
                    }
                }
                PipelineStatus::Building | PipelineStatus::Deploying => {
                    if !self.store.update_pipeline(&cancelled, &[status]).await? {
                        continue;
                    }
                    Vec::new()
                }
                PipelineStatus::Opened | PipelineStatus::Broken | PipelineStatus::ClosingError => {
                    if !self.store.update_pipeline(&cancelled, &[status]).await? {
                        continue;
                    }
                    vec![Followup::now(Task::Close {
                        pipeline_id: pipeline.id,
                    })]
                }
            };

            info!(%status, "Pipeline cancelled");
            let pipeline = self.get(pipeline_id).await?;
            return Ok((pipeline, followups));
        }

        Err(OrchestratorError::Conflict(
            "pipeline status kept changing; retry the cancel".to_string(),
        ))
    }

    /// Remove a `Closed` pipeline with its jobs and operations.
    #[instrument(skip(self), fields(pipeline_id = %pipeline_id))]
    pub async fn destroy(&self, pipeline_id: &PipelineId) -> Result<()> {
        let pipeline = self.get(pipeline_id).await?;
        if pipeline.status != PipelineStatus::Closed {
            return Err(OrchestratorError::InvalidOperation(format!(
                "cannot destroy a pipeline in status {}",
                pipeline.status
            )));
        }
        if !self.store.delete_pipeline(pipeline_id).await? {
            return Err(OrchestratorError::Conflict(
                "pipeline changed while deleting".to_string(),
            ));
        }
        info!("Pipeline destroyed");
        Ok(())
    }
}
