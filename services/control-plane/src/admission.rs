//! Admission control: a token budget plus dependency gates decide which
//! queued pipeline may start next.
//!
//! Pending pipelines of an organization are scanned strictly oldest first.
//! A pipeline whose dependency is unsatisfied is skipped; a pipeline that
//! does not fit in the remaining budget stops the scan, so a large request
//! is never starved by smaller ones behind it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use batchfleet_id::{JobId, OrgId};
use tracing::{debug, info, instrument};

use crate::db::{Reservation, Store};
use crate::error::Result;
use crate::model::{Pipeline, PipelineStatus};
use crate::tasks::{Followup, Task};

pub struct Admission {
    store: Arc<dyn Store>,
    locks: Mutex<HashMap<OrgId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Admission {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn org_lock(&self, org_id: &OrgId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(*org_id).or_default())
    }

    /// Reserve budget for as many pending pipelines of `org_id` as fit.
    ///
    /// Returns a `start` follow-up per reserved pipeline.
    #[instrument(skip(self), fields(org_id = %org_id))]
    pub async fn try_admit(&self, org_id: &OrgId) -> Result<Vec<Followup>> {
        let lock = self.org_lock(org_id);
        let _guard = lock.lock().await;

        let pending = self
            .store
            .pipelines_with_status(Some(org_id), &[PipelineStatus::Pending])
            .await?;

        let mut followups = Vec::new();
        for pipeline in pending {
            if pipeline.cancelled {
                let mut closed = pipeline.clone();
                closed.status = PipelineStatus::Closed;
                if self
                    .store
                    .update_pipeline(&closed, &[PipelineStatus::Pending])
                    .await?
                {
                    info!(pipeline_id = %pipeline.id, "Closed cancelled pending pipeline");
                }
                continue;
            }

            if !self.dependency_satisfied(&pipeline).await? {
                debug!(pipeline_id = %pipeline.id, "Dependency not satisfied; skipping");
                continue;
            }

            match self.store.reserve(&pipeline.id).await? {
                Reservation::Reserved(reserved) => {
                    info!(
                        pipeline_id = %reserved.id,
                        tokens = reserved.token_consumption,
                        "Reserved pipeline"
                    );
                    followups.push(Followup::now(Task::Start {
                        pipeline_id: reserved.id,
                    }));
                }
                Reservation::InsufficientBudget {
                    available,
                    required,
                } => {
                    debug!(
                        pipeline_id = %pipeline.id,
                        available,
                        required,
                        "Budget exhausted; stopping scan"
                    );
                    break;
                }
                Reservation::NotPending => continue,
            }
        }

        Ok(followups)
    }

    /// Evaluate a pipeline's dependency against current job statuses.
    pub async fn dependency_satisfied(&self, pipeline: &Pipeline) -> Result<bool> {
        if pipeline.dependency.is_empty() {
            return Ok(true);
        }
        let statuses = self
            .store
            .job_statuses(&pipeline.dependency.job_ids)
            .await?;
        Ok(pipeline
            .dependency
            .satisfied_by(|id| statuses.get(id).copied()))
    }

    /// Pending pipelines whose dependency references any of `job_ids`.
    pub async fn pendings_for(&self, job_ids: &[JobId]) -> Result<Vec<Pipeline>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.pending_pipelines_depending_on(job_ids).await?)
    }

    /// An `admit` follow-up for every organization with a pending pipeline
    /// waiting on any of `job_ids`.
    pub async fn admit_for_jobs(&self, job_ids: &[JobId]) -> Result<Vec<Followup>> {
        let orgs: BTreeSet<OrgId> = self
            .pendings_for(job_ids)
            .await?
            .into_iter()
            .map(|p| p.org_id)
            .collect();
        Ok(orgs
            .into_iter()
            .map(|org_id| Followup::now(Task::Admit { org_id }))
            .collect())
    }

    /// Credit the pipeline's tokens back and close it, then re-run
    /// admission for its organization.
    ///
    /// Returns `None` if the pipeline was not in any of `from`; nothing is
    /// credited in that case.
    #[instrument(skip(self, pipeline), fields(pipeline_id = %pipeline.id))]
    pub async fn release(
        &self,
        pipeline: &Pipeline,
        from: &[PipelineStatus],
    ) -> Result<Option<Vec<Followup>>> {
        if !self.store.release(&pipeline.id, from).await? {
            debug!("Release guard did not match; nothing credited");
            return Ok(None);
        }
        info!(tokens = pipeline.token_consumption, "Released pipeline budget");
        self.try_admit(&pipeline.org_id).await.map(Some)
    }
}
