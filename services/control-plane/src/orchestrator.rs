//! Wires the handlers together and routes tasks to them.

use std::sync::Arc;
use std::time::Duration;

use batchfleet_id::OrgId;
use chrono::Utc;
use tracing::{debug, error, instrument, warn};
use validator::Validate;

use crate::admission::Admission;
use crate::bus::{ProgressSource, Publisher};
use crate::db::Store;
use crate::error::{OrchestratorError, Result};
use crate::jobs::Jobs;
use crate::lifecycle::Lifecycle;
use crate::model::{NewOrganization, Organization};
use crate::pipelines::Pipelines;
use crate::remote::RemoteGateway;
use crate::tasks::{Followup, Task, TaskError, TaskScheduler};

/// Timing knobs shared by the handlers.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Delay between polls of an in-flight remote operation.
    pub poll_interval: Duration,

    /// Delay before retrying a failed job publish.
    pub publish_retry: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: batchfleet_reconcile::DEFAULT_POLL_INTERVAL,
            publish_retry: Duration::from_secs(30),
        }
    }
}

/// External collaborators the orchestrator drives.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn RemoteGateway>,
    pub publisher: Arc<dyn Publisher>,
    pub progress: Arc<dyn ProgressSource>,
    pub scheduler: Arc<dyn TaskScheduler>,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    scheduler: Arc<dyn TaskScheduler>,
    admission: Arc<Admission>,
    lifecycle: Lifecycle,
    jobs: Jobs,
    pipelines: Pipelines,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, settings: Settings) -> Self {
        let Collaborators {
            store,
            gateway,
            publisher,
            progress,
            scheduler,
        } = collaborators;

        let admission = Arc::new(Admission::new(Arc::clone(&store)));
        let lifecycle = Lifecycle::new(
            Arc::clone(&store),
            gateway,
            Arc::clone(&admission),
            settings.poll_interval,
        );
        let jobs = Jobs::new(
            Arc::clone(&store),
            publisher,
            progress,
            Arc::clone(&admission),
            settings.publish_retry,
        );
        let pipelines = Pipelines::new(Arc::clone(&store), Arc::clone(&admission));

        Self {
            store,
            scheduler,
            admission,
            lifecycle,
            jobs,
            pipelines,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn jobs(&self) -> &Jobs {
        &self.jobs
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    /// Run the handler for `task` and return its follow-ups unscheduled.
    pub async fn run(&self, task: Task) -> Result<Vec<Followup>> {
        match task {
            Task::Start { pipeline_id } => self.lifecycle.start(&pipeline_id).await,
            Task::Close { pipeline_id } => self.lifecycle.close(&pipeline_id).await,
            Task::Subscribe { pipeline_id } => {
                let mut followups = self.jobs.subscribe(&pipeline_id).await?;
                let continues = followups
                    .iter()
                    .any(|f| matches!(f.task, Task::Subscribe { .. }));
                if continues {
                    match self.lifecycle.scale_for_jobs(&pipeline_id).await {
                        Ok(more) => followups.extend(more),
                        Err(e) => warn!(pipeline_id = %pipeline_id, error = %e, "Job scaling failed"),
                    }
                }
                Ok(followups)
            }
            Task::Watch { operation_id } => self.lifecycle.watch_operation(&operation_id).await,
            Task::Publish { job_id } => self.jobs.publish(&job_id).await,
            Task::Admit { org_id } => self.admission.try_admit(&org_id).await,
        }
    }

    /// Run `task` and schedule whatever it asks for next.
    ///
    /// State changes made by the handler are already committed when its
    /// follow-ups are scheduled. Follow-ups that fail to schedule are
    /// logged at error level; the refresh worker recovers their chains.
    #[instrument(skip(self), fields(task = %task))]
    pub async fn dispatch(&self, task: Task) -> Result<()> {
        let followups = self.run(task).await?;
        self.enqueue(followups).await
    }

    /// Hand follow-ups to the task scheduler.
    ///
    /// Every follow-up is attempted; the first failure is returned after
    /// the rest have been scheduled.
    pub async fn enqueue(&self, followups: Vec<Followup>) -> Result<()> {
        let mut first_error = None;
        for followup in followups {
            if let Err(e) = self.schedule(followup).await {
                error!(task = %followup.task, delay_secs = followup.delay.as_secs(), error = %e, "Dropped follow-up task");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn schedule(&self, followup: Followup) -> Result<()> {
        let eta = chrono::Duration::from_std(followup.delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| TaskError::Schedule {
                task: followup.task,
                reason: format!("delay of {}s is out of range", followup.delay.as_secs()),
            })?;
        let id = self.scheduler.schedule(followup.task, eta).await?;
        debug!(task_id = %id, task = %followup.task, delay_secs = followup.delay.as_secs(), "Task scheduled");
        Ok(())
    }

    pub async fn create_organization(&self, input: NewOrganization) -> Result<Organization> {
        input.validate()?;
        let org = Organization::new(input);
        self.store.insert_organization(&org).await?;
        Ok(org)
    }

    pub async fn get_organization(&self, org_id: &OrgId) -> Result<Organization> {
        self.store
            .get_organization(org_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("organization", org_id))
    }

    pub async fn list_organizations(&self) -> Result<Vec<Organization>> {
        Ok(self.store.list_organizations().await?)
    }
}
