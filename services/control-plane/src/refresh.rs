//! Periodic refresh worker.
//!
//! Recovers task chains lost to crashes or dropped deliveries: re-arms
//! operation watches, restarts reserved pipelines and re-runs admission for
//! every organization with queued pipelines.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::error::Result;
use crate::model::PipelineStatus;
use crate::orchestrator::Orchestrator;
use crate::tasks::{Followup, Task};

pub struct RefreshWorker {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl RefreshWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run the refresh worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting refresh worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; recover once at startup.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.refresh().await {
                        Ok(0) => {}
                        Ok(scheduled) => info!(scheduled, "Refresh complete"),
                        Err(e) => error!(error = %e, "Refresh failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Refresh worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single refresh pass, returning the number of tasks scheduled.
    pub async fn refresh(&self) -> Result<usize> {
        let store = self.orchestrator.store();
        let mut followups = self.orchestrator.lifecycle().rearm_watches().await?;

        let reserved = store
            .pipelines_with_status(None, &[PipelineStatus::Reserved, PipelineStatus::Building])
            .await?;
        followups.extend(reserved.into_iter().map(|pipeline| {
            Followup::now(Task::Start {
                pipeline_id: pipeline.id,
            })
        }));

        let orgs: BTreeSet<_> = store
            .pipelines_with_status(None, &[PipelineStatus::Pending])
            .await?
            .into_iter()
            .map(|pipeline| pipeline.org_id)
            .collect();
        followups.extend(
            orgs.into_iter()
                .map(|org_id| Followup::now(Task::Admit { org_id })),
        );

        let scheduled = followups.len();
        self.orchestrator.enqueue(followups).await?;
        Ok(scheduled)
    }
}
