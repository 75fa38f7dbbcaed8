//! Job delivery: publication to the pipeline's job topic and merging of
//! worker progress reports.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use batchfleet_id::{JobId, PipelineId};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::admission::Admission;
use crate::bus::{OutboundMessage, ProgressSource, Publisher, ReceivedMessage};
use crate::db::Store;
use crate::error::{OrchestratorError, Result};
use crate::model::{
    Job, JobStatus, NewJob, Pipeline, PipelineStatus, ProgressReport, JOB_ID_ATTRIBUTE,
};
use crate::tasks::{Followup, Task};

const MERGE_ATTEMPTS: usize = 5;

pub struct Jobs {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    progress: Arc<dyn ProgressSource>,
    admission: Arc<Admission>,
    publish_retry: Duration,
}

impl Jobs {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        progress: Arc<dyn ProgressSource>,
        admission: Arc<Admission>,
        publish_retry: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            progress,
            admission,
            publish_retry,
        }
    }

    async fn pipeline(&self, pipeline_id: &PipelineId) -> Result<Pipeline> {
        self.store
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("pipeline", pipeline_id))
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("job", job_id))
    }

    pub async fn list(&self, pipeline_id: &PipelineId) -> Result<Vec<Job>> {
        self.pipeline(pipeline_id).await?;
        Ok(self.store.list_jobs(pipeline_id).await?)
    }

    /// Create a job, publishing it right away if the pipeline is open.
    ///
    /// An existing job with the same client id is returned unchanged, with
    /// `false` in place of the created flag.
    #[instrument(skip(self, input), fields(pipeline_id = %pipeline_id))]
    pub async fn create(
        &self,
        pipeline_id: &PipelineId,
        input: NewJob,
    ) -> Result<(Job, bool, Vec<Followup>)> {
        input.validate()?;
        let pipeline = self.pipeline(pipeline_id).await?;
        if !pipeline.status.accepts_jobs() {
            return Err(OrchestratorError::InvalidOperation(format!(
                "cannot add jobs to a pipeline in status {}",
                pipeline.status
            )));
        }

        let (job, created) = self
            .store
            .insert_job(&Job::new(pipeline.id, &pipeline.name, input))
            .await?;
        if !created {
            debug!(job_id = %job.id, "Job already exists");
            return Ok((job, false, Vec::new()));
        }
        info!(job_id = %job.id, status = %job.status, "Job created");
        let (job, followups) = self.publish_if_possible(job, &pipeline).await?;
        Ok((job, true, followups))
    }

    /// Mark a `Preparing` job `Ready`, publishing it if the pipeline is
    /// open.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn get_ready(&self, job_id: &JobId) -> Result<(Job, Vec<Followup>)> {
        let mut job = self.get(job_id).await?;
        if job.status != JobStatus::Preparing {
            return Ok((job, Vec::new()));
        }
        let pipeline = self.pipeline(&job.pipeline_id).await?;
        if !pipeline.status.accepts_jobs() {
            return Err(OrchestratorError::InvalidOperation(format!(
                "pipeline is {}",
                pipeline.status
            )));
        }
        job.status = JobStatus::Ready;
        if !self.store.update_job(&job, &[JobStatus::Preparing]).await? {
            return Ok((self.get(job_id).await?, Vec::new()));
        }
        self.publish_if_possible(job, &pipeline).await
    }

    async fn publish_if_possible(
        &self,
        job: Job,
        pipeline: &Pipeline,
    ) -> Result<(Job, Vec<Followup>)> {
        if job.status != JobStatus::Ready || pipeline.status != PipelineStatus::Opened {
            return Ok((job, Vec::new()));
        }
        self.publish_job(job, pipeline).await
    }

    /// Publish a job whose earlier attempt is pending or failed.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn publish(&self, job_id: &JobId) -> Result<Vec<Followup>> {
        let Some(job) = self.store.get_job(job_id).await? else {
            warn!("Job not found; dropping publish");
            return Ok(Vec::new());
        };
        if !job.status.is_publishable() {
            debug!(status = %job.status, "Job not publishable; skipping");
            return Ok(Vec::new());
        }
        let Some(pipeline) = self.store.get_pipeline(&job.pipeline_id).await? else {
            return Ok(Vec::new());
        };
        if pipeline.status != PipelineStatus::Opened {
            debug!(status = %pipeline.status, "Pipeline not open; skipping publish");
            return Ok(Vec::new());
        }
        let (_, followups) = self.publish_job(job, &pipeline).await?;
        Ok(followups)
    }

    async fn publish_job(
        &self,
        mut job: Job,
        pipeline: &Pipeline,
    ) -> Result<(Job, Vec<Followup>)> {
        if job.status != JobStatus::Publishing {
            let from = job.status;
            job.status = JobStatus::Publishing;
            if !self.store.update_job(&job, &[from]).await? {
                debug!(job_id = %job.id, "Job changed before publishing; skipping");
                return Ok((self.get(&job.id).await?, Vec::new()));
            }
        }

        let message = OutboundMessage {
            attributes: job.correlated_attributes(),
            data: job.message.data.clone(),
        };
        match self.publisher.publish(&pipeline.job_topic(), &message).await {
            Ok(message_id) => {
                let published_at = Utc::now();
                job.status = JobStatus::Published;
                job.message_id = Some(message_id.clone());
                job.published_at = Some(published_at);
                if !self.store.update_job(&job, &[JobStatus::Publishing]).await? {
                    // A worker reported progress before the publish returned.
                    job = self.record_delivery(&job.id, message_id, published_at).await?;
                }
                info!(job_id = %job.id, message_id = ?job.message_id, status = %job.status, "Job published");
                Ok((job, Vec::new()))
            }
            Err(e) => {
                job.status = JobStatus::PublishError;
                if !self.store.update_job(&job, &[JobStatus::Publishing]).await? {
                    debug!(job_id = %job.id, error = %e, "Publish failed but job already progressed");
                    return Ok((self.get(&job.id).await?, Vec::new()));
                }
                warn!(job_id = %job.id, error = %e, "Publish failed; will retry");
                let retry = Followup::after(Task::Publish { job_id: job.id }, self.publish_retry);
                Ok((job, vec![retry]))
            }
        }
    }

    /// Attach the message id to a job that has already moved past
    /// `Publishing`, leaving its status alone.
    async fn record_delivery(
        &self,
        job_id: &JobId,
        message_id: String,
        published_at: DateTime<Utc>,
    ) -> Result<Job> {
        let mut job = self.get(job_id).await?;
        if job.message_id.is_some() {
            return Ok(job);
        }
        let status = job.status;
        job.message_id = Some(message_id);
        job.published_at = Some(published_at);
        if self.store.update_job(&job, &[status]).await? {
            Ok(job)
        } else {
            self.get(job_id).await
        }
    }

    /// Apply `reports` to the stored job, retrying when another writer
    /// changed its status in between. Returns the written job and its
    /// status before the merge, or `None` if the job does not exist.
    async fn merge_reports(
        &self,
        job_id: &JobId,
        reports: &[ProgressReport],
    ) -> Result<Option<(Job, JobStatus)>> {
        for _ in 0..MERGE_ATTEMPTS {
            let Some(mut job) = self.store.get_job(job_id).await? else {
                return Ok(None);
            };
            let before = job.status;
            for report in reports {
                job.apply_progress(report);
            }
            if self.store.update_job(&job, &[before]).await? {
                return Ok(Some((job, before)));
            }
            debug!(job_id = %job_id, "Job changed during merge; retrying");
        }
        Err(OrchestratorError::Conflict(format!(
            "job {job_id} kept changing during progress merge"
        )))
    }

    /// Merge one progress report sent directly by a worker.
    #[instrument(skip(self, report), fields(job_id = %job_id))]
    pub async fn report_progress(
        &self,
        job_id: &JobId,
        report: ProgressReport,
    ) -> Result<(Job, Vec<Followup>)> {
        let (job, before) = self
            .merge_reports(job_id, std::slice::from_ref(&report))
            .await?
            .ok_or_else(|| OrchestratorError::not_found("job", job_id))?;

        let followups = if !before.is_finished() && job.status.is_finished() {
            self.admission.admit_for_jobs(&[job.id]).await?
        } else {
            Vec::new()
        };
        Ok((job, followups))
    }

    /// Drain the pipeline's progress subscription once and decide what
    /// happens next: close, stop, or poll again later.
    #[instrument(skip(self), fields(pipeline_id = %pipeline_id))]
    pub async fn subscribe(&self, pipeline_id: &PipelineId) -> Result<Vec<Followup>> {
        let Some(pipeline) = self.store.get_pipeline(pipeline_id).await? else {
            warn!("Pipeline not found; dropping subscribe");
            return Ok(Vec::new());
        };
        if pipeline.status != PipelineStatus::Opened {
            debug!(status = %pipeline.status, "Pipeline not open; stopping subscription");
            return Ok(Vec::new());
        }

        let unfinished = self
            .store
            .list_jobs(pipeline_id)
            .await?
            .iter()
            .filter(|j| !j.status.is_finished())
            .count();
        let mut followups = Vec::new();
        for _ in 0..pipeline.pulling.pulls_for(unfinished) {
            let (pulled, admits) = self.pull_progress(&pipeline).await?;
            followups.extend(admits);
            if pulled == 0 {
                break;
            }
        }
        let close = Followup::now(Task::Close {
            pipeline_id: pipeline.id,
        });

        // Re-read: a cancel or close may have landed while pulling.
        let Some(pipeline) = self.store.get_pipeline(pipeline_id).await? else {
            return Ok(followups);
        };
        match pipeline.status {
            PipelineStatus::Opened if pipeline.cancelled => {
                info!("Pipeline cancelled; closing");
                followups.push(close);
                return Ok(followups);
            }
            PipelineStatus::Opened => {}
            status => {
                debug!(%status, "Pipeline no longer open; stopping subscription");
                return Ok(followups);
            }
        }

        let jobs = self.store.list_jobs(pipeline_id).await?;
        let all_finished = !jobs.is_empty() && jobs.iter().all(|j| j.status.is_finished());
        if all_finished {
            if pipeline.close_policy.allows_close(&jobs) {
                info!(policy = pipeline.close_policy.as_str(), "All jobs finished; closing");
                followups.push(close);
            } else {
                info!(policy = pipeline.close_policy.as_str(), "All jobs finished; keeping pipeline open");
            }
            return Ok(followups);
        }

        followups.push(Followup::after(
            Task::Subscribe {
                pipeline_id: pipeline.id,
            },
            Duration::from_secs(pipeline.pulling.interval_seconds),
        ));
        Ok(followups)
    }

    /// Pull, merge and acknowledge one batch. Returns the number of messages
    /// pulled and `admit` follow-ups for jobs that finished.
    async fn pull_progress(&self, pipeline: &Pipeline) -> Result<(usize, Vec<Followup>)> {
        let subscription = pipeline.progress_subscription();
        let messages = match self
            .progress
            .pull(&subscription, pipeline.pulling.message_per_pull)
            .await
        {
            Ok(messages) => messages,
            Err(e) if e.is_not_found() => {
                warn!(subscription = %subscription, "Progress subscription not found");
                return Ok((0, Vec::new()));
            }
            Err(e) => return Err(e.into()),
        };
        if messages.is_empty() {
            return Ok((0, Vec::new()));
        }
        let pulled = messages.len();

        let mut ack_ids = Vec::with_capacity(messages.len());
        let mut groups: BTreeMap<String, Vec<ReceivedMessage>> = BTreeMap::new();
        for message in messages {
            ack_ids.push(message.ack_id.clone());
            match message.attributes.get(JOB_ID_ATTRIBUTE) {
                Some(job_id) => groups.entry(job_id.clone()).or_default().push(message),
                None => warn!(message_id = %message.message_id, "Progress message without job id"),
            }
        }

        let mut finished = Vec::new();
        for (raw_id, mut group) in groups {
            group.sort_by_key(|m| m.publish_time);
            if let Some(job_id) = self.merge_group(pipeline, &raw_id, &group).await? {
                finished.push(job_id);
            }
        }

        self.progress.acknowledge(&subscription, &ack_ids).await?;
        debug!(count = ack_ids.len(), "Acknowledged progress messages");

        let admits = self.admission.admit_for_jobs(&finished).await?;
        Ok((pulled, admits))
    }

    /// Apply one job's reports in publish order. Returns the job id if the
    /// job became finished.
    async fn merge_group(
        &self,
        pipeline: &Pipeline,
        raw_id: &str,
        group: &[ReceivedMessage],
    ) -> Result<Option<JobId>> {
        let Ok(job_id) = raw_id.parse::<JobId>() else {
            warn!(job_id = raw_id, "Progress message with malformed job id");
            return Ok(None);
        };
        let Some(job) = self.store.get_job(&job_id).await? else {
            warn!(job_id = %job_id, "Progress for unknown job");
            return Ok(None);
        };
        if job.pipeline_id != pipeline.id {
            warn!(job_id = %job_id, "Progress for a job of another pipeline");
            return Ok(None);
        }

        let reports: Vec<ProgressReport> = group
            .iter()
            .filter_map(|message| {
                ProgressReport::from_attributes(&message.attributes, message.data.clone())
                    .map_err(|e| {
                        warn!(job_id = %job_id, message_id = %message.message_id, error = %e, "Invalid progress report");
                    })
                    .ok()
            })
            .collect();
        if reports.is_empty() {
            return Ok(None);
        }
        let Some((job, before)) = self.merge_reports(&job_id, &reports).await? else {
            return Ok(None);
        };

        Ok((!before.is_finished() && job.status.is_finished()).then_some(job.id))
    }
}
