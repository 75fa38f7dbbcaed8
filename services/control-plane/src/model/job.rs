//! Jobs: work items dispatched to an open pipeline.
//!
//! Job status only ever moves forward under the order the variants are
//! declared in. Worker progress reports arrive late, twice, or out of
//! order; [`Job::update_status_if_greater_than_before`] is the merge that
//! makes that safe.

use std::collections::BTreeMap;

use batchfleet_id::{JobId, PipelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Message attribute carrying the job id, used to match progress reports
/// back to their job.
pub const JOB_ID_ATTRIBUTE: &str = "concurrent_batch.job_id";

/// Job status. Declaration order is the total order used by the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Preparing,
    Ready,
    Publishing,
    PublishError,
    Published,
    Executing,
    Failure,
    Success,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        Self::Preparing,
        Self::Ready,
        Self::Publishing,
        Self::PublishError,
        Self::Published,
        Self::Executing,
        Self::Failure,
        Self::Success,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "Preparing",
            Self::Ready => "Ready",
            Self::Publishing => "Publishing",
            Self::PublishError => "PublishError",
            Self::Published => "Published",
            Self::Executing => "Executing",
            Self::Failure => "Failure",
            Self::Success => "Success",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Success or Failure.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Failure | Self::Success)
    }

    /// States from which a publish attempt is meaningful.
    /// Jobs that occupy, or are about to occupy, a container slot.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Publishing | Self::Published | Self::Executing
        )
    }

    pub fn is_publishable(&self) -> bool {
        matches!(self, Self::Ready | Self::Publishing | Self::PublishError)
    }

    /// Status implied by one worker progress report, if any.
    pub fn from_step(step: JobStep, step_status: JobStepStatus) -> Option<Self> {
        use JobStep::*;

        match step_status {
            JobStepStatus::Starting => None,
            JobStepStatus::Success => match step {
                Initializing | Downloading | Executing | Uploading | NackSending => {
                    Some(Self::Executing)
                }
                Cancelling => Some(Self::Failure),
                AckSending => Some(Self::Success),
                Cleanup => None,
            },
            JobStepStatus::Failure => match step {
                Initializing | Downloading | Executing | Uploading => Some(Self::Executing),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step a worker reports progress for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStep {
    Initializing,
    Downloading,
    Executing,
    Uploading,
    Cleanup,
    NackSending,
    Cancelling,
    AckSending,
}

impl JobStep {
    pub fn parse(s: &str) -> Result<Self, ProgressError> {
        match s {
            "INITIALIZING" => Ok(Self::Initializing),
            "DOWNLOADING" => Ok(Self::Downloading),
            "EXECUTING" => Ok(Self::Executing),
            "UPLOADING" => Ok(Self::Uploading),
            "CLEANUP" => Ok(Self::Cleanup),
            "NACKSENDING" => Ok(Self::NackSending),
            "CANCELLING" => Ok(Self::Cancelling),
            "ACKSENDING" => Ok(Self::AckSending),
            other => Err(ProgressError::UnknownStep(other.to_string())),
        }
    }
}

/// Outcome of a reported step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStepStatus {
    Starting,
    Success,
    Failure,
}

impl JobStepStatus {
    pub fn parse(s: &str) -> Result<Self, ProgressError> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            other => Err(ProgressError::UnknownStepStatus(other.to_string())),
        }
    }
}

/// Malformed progress report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgressError {
    #[error("missing progress attribute {0:?}")]
    MissingAttribute(&'static str),

    #[error("invalid value for \"completed\": {0:?}")]
    InvalidCompleted(String),

    #[error("unknown job step {0:?}")]
    UnknownStep(String),

    #[error("unknown job step status {0:?}")]
    UnknownStepStatus(String),
}

/// Attribute map plus opaque payload delivered to workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub data: String,
}

/// A unit of work dispatched to a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub id_by_client: String,
    pub status: JobStatus,
    pub message: JobMessage,
    pub message_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub hostname: Option<String>,
    pub zone: Option<String>,
    pub start_time: Option<String>,
    pub finish_time: Option<String>,
    pub output: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a job.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewJob {
    /// Caller's own key; jobs are unique per (pipeline, id_by_client).
    #[validate(length(max = 500, message = "id_by_client is too long"))]
    #[serde(default)]
    pub id_by_client: Option<String>,

    #[serde(default)]
    pub message: JobMessage,

    /// `false` creates the job `Preparing`; it is never published until
    /// updated to `Ready`.
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

impl Job {
    /// Build a job for `pipeline_id`. `pipeline_name` prefixes generated
    /// client ids.
    pub fn new(pipeline_id: PipelineId, pipeline_name: &str, input: NewJob) -> Self {
        let id = JobId::new();
        let id_by_client = match input.id_by_client {
            Some(key) if !key.trim().is_empty() => key,
            _ => format!("{pipeline_name}-generated-{}", id.ulid()),
        };
        let status = if input.ready {
            JobStatus::Ready
        } else {
            JobStatus::Preparing
        };
        let now = Utc::now();
        Self {
            id,
            pipeline_id,
            id_by_client,
            status,
            message: input.message,
            message_id: None,
            published_at: None,
            hostname: None,
            zone: None,
            start_time: None,
            finish_time: None,
            output: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Message attributes with the correlation attribute added.
    pub fn correlated_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = self.message.attributes.clone();
        attributes.insert(JOB_ID_ATTRIBUTE.to_string(), self.id.to_string());
        attributes
    }

    /// Monotonic merge of one progress report into the job status.
    ///
    /// `completed` forces `Success`. Otherwise the status implied by
    /// `(step, step_status)` is applied only if it is strictly greater than
    /// the current one. Returns true if the status changed.
    pub fn update_status_if_greater_than_before(
        &mut self,
        completed: bool,
        step: JobStep,
        step_status: JobStepStatus,
    ) -> bool {
        if completed {
            let changed = self.status != JobStatus::Success;
            self.status = JobStatus::Success;
            return changed;
        }

        match JobStatus::from_step(step, step_status) {
            Some(candidate) if candidate > self.status => {
                self.status = candidate;
                true
            }
            _ => false,
        }
    }

    /// Merge a full progress report: payload, worker metadata, status.
    ///
    /// Returns true if the status changed.
    pub fn apply_progress(&mut self, report: &ProgressReport) -> bool {
        if let Some(output) = report.output.as_deref().filter(|o| !o.is_empty()) {
            if !self.output.is_empty() {
                self.output.push_str("\n\n");
            }
            self.output.push_str(output);
        }

        if self.status == JobStatus::Success {
            return false;
        }

        if report.host.is_some() {
            self.hostname = report.host.clone();
        }
        if report.zone.is_some() {
            self.zone = report.zone.clone();
        }
        if report.start_time.is_some() {
            self.start_time = report.start_time.clone();
        }
        if report.finish_time.is_some() {
            self.finish_time = report.finish_time.clone();
        }

        self.update_status_if_greater_than_before(
            report.completed,
            report.step,
            report.step_status,
        )
    }
}

/// One worker progress report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProgressReport {
    #[serde(default)]
    pub completed: bool,
    pub step: JobStep,
    pub step_status: JobStepStatus,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub finish_time: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

impl ProgressReport {
    /// Parse the attribute map a worker attaches to its progress message.
    pub fn from_attributes(
        attributes: &BTreeMap<String, String>,
        output: Option<String>,
    ) -> Result<Self, ProgressError> {
        let required = |key: &'static str| {
            attributes
                .get(key)
                .map(String::as_str)
                .ok_or(ProgressError::MissingAttribute(key))
        };

        let completed = match required("completed")? {
            "true" | "TRUE" | "True" | "1" | "t" | "T" => true,
            "false" | "FALSE" | "False" | "0" | "f" | "F" => false,
            other => return Err(ProgressError::InvalidCompleted(other.to_string())),
        };

        Ok(Self {
            completed,
            step: JobStep::parse(required("step")?)?,
            step_status: JobStepStatus::parse(required("step_status")?)?,
            host: attributes.get("host").cloned(),
            zone: attributes.get("zone").cloned(),
            start_time: attributes.get("job.start-time").cloned(),
            finish_time: attributes.get("job.finish-time").cloned(),
            output,
        })
    }
}
