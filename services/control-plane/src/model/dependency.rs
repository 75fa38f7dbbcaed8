//! Dependency gates on pipeline admission.

use batchfleet_id::JobId;
use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// Which terminal job status satisfies a dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyCondition {
    #[default]
    OnSuccess,
    OnFailure,
    /// Success or Failure.
    OnFinish,
}

impl DependencyCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnSuccess => "OnSuccess",
            Self::OnFailure => "OnFailure",
            Self::OnFinish => "OnFinish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OnSuccess" => Some(Self::OnSuccess),
            "OnFailure" => Some(Self::OnFailure),
            "OnFinish" => Some(Self::OnFinish),
            _ => None,
        }
    }

    /// Returns true if a job in `status` meets this condition.
    pub fn accepts(&self, status: JobStatus) -> bool {
        match self {
            Self::OnSuccess => status == JobStatus::Success,
            Self::OnFailure => status == JobStatus::Failure,
            Self::OnFinish => status.is_finished(),
        }
    }
}

/// Gating condition attached to a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default)]
    pub condition: DependencyCondition,

    #[serde(default)]
    pub job_ids: Vec<JobId>,
}

impl Dependency {
    /// Returns true if the pipeline has nothing to wait for.
    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }

    /// Returns true if any referenced job is in `ids`.
    pub fn references_any(&self, ids: &[JobId]) -> bool {
        self.job_ids.iter().any(|id| ids.contains(id))
    }

    /// Evaluate the gate.
    ///
    /// `lookup` returns the current status of a referenced job, or `None`
    /// if the job does not exist. A missing job never satisfies the gate.
    pub fn satisfied_by<F>(&self, mut lookup: F) -> bool
    where
        F: FnMut(&JobId) -> Option<JobStatus>,
    {
        self.job_ids.iter().all(|id| {
            lookup(id)
                .map(|status| self.condition.accepts(status))
                .unwrap_or(false)
        })
    }
}
