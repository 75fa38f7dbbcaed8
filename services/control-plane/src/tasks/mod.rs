//! Tasks: the unit of asynchronous work.
//!
//! Every handler runs to completion and returns the [`Followup`]s it wants
//! run next. Waiting on a remote operation is a handler that returns a
//! delayed follow-up of itself.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use batchfleet_id::{JobId, OperationId, OrgId, PipelineId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::{Delivery, LocalTaskQueue, TaskWorker};

/// One schedulable handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Start { pipeline_id: PipelineId },
    Close { pipeline_id: PipelineId },
    Subscribe { pipeline_id: PipelineId },
    Watch { operation_id: OperationId },
    Publish { job_id: JobId },
    Admit { org_id: OrgId },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Close { .. } => "close",
            Self::Subscribe { .. } => "subscribe",
            Self::Watch { .. } => "watch",
            Self::Publish { .. } => "publish",
            Self::Admit { .. } => "admit",
        }
    }

    /// Path of the HTTP task endpoint running this task.
    pub fn path(&self) -> String {
        match self {
            Self::Start { pipeline_id }
            | Self::Close { pipeline_id }
            | Self::Subscribe { pipeline_id } => {
                format!("/tasks/pipelines/{pipeline_id}/{}", self.kind())
            }
            Self::Watch { operation_id } => format!("/tasks/operations/{operation_id}/watch"),
            Self::Publish { job_id } => format!("/tasks/jobs/{job_id}/publish"),
            Self::Admit { org_id } => format!("/tasks/orgs/{org_id}/admit"),
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// A task a handler wants run after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Followup {
    pub task: Task,
    pub delay: Duration,
}

impl Followup {
    pub fn now(task: Task) -> Self {
        Self {
            task,
            delay: Duration::ZERO,
        }
    }

    pub fn after(task: Task, delay: Duration) -> Self {
        Self { task, delay }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// The scheduler no longer accepts tasks.
    #[error("task queue is closed")]
    QueueClosed,

    #[error("failed to schedule {task}: {reason}")]
    Schedule { task: Task, reason: String },
}

/// Delivers tasks at least once, no earlier than their ETA.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule(&self, task: Task, eta: DateTime<Utc>) -> Result<TaskId, TaskError>;
}
