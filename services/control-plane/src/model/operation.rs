//! Pipeline operations: handles to in-flight remote calls.

use batchfleet_id::{OperationId, PipelineId};
use batchfleet_reconcile::{observe, OperationError, OperationLog, OperationStatus, RemoteOperation, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pipeline::{Pipeline, PipelineStatus};

/// What a remote operation does to its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationService {
    Deploy,
    Delete,
    Resize,
}

impl OperationService {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Delete => "delete",
            Self::Resize => "resize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploy" => Some(Self::Deploy),
            "delete" => Some(Self::Delete),
            "resize" => Some(Self::Resize),
            _ => None,
        }
    }

    /// Pipeline status while an operation of this kind is outstanding.
    /// A watch finding any other status is a duplicate.
    pub fn expected_pipeline_status(&self) -> PipelineStatus {
        match self {
            Self::Deploy => PipelineStatus::Deploying,
            Self::Delete => PipelineStatus::Closing,
            Self::Resize => PipelineStatus::Opened,
        }
    }
}

impl std::fmt::Display for OperationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a remote operation lives. `zone` is empty for global operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub project_id: String,
    #[serde(default)]
    pub zone: String,
    pub name: String,
}

/// One persisted remote operation and its audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOperation {
    pub id: OperationId,
    pub pipeline_id: PipelineId,
    pub service: OperationService,
    pub handle: RemoteHandle,
    pub remote_status: String,
    pub errors: Vec<OperationError>,
    pub logs: Vec<OperationLog>,

    /// Requested size, for resize operations.
    pub target_size: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineOperation {
    /// Record a freshly issued remote operation.
    pub fn started(
        pipeline_id: PipelineId,
        service: OperationService,
        handle: RemoteHandle,
        initial: &dyn RemoteOperation,
        message: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            pipeline_id,
            service,
            handle,
            remote_status: initial.status().as_str().to_string(),
            errors: initial.errors(),
            logs: vec![OperationLog::now(message)],
            target_size: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reserve the pipeline's operation slot before the remote call is
    /// made. [`PipelineOperation::issued`] fills in the handle.
    pub fn claimed(pipeline: &Pipeline, service: OperationService) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            pipeline_id: pipeline.id,
            service,
            handle: RemoteHandle {
                project_id: pipeline.project_id.clone(),
                zone: pipeline.zone.clone(),
                name: String::new(),
            },
            remote_status: OperationStatus::Pending.as_str().to_string(),
            errors: Vec::new(),
            logs: vec![OperationLog::now("claimed")],
            target_size: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the remote operation to a claimed record.
    pub fn issued(&mut self, handle: RemoteHandle, initial: &dyn RemoteOperation, message: &str) {
        self.handle = handle;
        self.remote_status = initial.status().as_str().to_string();
        self.errors = initial.errors();
        self.logs.push(OperationLog::now(message));
        self.updated_at = Utc::now();
    }

    /// False for a claim whose remote call never went out.
    pub fn is_issued(&self) -> bool {
        !self.handle.name.is_empty()
    }

    /// Returns true if nothing has touched the record for longer than
    /// `max_age`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.updated_at) > max_age
    }

    pub fn is_resolved(&self) -> bool {
        OperationStatus::parse(&self.remote_status).is_ok_and(|s| s.is_terminal())
    }

    /// Fold one poll result into the record.
    ///
    /// A log entry is appended only when the status string changed. Errors
    /// are copied when the operation resolved with errors.
    pub fn record_poll(&mut self, current: &dyn RemoteOperation) -> Verdict {
        let verdict = observe(&self.remote_status, current);
        let status = current.status();
        if self.remote_status != status.as_str() {
            self.logs.push(OperationLog::now(status.as_str()));
            self.remote_status = status.as_str().to_string();
        }
        if let Verdict::Failed(errors) = &verdict {
            self.errors = errors.clone();
        }
        self.updated_at = Utc::now();
        verdict
    }

    /// Mark resolved without polling: the remote resource is gone or the
    /// request was never issued.
    pub fn resolve_unpolled(&mut self, message: &str) {
        self.remote_status = OperationStatus::Done.as_str().to_string();
        self.logs.push(OperationLog::now(message));
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Polled(OperationStatus, Vec<OperationError>);

    impl RemoteOperation for Polled {
        fn name(&self) -> &str {
            "operation-1"
        }

        fn status(&self) -> OperationStatus {
            self.0
        }

        fn errors(&self) -> Vec<OperationError> {
            self.1.clone()
        }
    }

    fn handle() -> RemoteHandle {
        RemoteHandle {
            project_id: "proj-1".to_string(),
            zone: String::new(),
            name: "operation-1".to_string(),
        }
    }

    #[test]
    fn test_log_only_on_status_change() {
        let mut op = PipelineOperation::started(
            PipelineId::new(),
            OperationService::Deploy,
            handle(),
            &Polled(OperationStatus::Pending, vec![]),
            "start",
        );
        assert_eq!(op.logs.len(), 1);

        let verdict = op.record_poll(&Polled(OperationStatus::Pending, vec![]));
        assert_eq!(verdict, Verdict::InProgress { status_changed: false });
        assert_eq!(op.logs.len(), 1);

        op.record_poll(&Polled(OperationStatus::Running, vec![]));
        assert_eq!(op.logs.len(), 2);
        assert_eq!(op.logs[1].message, "RUNNING");
        assert!(!op.is_resolved());

        assert_eq!(
            op.record_poll(&Polled(OperationStatus::Done, vec![])),
            Verdict::Succeeded
        );
        assert!(op.is_resolved());
    }

    #[test]
    fn test_claim_then_issue() {
        let pipeline = Pipeline::new(
            batchfleet_id::OrgId::new(),
            crate::model::pipeline::fixtures::new_pipeline("pipeline-1"),
        );
        let mut op = PipelineOperation::claimed(&pipeline, OperationService::Resize);
        assert!(!op.is_issued());
        assert!(!op.is_resolved());
        assert_eq!(op.handle.project_id, "proj-1");

        op.issued(handle(), &Polled(OperationStatus::Running, vec![]), "start");
        assert!(op.is_issued());
        assert_eq!(op.remote_status, "RUNNING");
        assert_eq!(op.logs.len(), 2);
    }

    #[test]
    fn test_staleness() {
        let mut op = PipelineOperation::started(
            PipelineId::new(),
            OperationService::Deploy,
            handle(),
            &Polled(OperationStatus::Running, vec![]),
            "start",
        );
        let now = Utc::now();
        let max_age = chrono::Duration::seconds(90);
        assert!(!op.is_stale(now, max_age));

        op.updated_at = now - chrono::Duration::seconds(91);
        assert!(op.is_stale(now, max_age));
    }

    #[test]
    fn test_errors_copied_on_failure() {
        let mut op = PipelineOperation::started(
            PipelineId::new(),
            OperationService::Delete,
            handle(),
            &Polled(OperationStatus::Running, vec![]),
            "start",
        );
        let errors = vec![OperationError {
            code: "RESOURCE_ERROR".to_string(),
            location: "/deployments/pipeline-1".to_string(),
            message: "boom".to_string(),
        }];
        let verdict = op.record_poll(&Polled(OperationStatus::Done, errors.clone()));
        assert_eq!(verdict, Verdict::Failed(errors.clone()));
        assert_eq!(op.errors, errors);
    }

    #[test]
    fn test_expected_status() {
        assert_eq!(
            OperationService::Deploy.expected_pipeline_status(),
            PipelineStatus::Deploying
        );
        assert_eq!(
            OperationService::Delete.expected_pipeline_status(),
            PipelineStatus::Closing
        );
        assert_eq!(
            OperationService::Resize.expected_pipeline_status(),
            PipelineStatus::Opened
        );
    }
}
