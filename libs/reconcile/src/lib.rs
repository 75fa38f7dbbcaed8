//! Remote operation reconciliation primitives.
//!
//! A long-running call against a compute backend (create a deployment,
//! delete it, resize an instance group) hands back an operation that must
//! be polled until it resolves. This library holds the parts of that loop
//! that do not depend on who owns the operation:
//!
//! - **RemoteOperation**: the `{status, errors}` shape every backend adapter
//!   exposes.
//! - **Verdict**: what one poll means for the owner (keep waiting, succeeded,
//!   failed).
//! - **OperationLog**: the timestamped audit trail kept per operation.
//! - **Backoff**: redelivery delays for handlers that failed transiently.
//!
//! # Invariants
//!
//! - A resolved operation never becomes unresolved again.
//! - A log entry is appended only when the observed status string changes.
//! - Decisions are deterministic given the same inputs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The backend reported a status string this library does not know.
    #[error("unknown operation status: {0}")]
    UnknownStatus(String),
}

/// Status of a remote long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Accepted but not started.
    Pending,

    /// In progress.
    Running,

    /// Finished, successfully or not.
    Done,
}

impl OperationStatus {
    /// Canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
        }
    }

    /// Parse the status string reported by a backend.
    pub fn parse(s: &str) -> Result<Self, ReconcileError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            other => Err(ReconcileError::UnknownStatus(other.to_string())),
        }
    }

    /// Returns true if the operation has resolved.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error reported by a finished remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Error type identifier.
    #[serde(default)]
    pub code: String,

    /// Field or resource in the request that caused the error.
    #[serde(default)]
    pub location: String,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Common shape of a polled remote operation.
///
/// Implemented once per backend adapter; owners only ever see this trait.
pub trait RemoteOperation: Send + Sync + std::fmt::Debug {
    /// Backend name of the operation.
    fn name(&self) -> &str;

    /// Current status.
    fn status(&self) -> OperationStatus;

    /// Errors reported by the backend; empty unless the operation failed.
    fn errors(&self) -> Vec<OperationError>;

    /// RFC 3339 end time, when the backend reports one.
    fn end_time(&self) -> Option<&str> {
        None
    }
}

/// What a single poll means for the owner of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Still running. `status_changed` is true if the status differs from
    /// the one observed on the previous poll.
    InProgress { status_changed: bool },

    /// Resolved without errors.
    Succeeded,

    /// Resolved with errors.
    Failed(Vec<OperationError>),
}

impl Verdict {
    /// Returns true if the operation has resolved either way.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }
}

/// Classify a poll result against the previously observed status string.
pub fn observe(previous_status: &str, current: &dyn RemoteOperation) -> Verdict {
    let status = current.status();
    if !status.is_terminal() {
        return Verdict::InProgress {
            status_changed: previous_status != status.as_str(),
        };
    }

    let errors = current.errors();
    if errors.is_empty() {
        Verdict::Succeeded
    } else {
        Verdict::Failed(errors)
    }
}

/// One timestamped entry of an operation's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLog {
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,

    /// Entry text.
    pub message: String,
}

impl OperationLog {
    /// Create an entry stamped now.
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            message: message.into(),
        }
    }
}

/// Capped exponential backoff for redelivering failed handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first redelivery.
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
        }
    }
}

impl Backoff {
    /// Delay before redelivery number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Default interval between polls of an unresolved operation.
///
/// Operations are expected to resolve within minutes, so the interval is
/// fixed rather than backed off.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug)]
    struct Fixed {
        status: OperationStatus,
        errors: Vec<OperationError>,
    }

    impl RemoteOperation for Fixed {
        fn name(&self) -> &str {
            "operation-1"
        }

        fn status(&self) -> OperationStatus {
            self.status
        }

        fn errors(&self) -> Vec<OperationError> {
            self.errors.clone()
        }
    }

    fn quota_error() -> OperationError {
        OperationError {
            code: "QUOTA_EXCEEDED".to_string(),
            location: "zones/us-central1-a".to_string(),
            message: "Quota 'CPUS' exceeded".to_string(),
        }
    }

    #[rstest]
    #[case("PENDING", OperationStatus::Pending)]
    #[case("RUNNING", OperationStatus::Running)]
    #[case("DONE", OperationStatus::Done)]
    fn test_status_parse(#[case] raw: &str, #[case] expected: OperationStatus) {
        assert_eq!(OperationStatus::parse(raw).unwrap(), expected);
        assert_eq!(expected.as_str(), raw);
    }

    #[test]
    fn test_status_parse_unknown() {
        assert_eq!(
            OperationStatus::parse("done"),
            Err(ReconcileError::UnknownStatus("done".to_string()))
        );
    }

    #[rstest]
    #[case("PENDING", OperationStatus::Pending, false)]
    #[case("PENDING", OperationStatus::Running, true)]
    #[case("", OperationStatus::Pending, true)]
    fn test_observe_in_progress(
        #[case] previous: &str,
        #[case] status: OperationStatus,
        #[case] changed: bool,
    ) {
        let op = Fixed {
            status,
            errors: vec![],
        };
        assert_eq!(
            observe(previous, &op),
            Verdict::InProgress {
                status_changed: changed
            }
        );
    }

    #[test]
    fn test_observe_done() {
        let ok = Fixed {
            status: OperationStatus::Done,
            errors: vec![],
        };
        assert_eq!(observe("RUNNING", &ok), Verdict::Succeeded);

        let failed = Fixed {
            status: OperationStatus::Done,
            errors: vec![quota_error()],
        };
        let verdict = observe("RUNNING", &failed);
        assert!(verdict.is_terminal());
        assert_eq!(verdict, Verdict::Failed(vec![quota_error()]));
    }

    #[test]
    fn test_errors_ignored_while_running() {
        // Only a finished operation can fail.
        let op = Fixed {
            status: OperationStatus::Running,
            errors: vec![quota_error()],
        };
        assert!(!observe("RUNNING", &op).is_terminal());
    }

    #[test]
    fn test_operation_error_tolerates_missing_fields() {
        let err: OperationError = serde_json::from_str(r#"{"code":"NOT_FOUND"}"#).unwrap();
        assert_eq!(err.code, "NOT_FOUND");
        assert!(err.location.is_empty());
    }

    #[test]
    fn test_backoff() {
        let backoff = Backoff {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(500), Duration::from_secs(60));
    }
}
