//! Errors returned by the orchestration handlers.

use thiserror::Error;

use crate::bus::BusError;
use crate::db::DbError;
use crate::model::ProgressError;
use crate::remote::GatewayError;
use crate::tasks::TaskError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The request is not valid in the entity's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A concurrent change won.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("invalid progress report: {0}")]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns true if repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Db(_) | Self::Gateway(_) | Self::Bus(_) | Self::Task(_)
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
