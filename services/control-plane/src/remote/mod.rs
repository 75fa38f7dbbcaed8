//! Remote operation gateway.
//!
//! The compute backend is reached only through [`RemoteGateway`]. Every
//! call returns a handle that the lifecycle persists and polls until the
//! operation resolves.

pub mod gcp;

use async_trait::async_trait;
use batchfleet_reconcile::RemoteOperation;
use thiserror::Error;

use crate::model::{OperationService, Pipeline, RemoteHandle};

pub use gcp::{ComputeOperation, DeploymentOperation, GcpConfig, GcpGateway};

/// Remote call failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The target resource or operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Any other failure; the caller should retry later.
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// A remote operation just issued or looked up.
#[derive(Debug)]
pub struct Issued {
    pub handle: RemoteHandle,
    pub operation: Box<dyn RemoteOperation>,
}

/// Cloud backend that provisions pipelines.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Start provisioning the pipeline's resources.
    async fn create(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError>;

    /// Start tearing down the pipeline's resources.
    async fn delete(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError>;

    /// Resize the pipeline's instance group.
    async fn resize(&self, pipeline: &Pipeline, size: u32) -> Result<Issued, GatewayError>;

    /// Poll a previously issued operation.
    async fn get(
        &self,
        service: OperationService,
        handle: &RemoteHandle,
    ) -> Result<Box<dyn RemoteOperation>, GatewayError>;

    /// Most recent operation against the pipeline's deployment.
    async fn latest_operation(&self, pipeline: &Pipeline) -> Result<Issued, GatewayError>;
}
