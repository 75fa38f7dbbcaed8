//! Storage layer for the control plane.
//!
//! This module provides:
//! - The [`Store`] trait every component persists through
//! - An in-memory implementation for tests and dev mode
//! - A Postgres implementation on SQLx
//!
//! Entities are grouped under their parent: pipelines under an
//! organization, operations and jobs under a pipeline. Budget movements
//! ([`Store::reserve`], [`Store::release`]), pipeline status changes
//! ([`Store::update_pipeline`]) and operation claims
//! ([`Store::insert_operation_exclusive`]) are atomic.

mod error;
mod memory;
mod postgres;

pub use error::DbError;
pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use batchfleet_id::{JobId, OperationId, OrgId, PipelineId};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::model::{Job, JobStatus, Organization, Pipeline, PipelineOperation, PipelineStatus};

/// Outcome of an atomic budget reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Debited and moved to `Reserved`. Carries the updated pipeline.
    Reserved(Pipeline),

    /// The organization cannot cover the pipeline's consumption right now.
    InsufficientBudget { available: i64, required: i64 },

    /// The pipeline is missing or no longer `Pending`.
    NotPending,
}

/// Keyed entity repository.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_organization(&self, org: &Organization) -> Result<(), DbError>;

    async fn get_organization(&self, id: &OrgId) -> Result<Option<Organization>, DbError>;

    async fn list_organizations(&self) -> Result<Vec<Organization>, DbError>;

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), DbError>;

    async fn get_pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>, DbError>;

    /// Pipelines of an organization, oldest first.
    async fn list_pipelines(&self, org_id: &OrgId) -> Result<Vec<Pipeline>, DbError>;

    /// Pipelines in any of `statuses`, optionally restricted to one
    /// organization, ordered by `(created_at, id)`.
    async fn pipelines_with_status(
        &self,
        org_id: Option<&OrgId>,
        statuses: &[PipelineStatus],
    ) -> Result<Vec<Pipeline>, DbError>;

    /// `Pending` pipelines whose dependency references any of `job_ids`.
    async fn pending_pipelines_depending_on(
        &self,
        job_ids: &[JobId],
    ) -> Result<Vec<Pipeline>, DbError>;

    /// Compare-and-set write of a pipeline.
    ///
    /// Succeeds only if the stored status is one of `expected`. The
    /// `cancelled` flag is sticky: a stored `true` is never overwritten.
    /// `token_consumption` is never rewritten. Returns false when the
    /// guard did not match.
    async fn update_pipeline(
        &self,
        pipeline: &Pipeline,
        expected: &[PipelineStatus],
    ) -> Result<bool, DbError>;

    /// Delete a `Closed` pipeline with its operations and jobs. Returns
    /// false if the pipeline is missing or not `Closed`.
    async fn delete_pipeline(&self, id: &PipelineId) -> Result<bool, DbError>;

    /// Debit the organization and move a `Pending` pipeline to `Reserved`,
    /// in one transaction.
    async fn reserve(&self, id: &PipelineId) -> Result<Reservation, DbError>;

    /// Credit the organization and move the pipeline to `Closed`, in one
    /// transaction, if its status is one of `from`. Returns false (and
    /// credits nothing) otherwise.
    async fn release(&self, id: &PipelineId, from: &[PipelineStatus]) -> Result<bool, DbError>;

    async fn insert_operation(&self, op: &PipelineOperation) -> Result<(), DbError>;

    /// Insert `op` only if its pipeline is in `status` and has no other
    /// unresolved operation of the same service, in one transaction.
    /// Returns false when either guard fails.
    async fn insert_operation_exclusive(
        &self,
        op: &PipelineOperation,
        status: PipelineStatus,
    ) -> Result<bool, DbError>;

    async fn get_operation(&self, id: &OperationId) -> Result<Option<PipelineOperation>, DbError>;

    async fn update_operation(&self, op: &PipelineOperation) -> Result<(), DbError>;

    /// Operations of a pipeline, oldest first.
    async fn list_operations(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<Vec<PipelineOperation>, DbError>;

    /// Load-or-create keyed on `(pipeline_id, id_by_client)`. Returns the
    /// stored job and whether it was created by this call.
    async fn insert_job(&self, job: &Job) -> Result<(Job, bool), DbError>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DbError>;

    /// Compare-and-set write of a job: succeeds only if the stored status
    /// is one of `expected`. Returns false when the guard did not match.
    async fn update_job(&self, job: &Job, expected: &[JobStatus]) -> Result<bool, DbError>;

    /// Jobs of a pipeline, oldest first.
    async fn list_jobs(&self, pipeline_id: &PipelineId) -> Result<Vec<Job>, DbError>;

    /// Current status of each job in `ids` that exists.
    async fn job_statuses(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, DbError>;

    /// Check the backing storage is reachable.
    async fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/batchfleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` when `DATABASE_URL` is unset.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let database_url = var("DATABASE_URL")?;

        let max_connections = var("DB_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = var("DB_MIN_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Some(Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        })
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/control-plane/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(DbError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get a store handle over this pool.
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}
