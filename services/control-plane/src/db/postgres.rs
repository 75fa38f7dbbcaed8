//! Postgres-backed store.
//!
//! Budget movements run in one transaction that locks the pipeline row and
//! then the organization row, always in that order.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use batchfleet_id::{JobId, OperationId, OrgId, PipelineId};
use batchfleet_reconcile::OperationStatus;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row};

use super::{DbError, Reservation, Store};
use crate::model::{
    ClosePolicy, Dependency, DependencyCondition, Job, JobMessage, JobStatus, OperationService,
    Organization, Pipeline, PipelineOperation, PipelineStatus, RemoteHandle,
};

const PIPELINE_COLUMNS: &str = "id, org_id, name, project_id, zone, instance, container, \
     target_size, token_consumption, status, dependency_condition, dependency_job_ids, \
     close_policy, pulling, job_scaler, deployment_name, cancelled, created_at, updated_at";

const OPERATION_COLUMNS: &str = "id, pipeline_id, service, project_id, zone, name, \
     remote_status, errors, logs, target_size, created_at, updated_at";

const INSERT_OPERATION: &str = "INSERT INTO pipeline_operations (id, pipeline_id, service, \
     project_id, zone, name, remote_status, errors, logs, target_size, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";

const JOB_COLUMNS: &str = "id, pipeline_id, id_by_client, status, attributes, data, message_id, \
     published_at, hostname, zone, start_time, finish_time, output, created_at, updated_at";

/// Store over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode<T: FromStr>(column: &'static str, value: String) -> Result<T, DbError> {
    value
        .parse()
        .map_err(|_| DbError::Corrupt { column, value })
}

fn decode_with<T>(
    column: &'static str,
    value: String,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, DbError> {
    parse(&value).ok_or(DbError::Corrupt { column, value })
}

fn get<'r, T>(row: &'r PgRow, column: &'static str) -> Result<T, DbError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(DbError::Query)
}

fn to_u32(column: &'static str, value: i32) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::Corrupt {
        column,
        value: value.to_string(),
    })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn statuses_param<S: ToString>(statuses: &[S]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

fn ids_param<T: ToString>(ids: &[T]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

/// Foreign key violations surface as a missing parent.
fn insert_error(err: sqlx::Error, entity: &'static str, id: String) -> DbError {
    let is_fk_violation = err
        .as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "23503");
    if is_fk_violation {
        DbError::MissingParent { entity, id }
    } else {
        DbError::Query(err)
    }
}

fn org_from_row(row: &PgRow) -> Result<Organization, DbError> {
    Ok(Organization {
        id: decode("id", get(row, "id")?)?,
        name: get(row, "name")?,
        memo: get(row, "memo")?,
        token_budget: get(row, "token_budget")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn pipeline_from_row(row: &PgRow) -> Result<Pipeline, DbError> {
    let job_ids: Vec<String> = get(row, "dependency_job_ids")?;
    let job_ids = job_ids
        .into_iter()
        .map(|id| decode::<JobId>("dependency_job_ids", id))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Pipeline {
        id: decode("id", get(row, "id")?)?,
        org_id: decode("org_id", get(row, "org_id")?)?,
        name: get(row, "name")?,
        project_id: get(row, "project_id")?,
        zone: get(row, "zone")?,
        instance: get::<Json<_>>(row, "instance")?.0,
        container: get::<Json<_>>(row, "container")?.0,
        target_size: to_u32("target_size", get(row, "target_size")?)?,
        token_consumption: get(row, "token_consumption")?,
        status: decode_with("status", get(row, "status")?, PipelineStatus::parse)?,
        dependency: Dependency {
            condition: decode_with(
                "dependency_condition",
                get(row, "dependency_condition")?,
                DependencyCondition::parse,
            )?,
            job_ids,
        },
        close_policy: decode_with("close_policy", get(row, "close_policy")?, ClosePolicy::parse)?,
        pulling: get::<Json<_>>(row, "pulling")?.0,
        job_scaler: get::<Json<_>>(row, "job_scaler")?.0,
        deployment_name: get(row, "deployment_name")?,
        cancelled: get(row, "cancelled")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn insert_operation_query(op: &PipelineOperation) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(INSERT_OPERATION)
        .bind(op.id.to_string())
        .bind(op.pipeline_id.to_string())
        .bind(op.service.as_str())
        .bind(&op.handle.project_id)
        .bind(&op.handle.zone)
        .bind(&op.handle.name)
        .bind(&op.remote_status)
        .bind(Json(&op.errors))
        .bind(Json(&op.logs))
        .bind(op.target_size.map(to_i32))
        .bind(op.created_at)
        .bind(op.updated_at)
}

fn operation_from_row(row: &PgRow) -> Result<PipelineOperation, DbError> {
    let target_size: Option<i32> = get(row, "target_size")?;
    Ok(PipelineOperation {
        id: decode("id", get(row, "id")?)?,
        pipeline_id: decode("pipeline_id", get(row, "pipeline_id")?)?,
        service: decode_with("service", get(row, "service")?, OperationService::parse)?,
        handle: RemoteHandle {
            project_id: get(row, "project_id")?,
            zone: get(row, "zone")?,
            name: get(row, "name")?,
        },
        remote_status: get(row, "remote_status")?,
        errors: get::<Json<_>>(row, "errors")?.0,
        logs: get::<Json<_>>(row, "logs")?.0,
        target_size: target_size
            .map(|size| to_u32("target_size", size))
            .transpose()?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, DbError> {
    Ok(Job {
        id: decode("id", get(row, "id")?)?,
        pipeline_id: decode("pipeline_id", get(row, "pipeline_id")?)?,
        id_by_client: get(row, "id_by_client")?,
        status: decode_with("status", get(row, "status")?, JobStatus::parse)?,
        message: JobMessage {
            attributes: get::<Json<_>>(row, "attributes")?.0,
            data: get(row, "data")?,
        },
        message_id: get(row, "message_id")?,
        published_at: get(row, "published_at")?,
        hostname: get(row, "hostname")?,
        zone: get(row, "zone")?,
        start_time: get(row, "start_time")?,
        finish_time: get(row, "finish_time")?,
        output: get(row, "output")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn insert_organization(&self, org: &Organization) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, memo, token_budget, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(org.id.to_string())
        .bind(&org.name)
        .bind(&org.memo)
        .bind(org.token_budget)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    async fn get_organization(&self, id: &OrgId) -> Result<Option<Organization>, DbError> {
        sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?
            .map(|row| org_from_row(&row))
            .transpose()
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, DbError> {
        sqlx::query("SELECT * FROM organizations ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?
            .iter()
            .map(org_from_row)
            .collect()
    }

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), DbError> {
        sqlx::query(&format!(
            "INSERT INTO pipelines ({PIPELINE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        ))
        .bind(pipeline.id.to_string())
        .bind(pipeline.org_id.to_string())
        .bind(&pipeline.name)
        .bind(&pipeline.project_id)
        .bind(&pipeline.zone)
        .bind(Json(&pipeline.instance))
        .bind(Json(&pipeline.container))
        .bind(to_i32(pipeline.target_size))
        .bind(pipeline.token_consumption)
        .bind(pipeline.status.as_str())
        .bind(pipeline.dependency.condition.as_str())
        .bind(ids_param(&pipeline.dependency.job_ids))
        .bind(pipeline.close_policy.as_str())
        .bind(Json(&pipeline.pulling))
        .bind(Json(&pipeline.job_scaler))
        .bind(&pipeline.deployment_name)
        .bind(pipeline.cancelled)
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "organization", pipeline.org_id.to_string()))?;
        Ok(())
    }

    async fn get_pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>, DbError> {
        sqlx::query(&format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?
            .map(|row| pipeline_from_row(&row))
            .transpose()
    }

    async fn list_pipelines(&self, org_id: &OrgId) -> Result<Vec<Pipeline>, DbError> {
        sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE org_id = $1 ORDER BY created_at, id"
        ))
        .bind(org_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        .iter()
        .map(pipeline_from_row)
        .collect()
    }

    async fn pipelines_with_status(
        &self,
        org_id: Option<&OrgId>,
        statuses: &[PipelineStatus],
    ) -> Result<Vec<Pipeline>, DbError> {
        sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines \
             WHERE status = ANY($1) AND ($2::TEXT IS NULL OR org_id = $2) \
             ORDER BY created_at, id"
        ))
        .bind(statuses_param(statuses))
        .bind(org_id.map(ToString::to_string))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        .iter()
        .map(pipeline_from_row)
        .collect()
    }

    async fn pending_pipelines_depending_on(
        &self,
        job_ids: &[JobId],
    ) -> Result<Vec<Pipeline>, DbError> {
        sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines \
             WHERE status = $1 AND dependency_job_ids && $2 \
             ORDER BY created_at, id"
        ))
        .bind(PipelineStatus::Pending.as_str())
        .bind(ids_param(job_ids))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        .iter()
        .map(pipeline_from_row)
        .collect()
    }

    async fn update_pipeline(
        &self,
        pipeline: &Pipeline,
        expected: &[PipelineStatus],
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines SET
                name = $2,
                project_id = $3,
                zone = $4,
                instance = $5,
                container = $6,
                target_size = $7,
                status = $8,
                dependency_condition = $9,
                dependency_job_ids = $10,
                close_policy = $11,
                pulling = $12,
                deployment_name = $13,
                cancelled = cancelled OR $14,
                job_scaler = $16,
                updated_at = now()
            WHERE id = $1 AND status = ANY($15)
            "#,
        )
        .bind(pipeline.id.to_string())
        .bind(&pipeline.name)
        .bind(&pipeline.project_id)
        .bind(&pipeline.zone)
        .bind(Json(&pipeline.instance))
        .bind(Json(&pipeline.container))
        .bind(to_i32(pipeline.target_size))
        .bind(pipeline.status.as_str())
        .bind(pipeline.dependency.condition.as_str())
        .bind(ids_param(&pipeline.dependency.job_ids))
        .bind(pipeline.close_policy.as_str())
        .bind(Json(&pipeline.pulling))
        .bind(&pipeline.deployment_name)
        .bind(pipeline.cancelled)
        .bind(statuses_param(expected))
        .bind(Json(&pipeline.job_scaler))
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_pipeline(&self, id: &PipelineId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = $1 AND status = $2")
            .bind(id.to_string())
            .bind(PipelineStatus::Closed.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() == 1)
    }

    async fn reserve(&self, id: &PipelineId) -> Result<Reservation, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let Some(row) = sqlx::query(
            "SELECT org_id, status, token_consumption FROM pipelines WHERE id = $1 FOR UPDATE",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::Query)?
        else {
            return Ok(Reservation::NotPending);
        };

        let status: String = get(&row, "status")?;
        if status != PipelineStatus::Pending.as_str() {
            return Ok(Reservation::NotPending);
        }
        let org_id: String = get(&row, "org_id")?;
        let required: i64 = get(&row, "token_consumption")?;

        let available: i64 = sqlx::query_scalar(
            "SELECT token_budget FROM organizations WHERE id = $1 FOR UPDATE",
        )
        .bind(&org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::Query)?
        .ok_or_else(|| DbError::MissingParent {
            entity: "organization",
            id: org_id.clone(),
        })?;

        if required > available {
            return Ok(Reservation::InsufficientBudget {
                available,
                required,
            });
        }

        sqlx::query(
            "UPDATE organizations SET token_budget = token_budget - $2, updated_at = now() WHERE id = $1",
        )
        .bind(&org_id)
        .bind(required)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        let row = sqlx::query(&format!(
            "UPDATE pipelines SET status = $2, updated_at = now() WHERE id = $1 \
             RETURNING {PIPELINE_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(PipelineStatus::Reserved.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::Query)?;
        let pipeline = pipeline_from_row(&row)?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(Reservation::Reserved(pipeline))
    }

    async fn release(&self, id: &PipelineId, from: &[PipelineStatus]) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let Some(row) = sqlx::query(
            "SELECT org_id, token_consumption FROM pipelines \
             WHERE id = $1 AND status = ANY($2) FOR UPDATE",
        )
        .bind(id.to_string())
        .bind(statuses_param(from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::Query)?
        else {
            return Ok(false);
        };
        let org_id: String = get(&row, "org_id")?;
        let tokens: i64 = get(&row, "token_consumption")?;

        let credited = sqlx::query(
            "UPDATE organizations SET token_budget = token_budget + $2, updated_at = now() WHERE id = $1",
        )
        .bind(&org_id)
        .bind(tokens)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;
        if credited.rows_affected() != 1 {
            return Err(DbError::MissingParent {
                entity: "organization",
                id: org_id,
            });
        }

        sqlx::query("UPDATE pipelines SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id.to_string())
            .bind(PipelineStatus::Closed.as_str())
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(true)
    }

    async fn insert_operation(&self, op: &PipelineOperation) -> Result<(), DbError> {
        insert_operation_query(op)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(e, "pipeline", op.pipeline_id.to_string()))?;
        Ok(())
    }

    async fn insert_operation_exclusive(
        &self,
        op: &PipelineOperation,
        status: PipelineStatus,
    ) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let current: String =
            sqlx::query_scalar("SELECT status FROM pipelines WHERE id = $1 FOR UPDATE")
                .bind(op.pipeline_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(DbError::Query)?
                .ok_or_else(|| DbError::MissingParent {
                    entity: "pipeline",
                    id: op.pipeline_id.to_string(),
                })?;
        if current != status.as_str() {
            return Ok(false);
        }

        let busy: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pipeline_operations \
             WHERE pipeline_id = $1 AND service = $2 AND remote_status <> $3)",
        )
        .bind(op.pipeline_id.to_string())
        .bind(op.service.as_str())
        .bind(OperationStatus::Done.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::Query)?;
        if busy {
            return Ok(false);
        }

        insert_operation_query(op)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(true)
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<PipelineOperation>, DbError> {
        sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pipeline_operations WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?
        .map(|row| operation_from_row(&row))
        .transpose()
    }

    async fn update_operation(&self, op: &PipelineOperation) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE pipeline_operations SET
                remote_status = $2,
                errors = $3,
                logs = $4,
                target_size = $5,
                updated_at = $6,
                project_id = $7,
                zone = $8,
                name = $9
            WHERE id = $1
            "#,
        )
        .bind(op.id.to_string())
        .bind(&op.remote_status)
        .bind(Json(&op.errors))
        .bind(Json(&op.logs))
        .bind(op.target_size.map(to_i32))
        .bind(op.updated_at)
        .bind(&op.handle.project_id)
        .bind(&op.handle.zone)
        .bind(&op.handle.name)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    async fn list_operations(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<Vec<PipelineOperation>, DbError> {
        sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pipeline_operations \
             WHERE pipeline_id = $1 ORDER BY created_at, id"
        ))
        .bind(pipeline_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        .iter()
        .map(operation_from_row)
        .collect()
    }

    async fn insert_job(&self, job: &Job) -> Result<(Job, bool), DbError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (pipeline_id, id_by_client) DO NOTHING"
        ))
        .bind(job.id.to_string())
        .bind(job.pipeline_id.to_string())
        .bind(&job.id_by_client)
        .bind(job.status.as_str())
        .bind(Json(&job.message.attributes))
        .bind(&job.message.data)
        .bind(&job.message_id)
        .bind(job.published_at)
        .bind(&job.hostname)
        .bind(&job.zone)
        .bind(&job.start_time)
        .bind(&job.finish_time)
        .bind(&job.output)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "pipeline", job.pipeline_id.to_string()))?;

        if inserted.rows_affected() == 1 {
            return Ok((job.clone(), true));
        }

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 AND id_by_client = $2"
        ))
        .bind(job.pipeline_id.to_string())
        .bind(&job.id_by_client)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok((job_from_row(&row)?, false))
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DbError> {
        sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?
            .map(|row| job_from_row(&row))
            .transpose()
    }

    async fn update_job(&self, job: &Job, expected: &[JobStatus]) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                attributes = $3,
                data = $4,
                message_id = $5,
                published_at = $6,
                hostname = $7,
                zone = $8,
                start_time = $9,
                finish_time = $10,
                output = $11,
                updated_at = now()
            WHERE id = $1 AND status = ANY($12)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.status.as_str())
        .bind(Json(&job.message.attributes))
        .bind(&job.message.data)
        .bind(&job.message_id)
        .bind(job.published_at)
        .bind(&job.hostname)
        .bind(&job.zone)
        .bind(&job.start_time)
        .bind(&job.finish_time)
        .bind(&job.output)
        .bind(statuses_param(expected))
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_jobs(&self, pipeline_id: &PipelineId) -> Result<Vec<Job>, DbError> {
        sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 ORDER BY created_at, id"
        ))
        .bind(pipeline_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?
        .iter()
        .map(job_from_row)
        .collect()
    }

    async fn job_statuses(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, DbError> {
        let rows = sqlx::query("SELECT id, status FROM jobs WHERE id = ANY($1)")
            .bind(ids_param(ids))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;

        rows.iter()
            .map(|row| {
                let id: JobId = decode("id", get(row, "id")?)?;
                let status = decode_with("status", get(row, "status")?, JobStatus::parse)?;
                Ok((id, status))
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }
}
