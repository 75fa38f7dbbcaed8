//! In-memory store for tests and dev mode.

use std::collections::HashMap;

use async_trait::async_trait;
use batchfleet_id::{JobId, OperationId, OrgId, PipelineId};
use chrono::Utc;
use tokio::sync::RwLock;

use super::{DbError, Reservation, Store};
use crate::model::{Job, JobStatus, Organization, Pipeline, PipelineOperation, PipelineStatus};

#[derive(Default)]
struct Inner {
    orgs: HashMap<OrgId, Organization>,
    pipelines: HashMap<PipelineId, Pipeline>,
    operations: HashMap<OperationId, PipelineOperation>,
    jobs: HashMap<JobId, Job>,
}

/// Store kept entirely in process memory. One lock covers every entity, so
/// each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_pipelines<'a>(iter: impl Iterator<Item = &'a Pipeline>) -> Vec<Pipeline> {
    let mut out: Vec<Pipeline> = iter.cloned().collect();
    out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_organization(&self, org: &Organization) -> Result<(), DbError> {
        self.inner.write().await.orgs.insert(org.id, org.clone());
        Ok(())
    }

    async fn get_organization(&self, id: &OrgId) -> Result<Option<Organization>, DbError> {
        Ok(self.inner.read().await.orgs.get(id).cloned())
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, DbError> {
        let inner = self.inner.read().await;
        let mut orgs: Vec<Organization> = inner.orgs.values().cloned().collect();
        orgs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(orgs)
    }

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), DbError> {
        let mut inner = self.inner.write().await;
        if !inner.orgs.contains_key(&pipeline.org_id) {
            return Err(DbError::MissingParent {
                entity: "organization",
                id: pipeline.org_id.to_string(),
            });
        }
        inner.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn get_pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>, DbError> {
        Ok(self.inner.read().await.pipelines.get(id).cloned())
    }

    async fn list_pipelines(&self, org_id: &OrgId) -> Result<Vec<Pipeline>, DbError> {
        let inner = self.inner.read().await;
        Ok(sorted_pipelines(
            inner.pipelines.values().filter(|p| p.org_id == *org_id),
        ))
    }

    async fn pipelines_with_status(
        &self,
        org_id: Option<&OrgId>,
        statuses: &[PipelineStatus],
    ) -> Result<Vec<Pipeline>, DbError> {
        let inner = self.inner.read().await;
        Ok(sorted_pipelines(inner.pipelines.values().filter(|p| {
            statuses.contains(&p.status) && org_id.is_none_or(|org| p.org_id == *org)
        })))
    }

    async fn pending_pipelines_depending_on(
        &self,
        job_ids: &[JobId],
    ) -> Result<Vec<Pipeline>, DbError> {
        let inner = self.inner.read().await;
        Ok(sorted_pipelines(inner.pipelines.values().filter(|p| {
            p.status == PipelineStatus::Pending && p.dependency.references_any(job_ids)
        })))
    }

    async fn update_pipeline(
        &self,
        pipeline: &Pipeline,
        expected: &[PipelineStatus],
    ) -> Result<bool, DbError> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.pipelines.get_mut(&pipeline.id) else {
            return Ok(false);
        };
        if !expected.contains(&stored.status) {
            return Ok(false);
        }

        let cancelled = stored.cancelled || pipeline.cancelled;
        let token_consumption = stored.token_consumption;
        *stored = pipeline.clone();
        stored.cancelled = cancelled;
        stored.token_consumption = token_consumption;
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_pipeline(&self, id: &PipelineId) -> Result<bool, DbError> {
        let mut inner = self.inner.write().await;
        match inner.pipelines.get(id) {
            Some(p) if p.status == PipelineStatus::Closed => {}
            _ => return Ok(false),
        }
        inner.pipelines.remove(id);
        inner.operations.retain(|_, op| op.pipeline_id != *id);
        inner.jobs.retain(|_, job| job.pipeline_id != *id);
        Ok(true)
    }

    async fn reserve(&self, id: &PipelineId) -> Result<Reservation, DbError> {
        let mut inner = self.inner.write().await;
        let Inner {
            orgs, pipelines, ..
        } = &mut *inner;

        let Some(pipeline) = pipelines.get_mut(id) else {
            return Ok(Reservation::NotPending);
        };
        if pipeline.status != PipelineStatus::Pending {
            return Ok(Reservation::NotPending);
        }
        let Some(org) = orgs.get_mut(&pipeline.org_id) else {
            return Err(DbError::MissingParent {
                entity: "organization",
                id: pipeline.org_id.to_string(),
            });
        };
        if !org.can_afford(pipeline.token_consumption) {
            return Ok(Reservation::InsufficientBudget {
                available: org.token_budget,
                required: pipeline.token_consumption,
            });
        }

        let now = Utc::now();
        org.token_budget -= pipeline.token_consumption;
        org.updated_at = now;
        pipeline.status = PipelineStatus::Reserved;
        pipeline.updated_at = now;
        Ok(Reservation::Reserved(pipeline.clone()))
    }

    async fn release(&self, id: &PipelineId, from: &[PipelineStatus]) -> Result<bool, DbError> {
        let mut inner = self.inner.write().await;
        let Inner {
            orgs, pipelines, ..
        } = &mut *inner;

        let Some(pipeline) = pipelines.get_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&pipeline.status) {
            return Ok(false);
        }
        let Some(org) = orgs.get_mut(&pipeline.org_id) else {
            return Err(DbError::MissingParent {
                entity: "organization",
                id: pipeline.org_id.to_string(),
            });
        };

        let now = Utc::now();
        org.token_budget += pipeline.token_consumption;
        org.updated_at = now;
        pipeline.status = PipelineStatus::Closed;
        pipeline.updated_at = now;
        Ok(true)
    }

    async fn insert_operation(&self, op: &PipelineOperation) -> Result<(), DbError> {
        let mut inner = self.inner.write().await;
        if !inner.pipelines.contains_key(&op.pipeline_id) {
            return Err(DbError::MissingParent {
                entity: "pipeline",
                id: op.pipeline_id.to_string(),
            });
        }
        inner.operations.insert(op.id, op.clone());
        Ok(())
    }

    async fn insert_operation_exclusive(
        &self,
        op: &PipelineOperation,
        status: PipelineStatus,
    ) -> Result<bool, DbError> {
        let mut inner = self.inner.write().await;
        let Some(pipeline) = inner.pipelines.get(&op.pipeline_id) else {
            return Err(DbError::MissingParent {
                entity: "pipeline",
                id: op.pipeline_id.to_string(),
            });
        };
        if pipeline.status != status {
            return Ok(false);
        }
        let busy = inner.operations.values().any(|other| {
            other.pipeline_id == op.pipeline_id
                && other.service == op.service
                && !other.is_resolved()
        });
        if busy {
            return Ok(false);
        }
        inner.operations.insert(op.id, op.clone());
        Ok(true)
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<PipelineOperation>, DbError> {
        Ok(self.inner.read().await.operations.get(id).cloned())
    }

    async fn update_operation(&self, op: &PipelineOperation) -> Result<(), DbError> {
        let mut inner = self.inner.write().await;
        if let Some(stored) = inner.operations.get_mut(&op.id) {
            *stored = op.clone();
        }
        Ok(())
    }

    async fn list_operations(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<Vec<PipelineOperation>, DbError> {
        let inner = self.inner.read().await;
        let mut ops: Vec<PipelineOperation> = inner
            .operations
            .values()
            .filter(|op| op.pipeline_id == *pipeline_id)
            .cloned()
            .collect();
        ops.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(ops)
    }

    async fn insert_job(&self, job: &Job) -> Result<(Job, bool), DbError> {
        let mut inner = self.inner.write().await;
        if !inner.pipelines.contains_key(&job.pipeline_id) {
            return Err(DbError::MissingParent {
                entity: "pipeline",
                id: job.pipeline_id.to_string(),
            });
        }
        if let Some(existing) = inner
            .jobs
            .values()
            .find(|j| j.pipeline_id == job.pipeline_id && j.id_by_client == job.id_by_client)
        {
            return Ok((existing.clone(), false));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok((job.clone(), true))
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DbError> {
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn update_job(&self, job: &Job, expected: &[JobStatus]) -> Result<bool, DbError> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(&job.id) {
            Some(stored) if expected.contains(&stored.status) => {
                *stored = job.clone();
                stored.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_jobs(&self, pipeline_id: &PipelineId) -> Result<Vec<Job>, DbError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.pipeline_id == *pipeline_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(jobs)
    }

    async fn job_statuses(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobStatus>, DbError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.jobs.get(id).map(|j| (*id, j.status)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pipeline::fixtures::new_pipeline;
    use crate::model::NewOrganization;

    async fn seeded(budget: i64) -> (MemoryStore, Organization) {
        let store = MemoryStore::new();
        let org = Organization::new(NewOrganization {
            name: "acme".to_string(),
            memo: String::new(),
            token_budget: budget,
        });
        store.insert_organization(&org).await.unwrap();
        (store, org)
    }

    async fn pending(store: &MemoryStore, org: &Organization, tokens: i64) -> Pipeline {
        let mut input = new_pipeline("pipeline-1");
        input.token_consumption = tokens;
        let mut pl = Pipeline::new(org.id, input);
        pl.status = PipelineStatus::Pending;
        store.insert_pipeline(&pl).await.unwrap();
        pl
    }

    #[tokio::test]
    async fn test_reserve_and_release_conserve_budget() {
        let (store, org) = seeded(3).await;
        let pl = pending(&store, &org, 2).await;

        let reserved = store.reserve(&pl.id).await.unwrap();
        assert!(matches!(reserved, Reservation::Reserved(ref p) if p.status == PipelineStatus::Reserved));
        assert_eq!(store.get_organization(&org.id).await.unwrap().unwrap().token_budget, 1);

        assert_eq!(store.reserve(&pl.id).await.unwrap(), Reservation::NotPending);

        assert!(store.release(&pl.id, &[PipelineStatus::Reserved]).await.unwrap());
        assert!(!store.release(&pl.id, &[PipelineStatus::Reserved]).await.unwrap());
        assert_eq!(store.get_organization(&org.id).await.unwrap().unwrap().token_budget, 3);
    }

    #[tokio::test]
    async fn test_reserve_insufficient_budget() {
        let (store, org) = seeded(1).await;
        let pl = pending(&store, &org, 2).await;
        assert_eq!(
            store.reserve(&pl.id).await.unwrap(),
            Reservation::InsufficientBudget {
                available: 1,
                required: 2
            }
        );
        let stored = store.get_pipeline(&pl.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PipelineStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_pipeline_guard_and_sticky_cancel() {
        let (store, org) = seeded(1).await;
        let mut pl = pending(&store, &org, 1).await;

        let mut cancelled = pl.clone();
        cancelled.cancelled = true;
        assert!(store
            .update_pipeline(&cancelled, &[PipelineStatus::Pending])
            .await
            .unwrap());

        pl.status = PipelineStatus::Reserved;
        assert!(!store
            .update_pipeline(&pl, &[PipelineStatus::Opened])
            .await
            .unwrap());
        assert!(store
            .update_pipeline(&pl, &[PipelineStatus::Pending])
            .await
            .unwrap());

        let stored = store.get_pipeline(&pl.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PipelineStatus::Reserved);
        assert!(stored.cancelled);
    }

    #[tokio::test]
    async fn test_insert_job_is_load_or_create() {
        let (store, org) = seeded(1).await;
        let pl = pending(&store, &org, 1).await;

        let input = crate::model::NewJob {
            id_by_client: Some("job-1".to_string()),
            message: Default::default(),
            ready: true,
        };
        let first = Job::new(pl.id, &pl.name, input.clone());
        let (stored, created) = store.insert_job(&first).await.unwrap();
        assert!(created);
        assert_eq!(stored.id, first.id);

        let second = Job::new(pl.id, &pl.name, input);
        let (stored, created) = store.insert_job(&second).await.unwrap();
        assert!(!created);
        assert_eq!(stored.id, first.id);
        assert_eq!(store.list_jobs(&pl.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_job_guards_status() {
        let (store, org) = seeded(1).await;
        let pl = pending(&store, &org, 1).await;
        let input = crate::model::NewJob {
            id_by_client: Some("job-1".to_string()),
            message: Default::default(),
            ready: true,
        };
        let (mut job, _) = store.insert_job(&Job::new(pl.id, &pl.name, input)).await.unwrap();

        let mut executing = job.clone();
        executing.status = JobStatus::Executing;
        assert!(store.update_job(&executing, &[JobStatus::Ready]).await.unwrap());

        job.status = JobStatus::Published;
        assert!(!store.update_job(&job, &[JobStatus::Publishing]).await.unwrap());

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Executing);
    }

    #[tokio::test]
    async fn test_exclusive_operation_insert() {
        use crate::model::OperationService;

        let (store, org) = seeded(1).await;
        let pl = pending(&store, &org, 1).await;

        let first = PipelineOperation::claimed(&pl, OperationService::Resize);
        assert!(!store
            .insert_operation_exclusive(&first, PipelineStatus::Opened)
            .await
            .unwrap());
        assert!(store
            .insert_operation_exclusive(&first, PipelineStatus::Pending)
            .await
            .unwrap());

        let second = PipelineOperation::claimed(&pl, OperationService::Resize);
        assert!(!store
            .insert_operation_exclusive(&second, PipelineStatus::Pending)
            .await
            .unwrap());

        let mut done = first.clone();
        done.resolve_unpolled("abandoned");
        store.update_operation(&done).await.unwrap();
        assert!(store
            .insert_operation_exclusive(&second, PipelineStatus::Pending)
            .await
            .unwrap());
        assert_eq!(store.list_operations(&pl.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_requires_closed() {
        let (store, org) = seeded(1).await;
        let mut pl = pending(&store, &org, 1).await;
        assert!(!store.delete_pipeline(&pl.id).await.unwrap());

        pl.status = PipelineStatus::Closed;
        store
            .update_pipeline(&pl, &[PipelineStatus::Pending])
            .await
            .unwrap();
        assert!(store.delete_pipeline(&pl.id).await.unwrap());
        assert!(store.get_pipeline(&pl.id).await.unwrap().is_none());
    }
}
