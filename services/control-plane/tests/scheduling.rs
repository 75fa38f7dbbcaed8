mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use batchfleet_control_plane::error::OrchestratorError;
use batchfleet_control_plane::model::{NewJob, OperationService, PipelineStatus};
use batchfleet_control_plane::tasks::{Followup, Task, TaskError};
use common::{new_pipeline, Harness};

#[tokio::test]
async fn test_out_of_range_delay_is_rejected() {
    let h = Harness::new();
    let org = h.org(5).await;

    for delay in [Duration::from_secs(u64::MAX), Duration::from_secs(1_000_000_000_000_000)] {
        let err = h
            .orchestrator
            .enqueue(vec![
                Followup::after(Task::Admit { org_id: org.id }, delay),
                Followup::now(Task::Admit { org_id: org.id }),
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Task(TaskError::Schedule { .. })
        ));
    }

    // The well-formed follow-ups still went out.
    assert_eq!(
        h.scheduler.take_all(),
        vec![Task::Admit { org_id: org.id }, Task::Admit { org_id: org.id }]
    );
}

#[tokio::test]
async fn test_huge_pulling_interval_rejected_at_create() {
    let h = Harness::new();
    let org = h.org(5).await;

    let mut input = new_pipeline("render", 1);
    input.pulling.interval_seconds = 1_000_000_000_000_000;
    let err = h
        .orchestrator
        .pipelines()
        .create(&org.id, input)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert!(h.scheduler.pending().is_empty());
}

#[tokio::test]
async fn test_rejected_followup_does_not_drop_the_others() {
    let h = Harness::new();
    let org = h.org(5).await;
    let pipeline = h.pipeline(&org.id, new_pipeline("render", 1)).await;
    h.settle().await;

    let (job, _, followups) = h
        .orchestrator
        .jobs()
        .create(
            &pipeline.id,
            NewJob {
                id_by_client: Some("frame-1".to_string()),
                message: Default::default(),
                ready: true,
            },
        )
        .await
        .unwrap();
    assert!(followups.is_empty());

    let op = h
        .latest_operation(&pipeline.id, OperationService::Deploy)
        .await;
    h.gateway.finish(&op.handle.name, Vec::new());
    h.scheduler.take_all();
    h.scheduler.reject_publish.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .dispatch(Task::Watch {
            operation_id: op.id,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Task(TaskError::QueueClosed)));

    // The state change stands and the subscription is still scheduled.
    assert_eq!(h.status(&pipeline.id).await, PipelineStatus::Opened);
    assert_eq!(
        h.scheduler.pending(),
        vec![Task::Subscribe {
            pipeline_id: pipeline.id
        }]
    );
    assert!(!h
        .scheduler
        .pending()
        .contains(&Task::Publish { job_id: job.id }));
}
