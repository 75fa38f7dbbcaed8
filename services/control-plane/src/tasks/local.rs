//! In-process delayed task queue.
//!
//! [`LocalTaskQueue`] parks each scheduled task until its ETA and then
//! hands it to the [`TaskWorker`], which runs it through the orchestrator.
//! A failed run is redelivered after a capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchfleet_id::TaskId;
use batchfleet_reconcile::Backoff;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use super::{Task, TaskError, TaskScheduler};
use crate::orchestrator::Orchestrator;

/// A task due for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub id: TaskId,
    pub task: Task,

    /// Number of failed runs so far.
    pub attempt: u32,
}

/// [`TaskScheduler`] backed by tokio timers and a channel.
#[derive(Clone)]
pub struct LocalTaskQueue {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl LocalTaskQueue {
    /// Create a queue and the receiving end the worker drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn deliver_after(&self, delivery: Delivery, wait: Duration) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            if sender.send(delivery).is_err() {
                debug!(task = %delivery.task, "Task queue closed before delivery");
            }
        });
    }
}

#[async_trait]
impl TaskScheduler for LocalTaskQueue {
    async fn schedule(&self, task: Task, eta: DateTime<Utc>) -> Result<TaskId, TaskError> {
        if self.sender.is_closed() {
            return Err(TaskError::QueueClosed);
        }
        let id = TaskId::new();
        let wait = (eta - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.deliver_after(
            Delivery {
                id,
                task,
                attempt: 0,
            },
            wait,
        );
        Ok(id)
    }
}

/// Drains a [`LocalTaskQueue`], running each delivery concurrently.
pub struct TaskWorker {
    queue: LocalTaskQueue,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    orchestrator: Arc<Orchestrator>,
    backoff: Backoff,
}

impl TaskWorker {
    pub fn new(
        queue: LocalTaskQueue,
        receiver: mpsc::UnboundedReceiver<Delivery>,
        orchestrator: Arc<Orchestrator>,
        backoff: Backoff,
    ) -> Self {
        Self {
            queue,
            receiver,
            orchestrator,
            backoff,
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting task worker");

        loop {
            tokio::select! {
                delivery = self.receiver.recv() => {
                    let Some(delivery) = delivery else {
                        info!("Task queue closed");
                        break;
                    };
                    self.spawn_run(delivery);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Task worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn spawn_run(&self, delivery: Delivery) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let queue = self.queue.clone();
        let backoff = self.backoff;

        tokio::spawn(async move {
            match orchestrator.dispatch(delivery.task).await {
                Ok(()) => {
                    debug!(task_id = %delivery.id, task = %delivery.task, "Task complete");
                }
                Err(e) => {
                    let attempt = delivery.attempt + 1;
                    let delay = backoff.delay(attempt);
                    warn!(
                        task_id = %delivery.id,
                        task = %delivery.task,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Task failed; redelivering"
                    );
                    queue.deliver_after(Delivery { attempt, ..delivery }, delay);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchfleet_id::OrgId;

    #[tokio::test(start_paused = true)]
    async fn test_delivers_no_earlier_than_eta() {
        let (queue, mut receiver) = LocalTaskQueue::new();
        let task = Task::Admit {
            org_id: OrgId::new(),
        };

        let started = tokio::time::Instant::now();
        let eta = Utc::now() + chrono::Duration::seconds(30);
        let id = queue.schedule(task, eta).await.unwrap();

        let delivery = receiver.recv().await.unwrap();
        assert_eq!(delivery.id, id);
        assert_eq!(delivery.task, task);
        assert_eq!(delivery.attempt, 0);
        assert!(started.elapsed() >= Duration::from_secs(29));
    }

    #[tokio::test]
    async fn test_schedule_fails_when_closed() {
        let (queue, receiver) = LocalTaskQueue::new();
        drop(receiver);
        let result = queue
            .schedule(
                Task::Admit {
                    org_id: OrgId::new(),
                },
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(TaskError::QueueClosed)));
    }
}
