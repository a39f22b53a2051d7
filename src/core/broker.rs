//! Priority queue broker: validated enqueue and weighted, blocking dequeue.

use crate::config::QueueSpec;
use crate::core::scheduler::WeightedScheduler;
use crate::error::{AnvilError, AnvilResult};
use crate::queue::TaskQueue;
use crate::task::{QueuedTask, TaskId};
use crate::utils::calculate_backoff;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Named, weighted queues over a shared [`QueueBackend`](crate::queue::QueueBackend).
pub struct Broker {
    backend: TaskQueue,
    queues: Vec<QueueSpec>,
    scheduler: Mutex<WeightedScheduler>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.queues)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Create a broker; `idle_timeout` bounds the wait between empty polls.
    pub fn new(backend: TaskQueue, queues: Vec<QueueSpec>, idle_timeout: Duration) -> Self {
        let scheduler = WeightedScheduler::new(&queues);
        Self {
            backend,
            queues,
            scheduler: Mutex::new(scheduler),
            idle_timeout,
        }
    }

    /// The backing store
    pub fn backend(&self) -> &TaskQueue {
        &self.backend
    }

    /// Configured queues, in scan order
    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    /// Whether `queue` is configured.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q.name == queue)
    }

    /// Fail with [`AnvilError::InvalidQueue`] unless `queue` is configured.
    pub fn ensure_queue(&self, queue: &str) -> AnvilResult<()> {
        if self.has_queue(queue) {
            Ok(())
        } else {
            Err(AnvilError::invalid_queue(queue))
        }
    }

    /// Store a task in its queue.
    pub async fn enqueue(&self, task: QueuedTask) -> AnvilResult<TaskId> {
        self.ensure_queue(&task.queue)?;
        if task.task_type.trim().is_empty() {
            return Err(AnvilError::config("Task type must not be empty"));
        }

        let queue = task.queue.clone();
        let task_type = task.task_type.clone();
        let id = self.backend.enqueue(task).await?;
        tracing::debug!(task_id = %id, %queue, %task_type, "Task enqueued");
        Ok(id)
    }

    /// One weighted pass over the queues without waiting.
    ///
    /// Each candidate's credit is claimed under the scheduler lock before the
    /// store is polled and refunded if the queue was empty, so concurrent
    /// workers share the dispatch budget instead of racing on a snapshot.
    pub async fn try_dequeue(&self) -> AnvilResult<Option<QueuedTask>> {
        let mut tried = vec![false; self.queues.len()];

        loop {
            let Some(index) = self.lock_scheduler().claim(&tried) else {
                return Ok(None);
            };

            match self.backend.dequeue_from(&self.queues[index].name).await {
                Ok(Some(task)) => return Ok(Some(task)),
                Ok(None) => {
                    self.lock_scheduler().refund(index);
                    tried[index] = true;
                }
                Err(err) => {
                    self.lock_scheduler().refund(index);
                    return Err(err);
                }
            }
        }
    }

    /// Block until a task is ready or `token` is cancelled.
    ///
    /// Returns [`AnvilError::Cancelled`] on cancellation and propagates
    /// [`AnvilError::BrokerUnavailable`] from the store.
    pub async fn dequeue(&self, token: &CancellationToken) -> AnvilResult<QueuedTask> {
        let notify = self.backend.notifier();
        let idle_cap = self.idle_timeout.as_millis() as u64;
        let mut empty_polls = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(AnvilError::Cancelled);
            }

            // Subscribe before polling so an enqueue in between is not missed
            let notified = notify.as_deref().map(Notify::notified);

            if let Some(task) = self.try_dequeue().await? {
                return Ok(task);
            }

            empty_polls = empty_polls.saturating_add(1);
            let wait = Duration::from_millis(calculate_backoff(empty_polls, 0).min(idle_cap.max(1)));

            tokio::select! {
                _ = token.cancelled() => return Err(AnvilError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
                _ = async {
                    match notified {
                        Some(notified) => notified.await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    empty_polls = 0;
                }
            }
        }
    }

    fn lock_scheduler(&self) -> std::sync::MutexGuard<'_, WeightedScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
