//! Queue backends: the atomic store behind the broker.
//!
//! Every method on [`QueueBackend`] is a single atomic operation against the
//! store. The in-memory backend takes one mutex per call; the Redis backend
//! runs one Lua script or one atomic pipeline. State-changing calls that
//! require a precondition (the task is `Active`, the task is `Failed` in this
//! queue) are compare-and-set: when the precondition does not hold they fail
//! with [`AnvilError::TaskNotFound`](crate::error::AnvilError::TaskNotFound)
//! or return `None`/`false`, never a partial write. Worker transitions also
//! check the dequeue time carried in `processed_at`, which works as the
//! lease of the attempt.
//!
//! # Examples
//!
//! ```rust,no_run
//! use anvilq::queue::QueueFactory;
//!
//! // In-memory queue (default)
//! let queue = QueueFactory::in_memory();
//!
//! // Redis queue (requires redis-queue feature)
//! # #[cfg(feature = "redis-queue")]
//! # async fn redis() -> anvilq::error::AnvilResult<()> {
//! let queue = QueueFactory::redis("redis://localhost:6379", "anvilq").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::AnvilResult;
use crate::task::{QueuedTask, TaskId};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub mod memory;
pub use memory::InMemoryQueue;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisQueue;

/// Per-queue task counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Ready to dispatch
    pub pending: u64,
    /// Pending but delayed until `process_at`
    pub scheduled: u64,
    /// Held by a worker
    pub active: u64,
    /// Completed and not yet cleaned up
    pub completed: u64,
    /// Terminally failed
    pub failed: u64,
}

impl QueueCounts {
    /// Tasks waiting for dispatch, ready or delayed.
    pub fn size(&self) -> u64 {
        self.pending + self.scheduled
    }

    /// Add another queue's counts to this one.
    pub fn merge(&mut self, other: &QueueCounts) {
        self.pending += other.pending;
        self.scheduled += other.scheduled;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Which tasks a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    /// Pending (ready first, then delayed) and active tasks
    Live,
    /// Terminally failed tasks, oldest failure first
    Failed,
}

/// Trait that all queue backends must implement
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new pending task in `task.queue`.
    ///
    /// A task with a future `process_at` is held back until it is due.
    async fn enqueue(&self, task: QueuedTask) -> AnvilResult<TaskId>;

    /// Promote due delayed tasks, then pop the oldest ready task of `queue`
    /// and mark it `Active`.
    async fn dequeue_from(&self, queue: &str) -> AnvilResult<Option<QueuedTask>>;

    /// `Active -> Completed`, storing `task.result`.
    async fn complete(&self, task: &QueuedTask) -> AnvilResult<()>;

    /// `Active -> Pending` with the incremented `retry_count`, `process_at`
    /// and `last_error` carried by `task`.
    async fn retry(&self, task: &QueuedTask) -> AnvilResult<()>;

    /// `Active -> Failed`, keeping `task.last_error`.
    async fn fail(&self, task: &QueuedTask) -> AnvilResult<()>;

    /// `Active -> Pending` at the head of its queue, without touching the
    /// retry budget. Used for tasks interrupted by a hard shutdown.
    async fn requeue(&self, task: &QueuedTask) -> AnvilResult<()>;

    /// Put tasks that have been `Active` for longer than `lease` back at the
    /// head of their queue, without touching the retry budget. Their holders
    /// lose the lease: later transitions by them fail with `TaskNotFound`.
    async fn recover_stale(&self, lease: Duration) -> AnvilResult<u64>;

    /// Get a task by ID
    async fn get_task(&self, task_id: &str) -> AnvilResult<Option<QueuedTask>>;

    /// Counts for one queue; an unknown queue reports all zeros.
    async fn queue_counts(&self, queue: &str) -> AnvilResult<QueueCounts>;

    /// One page of tasks plus the total matching `scope`.
    async fn list_tasks(
        &self,
        queue: &str,
        scope: ListScope,
        offset: usize,
        limit: usize,
    ) -> AnvilResult<(Vec<QueuedTask>, u64)>;

    /// `Failed -> Pending` (see [`QueuedTask::revive`]) if the task is
    /// currently failed in `queue`.
    async fn retry_failed(&self, queue: &str, task_id: &str) -> AnvilResult<Option<QueuedTask>>;

    /// Remove a task that is currently failed in `queue`.
    async fn delete_failed(&self, queue: &str, task_id: &str) -> AnvilResult<bool>;

    /// Drop completed tasks older than `retention`.
    async fn cleanup(&self, retention: Duration) -> AnvilResult<u64>;

    /// Purge all tasks (dangerous operation)
    async fn purge(&self) -> AnvilResult<u64>;

    /// Health check for the queue backend
    async fn health_check(&self) -> AnvilResult<()>;

    /// Signal fired on every enqueue, for backends that can wake idle
    /// dequeuers directly. Others are polled.
    fn notifier(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Shared handle to a queue backend
pub type TaskQueue = Arc<dyn QueueBackend>;

/// Factory methods for creating queue backends
pub struct QueueFactory;

impl QueueFactory {
    /// Create an in-memory queue
    pub fn in_memory() -> TaskQueue {
        Arc::new(InMemoryQueue::new())
    }

    /// Create a Redis queue
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub async fn redis(connection_string: &str, key_prefix: &str) -> AnvilResult<TaskQueue> {
        let queue = RedisQueue::new(connection_string, key_prefix).await?;
        Ok(Arc::new(queue))
    }
}
