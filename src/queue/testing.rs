//! Backend wrapper for tests: slow dequeues and failing transition writes.

use super::{InMemoryQueue, ListScope, QueueBackend, QueueCounts};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{QueuedTask, TaskId};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct FlakyQueue {
    inner: InMemoryQueue,
    dequeue_latency: Duration,
    failing_writes: AtomicU32,
}

impl FlakyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every `dequeue_from` sleeps this long before touching the store.
    pub(crate) fn with_dequeue_latency(mut self, latency: Duration) -> Self {
        self.dequeue_latency = latency;
        self
    }

    /// The next `count` worker transitions fail as if the broker were down.
    pub(crate) fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> AnvilResult<()> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AnvilError::broker_unavailable(
                "write rejected",
                std::io::Error::other("connection reset"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for FlakyQueue {
    async fn enqueue(&self, task: QueuedTask) -> AnvilResult<TaskId> {
        self.inner.enqueue(task).await
    }

    async fn dequeue_from(&self, queue: &str) -> AnvilResult<Option<QueuedTask>> {
        if !self.dequeue_latency.is_zero() {
            tokio::time::sleep(self.dequeue_latency).await;
        }
        self.inner.dequeue_from(queue).await
    }

    async fn complete(&self, task: &QueuedTask) -> AnvilResult<()> {
        self.check_write()?;
        self.inner.complete(task).await
    }

    async fn retry(&self, task: &QueuedTask) -> AnvilResult<()> {
        self.check_write()?;
        self.inner.retry(task).await
    }

    async fn fail(&self, task: &QueuedTask) -> AnvilResult<()> {
        self.check_write()?;
        self.inner.fail(task).await
    }

    async fn requeue(&self, task: &QueuedTask) -> AnvilResult<()> {
        self.check_write()?;
        self.inner.requeue(task).await
    }

    async fn recover_stale(&self, lease: Duration) -> AnvilResult<u64> {
        self.inner.recover_stale(lease).await
    }

    async fn get_task(&self, task_id: &str) -> AnvilResult<Option<QueuedTask>> {
        self.inner.get_task(task_id).await
    }

    async fn queue_counts(&self, queue: &str) -> AnvilResult<QueueCounts> {
        self.inner.queue_counts(queue).await
    }

    async fn list_tasks(
        &self,
        queue: &str,
        scope: ListScope,
        offset: usize,
        limit: usize,
    ) -> AnvilResult<(Vec<QueuedTask>, u64)> {
        self.inner.list_tasks(queue, scope, offset, limit).await
    }

    async fn retry_failed(&self, queue: &str, task_id: &str) -> AnvilResult<Option<QueuedTask>> {
        self.inner.retry_failed(queue, task_id).await
    }

    async fn delete_failed(&self, queue: &str, task_id: &str) -> AnvilResult<bool> {
        self.inner.delete_failed(queue, task_id).await
    }

    async fn cleanup(&self, retention: Duration) -> AnvilResult<u64> {
        self.inner.cleanup(retention).await
    }

    async fn purge(&self) -> AnvilResult<u64> {
        self.inner.purge().await
    }

    async fn health_check(&self) -> AnvilResult<()> {
        self.inner.health_check().await
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        self.inner.notifier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_writes_run_out() {
        let queue = FlakyQueue::new();
        queue.enqueue(QueuedTask::new("noop", Vec::new(), "default", 3)).await.unwrap();
        let task = queue.dequeue_from("default").await.unwrap().unwrap();

        queue.fail_next_writes(1);
        assert!(queue.complete(&task).await.unwrap_err().is_retryable());
        queue.complete(&task).await.unwrap();
    }
}
