//! In-memory queue implementation for anvilq.
//!
//! All queues share one `tokio::sync::Mutex`, so every operation is a single
//! critical section. Suited to tests, development and single-process
//! deployments; nothing survives a restart.

use super::{ListScope, QueueBackend, QueueCounts};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{QueuedTask, TaskId, TaskState};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct QueueSlots {
    /// Ready tasks, FIFO
    pending: VecDeque<TaskId>,
    /// Delayed tasks keyed by (process_at, insertion sequence)
    scheduled: BTreeMap<(SystemTime, u64), TaskId>,
    active: Vec<TaskId>,
    completed: VecDeque<TaskId>,
    failed: Vec<TaskId>,
}

impl QueueSlots {
    fn promote_due(&mut self, now: SystemTime) {
        while let Some(entry) = self.scheduled.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            self.pending.push_back(id);
        }
    }

    fn take_active(&mut self, task_id: &str) -> bool {
        match self.active.iter().position(|id| id == task_id) {
            Some(pos) => {
                self.active.remove(pos);
                true
            }
            None => false,
        }
    }

    fn take_failed(&mut self, task_id: &str) -> bool {
        match self.failed.iter().position(|id| id == task_id) {
            Some(pos) => {
                self.failed.remove(pos);
                true
            }
            None => false,
        }
    }

    fn counts(&self) -> QueueCounts {
        QueueCounts {
            pending: self.pending.len() as u64,
            scheduled: self.scheduled.len() as u64,
            active: self.active.len() as u64,
            completed: self.completed.len() as u64,
            failed: self.failed.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    tasks: HashMap<TaskId, QueuedTask>,
    queues: HashMap<String, QueueSlots>,
    seq: u64,
}

impl Store {
    fn slots(&mut self, queue: &str) -> &mut QueueSlots {
        self.queues.entry(queue.to_string()).or_default()
    }

    /// Place a pending task in the ready list or the delayed set.
    fn park(&mut self, task: QueuedTask, now: SystemTime) {
        self.seq += 1;
        let seq = self.seq;
        let id = task.id.clone();
        let process_at = task.process_at.filter(|at| *at > now);
        let queue = task.queue.clone();
        self.tasks.insert(id.clone(), task);

        let slots = self.slots(&queue);
        match process_at {
            Some(at) => {
                slots.scheduled.insert((at, seq), id);
            }
            None => slots.pending.push_back(id),
        }
    }

    /// Compare-and-set guard shared by the worker transitions. The dequeue
    /// time acts as the lease token: a task recovered and handed out again
    /// cannot be settled by its previous holder.
    fn release_active(&mut self, task: &QueuedTask) -> AnvilResult<()> {
        let is_active = self.tasks.get(&task.id).is_some_and(|t| {
            t.state == TaskState::Active
                && t.queue == task.queue
                && t.processed_at == task.processed_at
        });
        if !is_active || !self.slots(&task.queue).take_active(&task.id) {
            return Err(AnvilError::task_not_found(&task.id));
        }
        Ok(())
    }

    fn collect(&self, ids: impl Iterator<Item = TaskId>) -> Vec<QueuedTask> {
        ids.filter_map(|id| self.tasks.get(&id).cloned()).collect()
    }
}

/// In-memory queue backend implementation
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    store: Mutex<Store>,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    /// Create an empty in-memory queue
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, mut task: QueuedTask) -> AnvilResult<TaskId> {
        let id = task.id.clone();
        task.state = TaskState::Pending;
        {
            let mut store = self.store.lock().await;
            store.park(task, SystemTime::now());
        }
        self.notify.notify_waiters();
        tracing::debug!(task_id = %id, "Enqueued task");
        Ok(id)
    }

    async fn dequeue_from(&self, queue: &str) -> AnvilResult<Option<QueuedTask>> {
        let now = SystemTime::now();
        let mut store = self.store.lock().await;
        let slots = store.slots(queue);
        slots.promote_due(now);

        let Some(id) = slots.pending.pop_front() else {
            return Ok(None);
        };
        slots.active.push(id.clone());

        match store.tasks.get_mut(&id) {
            Some(task) => {
                task.state = TaskState::Active;
                task.processed_at = Some(now);
                Ok(Some(task.clone()))
            }
            None => Err(AnvilError::task_not_found(id)),
        }
    }

    async fn complete(&self, task: &QueuedTask) -> AnvilResult<()> {
        let mut store = self.store.lock().await;
        store.release_active(task)?;

        let mut done = task.clone();
        done.state = TaskState::Completed;
        if done.completed_at.is_none() {
            done.completed_at = Some(SystemTime::now());
        }
        store.slots(&task.queue).completed.push_back(task.id.clone());
        store.tasks.insert(task.id.clone(), done);
        Ok(())
    }

    async fn retry(&self, task: &QueuedTask) -> AnvilResult<()> {
        {
            let mut store = self.store.lock().await;
            store.release_active(task)?;

            let mut next = task.clone();
            next.state = TaskState::Pending;
            store.park(next, SystemTime::now());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fail(&self, task: &QueuedTask) -> AnvilResult<()> {
        let mut store = self.store.lock().await;
        store.release_active(task)?;

        let mut dead = task.clone();
        dead.state = TaskState::Failed;
        store.slots(&task.queue).failed.push(task.id.clone());
        store.tasks.insert(task.id.clone(), dead);
        Ok(())
    }

    async fn requeue(&self, task: &QueuedTask) -> AnvilResult<()> {
        {
            let mut store = self.store.lock().await;
            store.release_active(task)?;

            let mut back = task.clone();
            back.state = TaskState::Pending;
            back.processed_at = None;
            store.slots(&task.queue).pending.push_front(task.id.clone());
            store.tasks.insert(task.id.clone(), back);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover_stale(&self, lease: Duration) -> AnvilResult<u64> {
        let threshold = SystemTime::now()
            .checked_sub(lease)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let recovered = {
            let mut store = self.store.lock().await;
            let Store { tasks, queues, .. } = &mut *store;

            let mut recovered = 0u64;
            for slots in queues.values_mut() {
                let mut stale = Vec::new();
                slots.active.retain(|id| {
                    let expired = tasks
                        .get(id)
                        .and_then(|t| t.processed_at)
                        .is_none_or(|at| at <= threshold);
                    if expired {
                        stale.push(id.clone());
                    }
                    !expired
                });

                // Oldest dequeue ends up first in line
                for id in stale.into_iter().rev() {
                    if let Some(task) = tasks.get_mut(&id) {
                        task.state = TaskState::Pending;
                        task.processed_at = None;
                    }
                    slots.pending.push_front(id);
                    recovered += 1;
                }
            }
            recovered
        };

        if recovered > 0 {
            self.notify.notify_waiters();
            tracing::debug!("Recovered {} stale active tasks", recovered);
        }
        Ok(recovered)
    }

    async fn get_task(&self, task_id: &str) -> AnvilResult<Option<QueuedTask>> {
        let store = self.store.lock().await;
        Ok(store.tasks.get(task_id).cloned())
    }

    async fn queue_counts(&self, queue: &str) -> AnvilResult<QueueCounts> {
        let store = self.store.lock().await;
        Ok(store
            .queues
            .get(queue)
            .map(QueueSlots::counts)
            .unwrap_or_default())
    }

    async fn list_tasks(
        &self,
        queue: &str,
        scope: ListScope,
        offset: usize,
        limit: usize,
    ) -> AnvilResult<(Vec<QueuedTask>, u64)> {
        let store = self.store.lock().await;
        let Some(slots) = store.queues.get(queue) else {
            return Ok((Vec::new(), 0));
        };

        let ids: Vec<TaskId> = match scope {
            ListScope::Live => slots
                .pending
                .iter()
                .chain(slots.scheduled.values())
                .chain(slots.active.iter())
                .cloned()
                .collect(),
            ListScope::Failed => slots.failed.clone(),
        };
        let total = ids.len() as u64;
        let page = store.collect(ids.into_iter().skip(offset).take(limit));
        Ok((page, total))
    }

    async fn retry_failed(&self, queue: &str, task_id: &str) -> AnvilResult<Option<QueuedTask>> {
        let revived = {
            let mut store = self.store.lock().await;
            let is_failed = store
                .tasks
                .get(task_id)
                .is_some_and(|t| t.state == TaskState::Failed && t.queue == queue);
            if !is_failed || !store.slots(queue).take_failed(task_id) {
                return Ok(None);
            }

            let Some(mut task) = store.tasks.remove(task_id) else {
                return Ok(None);
            };
            task.revive();
            let revived = task.clone();
            store.park(task, SystemTime::now());
            revived
        };
        self.notify.notify_waiters();
        Ok(Some(revived))
    }

    async fn delete_failed(&self, queue: &str, task_id: &str) -> AnvilResult<bool> {
        let mut store = self.store.lock().await;
        let is_failed = store
            .tasks
            .get(task_id)
            .is_some_and(|t| t.state == TaskState::Failed && t.queue == queue);
        if !is_failed || !store.slots(queue).take_failed(task_id) {
            return Ok(false);
        }
        store.tasks.remove(task_id);
        Ok(true)
    }

    async fn cleanup(&self, retention: Duration) -> AnvilResult<u64> {
        let threshold = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut store = self.store.lock().await;
        let Store { tasks, queues, .. } = &mut *store;

        let mut removed = 0;
        for slots in queues.values_mut() {
            slots.completed.retain(|id| {
                let expired = tasks
                    .get(id)
                    .and_then(|t| t.completed_at)
                    .is_none_or(|at| at < threshold);
                if expired {
                    tasks.remove(id);
                    removed += 1;
                }
                !expired
            });
        }

        if removed > 0 {
            tracing::debug!("Cleaned up {} completed tasks", removed);
        }
        Ok(removed)
    }

    async fn purge(&self) -> AnvilResult<u64> {
        let mut store = self.store.lock().await;
        let count = store.tasks.len() as u64;
        store.tasks.clear();
        store.queues.clear();
        tracing::warn!("Purged {} tasks from in-memory queue", count);
        Ok(count)
    }

    async fn health_check(&self) -> AnvilResult<()> {
        Ok(())
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_task(queue: &str) -> QueuedTask {
        QueuedTask::new("test:task", b"{\"n\":1}".to_vec(), queue, 3)
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let queue = InMemoryQueue::new();
        let first = queue.enqueue(create_test_task("default")).await.unwrap();
        let second = queue.enqueue(create_test_task("default")).await.unwrap();
        queue.enqueue(create_test_task("low")).await.unwrap();

        let a = queue.dequeue_from("default").await.unwrap().unwrap();
        let b = queue.dequeue_from("default").await.unwrap().unwrap();
        assert_eq!(a.id, first);
        assert_eq!(b.id, second);
        assert!(a.processed_at.is_some());
        assert!(queue.dequeue_from("default").await.unwrap().is_none());

        let counts = queue.queue_counts("default").await.unwrap();
        assert_eq!(counts.active, 2);
        assert_eq!(queue.queue_counts("low").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_delayed_task_held_back() {
        let queue = InMemoryQueue::new();
        let mut task = create_test_task("default");
        task.process_at = Some(SystemTime::now() + Duration::from_secs(60));
        queue.enqueue(task).await.unwrap();

        assert!(queue.dequeue_from("default").await.unwrap().is_none());
        let counts = queue.queue_counts("default").await.unwrap();
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_retry_with_past_process_at_is_ready() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        let mut task = queue.dequeue_from("default").await.unwrap().unwrap();

        task.retry_count = 1;
        task.last_error = Some("boom".to_string());
        task.process_at = Some(SystemTime::now() - Duration::from_millis(1));
        queue.retry(&task).await.unwrap();

        let again = queue.dequeue_from("default").await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_transitions_require_active() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        let task = queue.dequeue_from("default").await.unwrap().unwrap();

        queue.fail(&task).await.unwrap();
        let err = queue.complete(&task).await.unwrap_err();
        assert!(matches!(err, AnvilError::TaskNotFound { .. }));

        let stored = queue.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_recover_stale_active_tasks() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        let waiting = queue.enqueue(create_test_task("default")).await.unwrap();
        let held = queue.dequeue_from("default").await.unwrap().unwrap();

        assert_eq!(queue.recover_stale(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(queue.recover_stale(Duration::ZERO).await.unwrap(), 1);

        let counts = queue.queue_counts("default").await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.pending, 2);

        // The old holder lost its lease
        let err = queue.complete(&held).await.unwrap_err();
        assert!(matches!(err, AnvilError::TaskNotFound { .. }));

        let again = queue.dequeue_from("default").await.unwrap().unwrap();
        assert_eq!(again.id, held.id);
        assert_eq!(again.retry_count, 0);
        assert_eq!(queue.dequeue_from("default").await.unwrap().unwrap().id, waiting);
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_settle_redelivered_task() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        let first = queue.dequeue_from("default").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.recover_stale(Duration::ZERO).await.unwrap();
        let second = queue.dequeue_from("default").await.unwrap().unwrap();

        assert!(queue.fail(&first).await.is_err());
        queue.complete(&second).await.unwrap();
        let stored = queue.get_task(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_front() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        let other = queue.enqueue(create_test_task("default")).await.unwrap();

        let interrupted = queue.dequeue_from("default").await.unwrap().unwrap();
        queue.requeue(&interrupted).await.unwrap();

        let next = queue.dequeue_from("default").await.unwrap().unwrap();
        assert_eq!(next.id, interrupted.id);
        assert_eq!(next.retry_count, 0);
        let after = queue.dequeue_from("default").await.unwrap().unwrap();
        assert_eq!(after.id, other);
    }

    #[tokio::test]
    async fn test_failed_admin_operations_are_queue_scoped() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        let mut task = queue.dequeue_from("default").await.unwrap().unwrap();
        task.retry_count = 3;
        queue.fail(&task).await.unwrap();

        assert!(queue.retry_failed("low", &task.id).await.unwrap().is_none());
        assert!(!queue.delete_failed("low", &task.id).await.unwrap());

        let revived = queue.retry_failed("default", &task.id).await.unwrap().unwrap();
        assert_eq!(revived.state, TaskState::Pending);
        assert_eq!(revived.retry_count, 0);

        // Second retry sees a pending task, not a failed one
        assert!(queue.retry_failed("default", &task.id).await.unwrap().is_none());
        assert!(!queue.delete_failed("default", &task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_live_and_failed() {
        let queue = InMemoryQueue::new();
        for _ in 0..5 {
            queue.enqueue(create_test_task("default")).await.unwrap();
        }
        let active = queue.dequeue_from("default").await.unwrap().unwrap();

        let (page, total) = queue
            .list_tasks("default", ListScope::Live, 0, 3)
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 3);

        let (tail, _) = queue
            .list_tasks("default", ListScope::Live, 3, 10)
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.last().map(|t| t.id.as_str()), Some(active.id.as_str()));

        let (failed, total) = queue
            .list_tasks("default", ListScope::Failed, 0, 10)
            .await
            .unwrap();
        assert!(failed.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_cleanup_completed() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        let mut task = queue.dequeue_from("default").await.unwrap().unwrap();
        task.completed_at = Some(SystemTime::now() - Duration::from_secs(120));
        queue.complete(&task).await.unwrap();

        assert_eq!(queue.cleanup(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.cleanup(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(queue.get_task(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge() {
        let queue = InMemoryQueue::new();
        queue.enqueue(create_test_task("default")).await.unwrap();
        queue.enqueue(create_test_task("low")).await.unwrap();
        assert_eq!(queue.purge().await.unwrap(), 2);
        assert_eq!(queue.queue_counts("default").await.unwrap(), QueueCounts::default());
    }
}
