//! Admin view over broker state.
//!
//! [`QueueInspector`] backs an external admin REST layer: queue stats,
//! paginated listings of live and failed tasks, and operator retry/delete of
//! failed tasks. Every call validates the queue name against the configured
//! queues; errors map to wire codes through [`AnvilError::code`].
//!
//! # Examples
//!
//! ```rust
//! use anvilq::prelude::*;
//!
//! # async fn admin(anvil: &Anvil) -> AnvilResult<()> {
//! let inspector = anvil.inspector();
//! let page = PageRequest::from_query(Some("2"), Some("50"))?;
//! let failed = inspector.list_failed_jobs("default", page).await?;
//! for task in &failed.items {
//!     inspector.retry_failed_job("default", &task.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::core::broker::Broker;
use crate::error::{AnvilError, AnvilResult};
use crate::queue::{ListScope, QueueCounts};
use crate::task::QueuedTask;
use serde::Serialize;
use std::sync::Arc;

/// Page size used when the request does not name one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Larger requested page sizes are capped to this.
pub const MAX_PAGE_SIZE: usize = 100;

/// A validated page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: usize,
    page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// `page` starts at 1; `page_size` must be positive and is capped at
    /// [`MAX_PAGE_SIZE`].
    pub fn new(page: usize, page_size: usize) -> AnvilResult<Self> {
        if page == 0 {
            return Err(AnvilError::InvalidPagination {
                message: "page must be at least 1".to_string(),
            });
        }
        if page_size == 0 {
            return Err(AnvilError::InvalidPagination {
                message: "page_size must be at least 1".to_string(),
            });
        }
        Ok(Self {
            page,
            page_size: page_size.min(MAX_PAGE_SIZE),
        })
    }

    /// Parse raw query-string values, applying the defaults for absent ones.
    pub fn from_query(page: Option<&str>, page_size: Option<&str>) -> AnvilResult<Self> {
        let page = parse_param("page", page, 1)?;
        let page_size = parse_param("page_size", page_size, DEFAULT_PAGE_SIZE)?;
        Self::new(page, page_size)
    }

    /// 1-based page number
    pub fn page(&self) -> usize {
        self.page
    }

    /// Items per page
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Items to skip.
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

fn parse_param(name: &str, raw: Option<&str>, default: usize) -> AnvilResult<usize> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value.parse().map_err(|_| AnvilError::InvalidPagination {
            message: format!("{} must be a positive integer, got '{}'", name, value),
        }),
    }
}

/// Pagination metadata returned with every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    /// 1-based page number
    pub page: usize,
    /// Items per page after capping
    pub page_size: usize,
    /// Matching items across all pages
    pub total: u64,
    /// `ceil(total / page_size)`
    pub total_pages: u64,
}

impl Pagination {
    fn new(request: PageRequest, total: u64) -> Self {
        Self {
            page: request.page,
            page_size: request.page_size,
            total,
            total_pages: total.div_ceil(request.page_size as u64),
        }
    }
}

/// One page of items.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Where this page sits
    pub pagination: Pagination,
}

/// Stats of one configured queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Queue name
    pub name: String,
    /// Configured dispatch weight
    pub weight: u32,
    /// Pending tasks, ready or delayed
    pub size: u64,
    /// Ready to dispatch
    pub pending: u64,
    /// Delayed until `process_at`
    pub scheduled: u64,
    /// Held by a worker
    pub active: u64,
    /// Completed and retained
    pub completed: u64,
    /// Terminally failed
    pub failed: u64,
}

impl QueueSnapshot {
    fn new(name: &str, weight: u32, counts: &QueueCounts) -> Self {
        Self {
            name: name.to_string(),
            weight,
            size: counts.size(),
            pending: counts.pending,
            scheduled: counts.scheduled,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
        }
    }
}

/// Aggregate and per-queue stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectorStats {
    /// Sum over all configured queues
    pub aggregate: QueueCounts,
    /// One entry per configured queue, in configuration order
    pub queues: Vec<QueueSnapshot>,
}

/// Read and mutate interface over broker state.
#[derive(Debug, Clone)]
pub struct QueueInspector {
    broker: Arc<Broker>,
}

impl QueueInspector {
    /// Inspect the queues of `broker`.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Aggregate and per-queue counts.
    pub async fn get_stats(&self) -> AnvilResult<InspectorStats> {
        let mut aggregate = QueueCounts::default();
        let mut queues = Vec::with_capacity(self.broker.queues().len());

        for spec in self.broker.queues() {
            let counts = self.broker.backend().queue_counts(&spec.name).await?;
            aggregate.merge(&counts);
            queues.push(QueueSnapshot::new(&spec.name, spec.weight, &counts));
        }
        Ok(InspectorStats { aggregate, queues })
    }

    /// Pending (ready, then delayed) and active tasks of `queue`, FIFO.
    pub async fn list_jobs(&self, queue: &str, page: PageRequest) -> AnvilResult<Page<QueuedTask>> {
        self.list(queue, ListScope::Live, page).await
    }

    /// Failed tasks of `queue`, oldest failure first.
    pub async fn list_failed_jobs(
        &self,
        queue: &str,
        page: PageRequest,
    ) -> AnvilResult<Page<QueuedTask>> {
        self.list(queue, ListScope::Failed, page).await
    }

    /// Move a failed task back to `Pending` with a fresh retry budget.
    ///
    /// Fails with [`AnvilError::TaskNotFound`] unless the task is currently
    /// failed in `queue`.
    pub async fn retry_failed_job(&self, queue: &str, task_id: &str) -> AnvilResult<QueuedTask> {
        self.broker.ensure_queue(queue)?;
        match self.broker.backend().retry_failed(queue, task_id).await? {
            Some(task) => {
                tracing::info!(%queue, %task_id, "Failed task requeued by operator");
                Ok(task)
            }
            None => Err(AnvilError::task_not_found(task_id)),
        }
    }

    /// Permanently delete a failed task.
    ///
    /// Fails with [`AnvilError::TaskNotFound`] unless the task is currently
    /// failed in `queue`.
    pub async fn delete_failed_job(&self, queue: &str, task_id: &str) -> AnvilResult<()> {
        self.broker.ensure_queue(queue)?;
        if self.broker.backend().delete_failed(queue, task_id).await? {
            tracing::info!(%queue, %task_id, "Failed task deleted by operator");
            Ok(())
        } else {
            Err(AnvilError::task_not_found(task_id))
        }
    }

    async fn list(
        &self,
        queue: &str,
        scope: ListScope,
        page: PageRequest,
    ) -> AnvilResult<Page<QueuedTask>> {
        self.broker.ensure_queue(queue)?;
        let (items, total) = self
            .broker
            .backend()
            .list_tasks(queue, scope, page.offset(), page.page_size())
            .await?;
        Ok(Page {
            items,
            pagination: Pagination::new(page, total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSpec;
    use crate::error::ErrorCode;
    use crate::queue::InMemoryQueue;
    use crate::task::TaskState;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn inspector() -> (QueueInspector, Arc<Broker>) {
        let broker = Arc::new(Broker::new(
            Arc::new(InMemoryQueue::new()),
            QueueSpec::defaults(),
            Duration::from_millis(20),
        ));
        (QueueInspector::new(broker.clone()), broker)
    }

    async fn failed_task(broker: &Broker, queue: &str) -> QueuedTask {
        broker
            .enqueue(QueuedTask::new("export:csv", vec![], queue, 2))
            .await
            .unwrap();
        let mut task = broker.backend().dequeue_from(queue).await.unwrap().unwrap();
        task.retry_count = 2;
        task.state = TaskState::Failed;
        task.last_error = Some("s3 bucket missing".to_string());
        broker.backend().fail(&task).await.unwrap();
        task
    }

    #[test]
    fn test_page_request_validation() {
        assert_eq!(PageRequest::default(), PageRequest::new(1, 20).unwrap());
        assert_eq!(PageRequest::new(2, 500).unwrap().page_size(), MAX_PAGE_SIZE);
        assert_err!(PageRequest::new(0, 10));
        assert_err!(PageRequest::new(1, 0));
        assert_eq!(PageRequest::new(3, 10).unwrap().offset(), 20);

        let parsed = PageRequest::from_query(None, Some(" ")).unwrap();
        assert_eq!(parsed, PageRequest::default());

        let err = assert_err!(PageRequest::from_query(Some("-1"), None));
        assert!(matches!(err, AnvilError::InvalidPagination { .. }));
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_failed_pagination() {
        let (inspector, broker) = inspector();
        for _ in 0..25 {
            failed_task(&broker, "default").await;
        }

        let first = inspector
            .list_failed_jobs("default", PageRequest::new(1, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.pagination.total, 25);
        assert_eq!(first.pagination.total_pages, 3);

        let last = inspector
            .list_failed_jobs("default", PageRequest::new(3, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(last.items.len(), 5);

        let beyond = inspector
            .list_failed_jobs("default", PageRequest::new(4, 10).unwrap())
            .await
            .unwrap();
        assert!(beyond.items.is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_and_stats() {
        let (inspector, broker) = inspector();
        for queue in ["critical", "critical", "low"] {
            broker
                .enqueue(QueuedTask::new("index:rebuild", vec![], queue, 3))
                .await
                .unwrap();
        }
        failed_task(&broker, "low").await;

        let jobs = inspector
            .list_jobs("critical", PageRequest::default())
            .await
            .unwrap();
        assert_eq!(jobs.items.len(), 2);
        assert_eq!(jobs.pagination.total, 2);
        assert_eq!(jobs.pagination.total_pages, 1);

        let stats = inspector.get_stats().await.unwrap();
        assert_eq!(stats.queues.len(), 3);
        assert_eq!(stats.queues[0].name, "critical");
        assert_eq!(stats.queues[0].weight, 6);
        assert_eq!(stats.aggregate.failed, 1);
        assert_eq!(stats.aggregate.pending + stats.aggregate.active, 2);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["aggregate"]["failed"], 1);
    }

    #[tokio::test]
    async fn test_retry_resets_budget_and_keeps_error() {
        let (inspector, broker) = inspector();
        let task = failed_task(&broker, "default").await;

        let revived = inspector.retry_failed_job("default", &task.id).await.unwrap();
        assert_eq!(revived.state, TaskState::Pending);
        assert_eq!(revived.retry_count, 0);
        assert_eq!(revived.last_error.as_deref(), Some("s3 bucket missing"));

        let again = broker.try_dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
    }

    #[tokio::test]
    async fn test_retry_and_delete_need_failed_task() {
        let (inspector, broker) = inspector();
        let task = failed_task(&broker, "default").await;

        // Wrong queue
        let err = inspector.retry_failed_job("low", &task.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        assert_ok!(inspector.delete_failed_job("default", &task.id).await);
        assert!(broker.backend().get_task(&task.id).await.unwrap().is_none());

        // Concurrent admin already deleted it
        let err = inspector.retry_failed_job("default", &task.id).await.unwrap_err();
        assert!(matches!(err, AnvilError::TaskNotFound { .. }));
        let err = inspector.delete_failed_job("default", &task.id).await.unwrap_err();
        assert!(matches!(err, AnvilError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_queue_is_bad_request() {
        let (inspector, _broker) = inspector();
        let err = inspector
            .list_jobs("nope", PageRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert!(inspector.delete_failed_job("nope", "t-1").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_retry_single_winner() {
        let (inspector, broker) = inspector();
        let task = failed_task(&broker, "default").await;

        let (a, b) = tokio::join!(
            inspector.retry_failed_job("default", &task.id),
            inspector.retry_failed_job("default", &task.id)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }
}
