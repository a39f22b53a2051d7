//! Handler contract and the per-attempt task context.

use crate::error::{AnvilResult, HandlerError};
use crate::task::{AnvilTask, QueuedTask, TaskId, decode_payload};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Something that can process the payload of one task type.
///
/// Return `Ok(())` to complete the task, [`HandlerError::skip_retry`] to
/// fail it immediately, or any other error to have it retried.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one attempt.
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Metadata and controls for one attempt of a task.
///
/// Cloning is cheap; clones share the cancellation token and result slot.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: String,
    queue: String,
    retry_count: u32,
    max_retry: u32,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    result: Arc<Mutex<Option<Vec<u8>>>>,
}

impl TaskContext {
    pub(crate) fn new(task: &QueuedTask, deadline: Option<Instant>, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            queue: task.queue.clone(),
            retry_count: task.retry_count,
            max_retry: task.max_retry,
            deadline,
            cancel,
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// Task id
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Task type
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Queue the task was dequeued from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Retries consumed before this attempt
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Retry budget
    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Processing deadline of this attempt, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token cancelled when the deadline passes or the pool hard-stops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the attempt has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Store raw result bytes on the task (and in the idempotency cache).
    pub fn write_result(&self, bytes: impl Into<Vec<u8>>) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(bytes.into());
    }

    /// Store a JSON-encoded result.
    pub fn write_json<R: Serialize + ?Sized>(&self, value: &R) -> AnvilResult<()> {
        self.write_result(serde_json::to_vec(value)?);
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn take_result(&self) -> Option<Vec<u8>> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Handler built from an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskHandler`].
///
/// ```rust
/// use anvilq::core::handler::handler_fn;
///
/// let handler = handler_fn(|ctx, payload| async move {
///     tracing::info!(task_id = ctx.task_id(), bytes = payload.len(), "ping");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), payload.to_vec()).await
    }
}

/// Adapter that decodes the payload into `T` and calls [`AnvilTask::forge`].
pub struct TypedHandler<T> {
    _task: PhantomData<fn() -> T>,
}

impl<T> TypedHandler<T> {
    /// Create the adapter.
    pub fn new() -> Self {
        Self { _task: PhantomData }
    }
}

impl<T> Default for TypedHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: AnvilTask> TaskHandler for TypedHandler<T> {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        let task: T = decode_payload(payload)?;
        task.forge(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    #[async_trait]
    impl AnvilTask for Resize {
        const TASK_TYPE: &'static str = "image:resize";

        async fn forge(self, ctx: &TaskContext) -> Result<(), HandlerError> {
            if self.width == 0 {
                return Err(HandlerError::validation("width must be positive"));
            }
            ctx.write_json(&(self.width * 2))?;
            Ok(())
        }
    }

    fn context_for(payload: &[u8]) -> TaskContext {
        let task = QueuedTask::new(Resize::TASK_TYPE, payload.to_vec(), "default", 3);
        TaskContext::new(&task, None, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_and_writes_result() {
        let ctx = context_for(b"{\"width\":21}");
        let handler = TypedHandler::<Resize>::new();
        handler.handle(&ctx, b"{\"width\":21}").await.unwrap();
        assert_eq!(ctx.take_result(), Some(b"42".to_vec()));
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_payload() {
        let ctx = context_for(b"oops");
        let err = TypedHandler::<Resize>::new()
            .handle(&ctx, b"oops")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
    }

    #[tokio::test]
    async fn test_fn_handler_sees_context() {
        let ctx = context_for(b"{}");
        let handler = handler_fn(|ctx: TaskContext, payload: Vec<u8>| async move {
            assert_eq!(ctx.task_type(), "image:resize");
            ctx.write_result(payload);
            Ok(())
        });
        handler.handle(&ctx, b"{}").await.unwrap();
        assert_eq!(ctx.take_result(), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_cancel_is_shared_with_clones() {
        let ctx = context_for(b"{}");
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }
}
