//! Task definition, lifecycle states and the payload codec.

use crate::core::handler::TaskContext;
use crate::error::{AnvilResult, HandlerError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Unique identifier for a task
pub type TaskId = String;

/// Queue used when a producer does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle state of a task.
///
/// `Pending -> Active -> {Completed | Pending (retry) | Failed}`. A retried
/// task goes back to `Pending` with a future `process_at`; `Failed` only
/// leaves through an operator retry or delete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be dispatched (possibly delayed until `process_at`)
    Pending,
    /// Currently held by a worker
    Active,
    /// Handler finished successfully
    Completed,
    /// Terminal failure, retained for operators
    Failed,
}

impl TaskState {
    /// Lowercase label used in store keys, logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

/// Internal representation of a task in a queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedTask {
    /// Unique task identifier, stable across retries
    pub id: TaskId,
    /// Handler selector, by convention `"{domain}:{action}"`
    pub task_type: String,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Queue the task was enqueued into
    pub queue: String,
    /// Current state
    pub state: TaskState,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retry: u32,
    /// When the task was enqueued
    pub enqueued_at: SystemTime,
    /// When the latest attempt started
    pub processed_at: Option<SystemTime>,
    /// When the task completed
    pub completed_at: Option<SystemTime>,
    /// Earliest time the task may be dispatched
    pub process_at: Option<SystemTime>,
    /// Per-task processing deadline override (milliseconds)
    pub timeout_ms: Option<u64>,
    /// Error message of the latest failed attempt
    pub last_error: Option<String>,
    /// Bytes written by the handler through its context
    pub result: Option<Vec<u8>>,
}

impl QueuedTask {
    /// Build a fresh pending task with a new id.
    pub fn new(
        task_type: impl Into<String>,
        payload: Vec<u8>,
        queue: impl Into<String>,
        max_retry: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            queue: queue.into(),
            state: TaskState::Pending,
            retry_count: 0,
            max_retry,
            enqueued_at: SystemTime::now(),
            processed_at: None,
            completed_at: None,
            process_at: None,
            timeout_ms: None,
            last_error: None,
            result: None,
        }
    }

    /// Whether a pending task may be dispatched at `now`.
    pub fn is_ready(&self, now: SystemTime) -> bool {
        self.process_at.is_none_or(|at| at <= now)
    }

    /// Per-task processing deadline, if one was set at enqueue.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Set the per-task deadline. It is stored in whole milliseconds,
    /// rounded up, so it is never shorter than requested and never zero.
    pub fn set_timeout(&mut self, timeout: Duration) {
        let nanos = timeout.as_nanos().max(1);
        let millis = nanos.div_ceil(1_000_000);
        self.timeout_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
    }

    /// Operator retry of a failed task: back to `Pending` with a fresh
    /// retry budget. `last_error` is kept for history.
    pub fn revive(&mut self) {
        self.state = TaskState::Pending;
        self.retry_count = 0;
        self.process_at = None;
        self.processed_at = None;
    }
}

/// Options a producer can attach to an enqueue call.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Target queue (defaults to the task's own queue, then `"default"`)
    pub queue: Option<String>,
    /// Retry budget override
    pub max_retry: Option<u32>,
    /// Delay before first dispatch
    pub delay: Option<Duration>,
    /// Processing deadline override
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    /// Target a specific queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Override the retry budget.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Delay the first dispatch.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Override the processing deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Trait for strongly typed tasks.
///
/// The payload is the task value itself, encoded with [`encode_payload`].
/// Register the type with
/// [`RegistryBuilder::register_task`](crate::core::registry::RegistryBuilder::register_task).
#[async_trait]
pub trait AnvilTask: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Task type identifier, by convention `"{domain}:{action}"`
    const TASK_TYPE: &'static str;

    /// Execute the task.
    async fn forge(self, ctx: &TaskContext) -> Result<(), HandlerError>;

    /// Queue this task goes to unless the enqueue call overrides it
    fn queue(&self) -> &str {
        DEFAULT_QUEUE
    }

    /// Retry budget for this task
    fn max_retry(&self) -> u32 {
        3
    }

    /// Delay before the first dispatch
    fn delay(&self) -> Option<Duration> {
        None
    }
}

/// Encode a payload to bytes.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> AnvilResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a payload; a malformed payload is a validation failure.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HandlerError> {
    Ok(serde_json::from_slice(bytes)?)
}
