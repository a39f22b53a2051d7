//! Retry and terminal-state policy as a pure transition function.

use crate::config::RetryPolicy;
use crate::error::{FailureKind, HandlerError};
use crate::task::{QueuedTask, TaskState};
use std::time::{Duration, SystemTime};

/// Inputs of the retry decision besides the task itself.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Backoff between retries
    pub retry: RetryPolicy,
    /// Recovered panics fail the task immediately
    pub panic_is_terminal: bool,
}

impl LifecyclePolicy {
    /// Build from the retry policy and the panic setting.
    pub fn new(retry: RetryPolicy, panic_is_terminal: bool) -> Self {
        Self {
            retry,
            panic_is_terminal,
        }
    }

    fn is_terminal(&self, kind: FailureKind) -> bool {
        kind.is_terminal() || (self.panic_is_terminal && kind == FailureKind::Panic)
    }
}

/// Where an attempt leaves the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Handler succeeded
    Complete,
    /// Schedule another attempt
    Retry {
        /// New retry count, previous plus one
        retry_count: u32,
        /// Backoff before the attempt
        delay: Duration,
    },
    /// Terminal failure
    Fail,
}

/// Decide the next state of `task` after an attempt.
///
/// A failure is retried while `retry_count < max_retry` unless its kind is
/// terminal; the retry count therefore never exceeds `max_retry`.
pub fn decide(
    task: &QueuedTask,
    outcome: &Result<(), HandlerError>,
    policy: &LifecyclePolicy,
) -> Transition {
    match outcome {
        Ok(()) => Transition::Complete,
        Err(err) if policy.is_terminal(err.kind()) => Transition::Fail,
        Err(_) if task.retry_count < task.max_retry => {
            let retry_count = task.retry_count + 1;
            Transition::Retry {
                retry_count,
                delay: policy.retry.delay_for(retry_count),
            }
        }
        Err(_) => Transition::Fail,
    }
}

impl Transition {
    /// Apply the transition to a copy of the active task.
    ///
    /// `error` becomes `last_error` for retries and failures; `result` is
    /// stored on completion.
    pub fn apply(
        &self,
        task: &QueuedTask,
        error: Option<&HandlerError>,
        result: Option<Vec<u8>>,
        now: SystemTime,
    ) -> QueuedTask {
        let mut next = task.clone();
        match self {
            Transition::Complete => {
                next.state = TaskState::Completed;
                next.completed_at = Some(now);
                next.result = result;
            }
            Transition::Retry { retry_count, delay } => {
                next.state = TaskState::Pending;
                next.retry_count = *retry_count;
                next.process_at = Some(now + *delay);
                next.last_error = error.map(|e| e.message().to_string());
            }
            Transition::Fail => {
                next.state = TaskState::Failed;
                next.last_error = error.map(|e| e.message().to_string());
            }
        }
        next
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Complete => "completed",
            Transition::Retry { .. } => "retried",
            Transition::Fail => "failed",
        }
    }
}
