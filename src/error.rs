//! Error types for anvilq operations.
//!
//! Two families live here. [`AnvilError`] covers infrastructure and operator
//! facing failures (unknown queues, unreachable stores, missing tasks).
//! [`HandlerError`] is what a task handler returns; it is recorded on the task
//! as `last_error` and classified by [`FailureKind`] to drive the retry policy.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout anvilq.
pub type AnvilResult<T> = Result<T, AnvilError>;

/// Main error type for anvilq operations.
#[derive(Error, Debug)]
pub enum AnvilError {
    /// Queue name is not part of the configured queue set
    #[error("Queue '{queue}' is not configured")]
    InvalidQueue {
        /// The queue that was requested
        queue: String,
    },

    /// Task does not exist (or is not in the state the operation requires)
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The task id that was requested
        task_id: String,
    },

    /// No handler registered for a task type
    #[error("No handler registered for task type '{task_type}'")]
    HandlerNotRegistered {
        /// The task type without a handler
        task_type: String,
    },

    /// A handler was registered twice for the same task type
    #[error("Handler for task type '{task_type}' registered more than once")]
    DuplicateHandler {
        /// The duplicated task type
        task_type: String,
    },

    /// Page or page size outside the accepted range
    #[error("Invalid pagination: {message}")]
    InvalidPagination {
        /// What was wrong with the request
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Queue backend rejected or failed an operation
    #[error("Queue error: {message}")]
    QueueError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Broker backing store cannot be reached
    #[error("Broker unavailable: {message}")]
    BrokerUnavailable {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Idempotency store cannot be reached
    #[error("Idempotency store unavailable: {message}")]
    IdempotencyStoreUnavailable {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Engine is already running
    #[error("Anvil is already running")]
    AlreadyRunning,

    /// Engine is not running
    #[error("Anvil is not running")]
    NotRunning,

    /// Redis command error that is not a connectivity problem
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl AnvilError {
    /// Create a new queue error
    pub fn queue<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::QueueError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a broker-unavailable error
    pub fn broker_unavailable<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BrokerUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an idempotency-store-unavailable error
    pub fn idempotency_unavailable(message: impl Into<String>) -> Self {
        Self::IdempotencyStoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a task-not-found error
    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    /// Create an invalid-queue error
    pub fn invalid_queue(queue: impl Into<String>) -> Self {
        Self::InvalidQueue {
            queue: queue.into(),
        }
    }

    /// Code surfaced to the admin REST layer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidQueue { .. } | Self::InvalidPagination { .. } => ErrorCode::BadRequest,
            Self::TaskNotFound { .. } => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }

    /// Infrastructure failures that should be retried at the connection level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable { .. } | Self::IdempotencyStoreUnavailable { .. }
        )
    }

    /// Message safe to return across a trust boundary.
    ///
    /// Internal errors collapse to a generic sentence so store or handler
    /// details never leave the process.
    pub fn public_message(&self) -> String {
        match self.code() {
            ErrorCode::BadRequest | ErrorCode::NotFound => self.to_string(),
            ErrorCode::Internal => "internal error".to_string(),
        }
    }
}

/// Structured error codes for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid queue or pagination parameters
    BadRequest,
    /// Unknown task
    NotFound,
    /// Broker unavailable or unexpected failure
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "ERR_BAD_REQUEST",
            ErrorCode::NotFound => "ERR_NOT_FOUND",
            ErrorCode::Internal => "ERR_INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed payload or missing field; never retried
    Validation,
    /// Handler explicitly asked not to be retried
    SkipRetry,
    /// Downstream dependency failure; retried up to `max_retry`
    Transient,
    /// Handler panicked
    Panic,
    /// Handler exceeded its processing deadline
    Timeout,
    /// Idempotency store unreachable in fail-closed mode
    IdempotencyUnavailable,
    /// Task type has no registered handler
    Unregistered,
}

impl FailureKind {
    /// Whether this kind bypasses the retry budget entirely.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailureKind::Validation | FailureKind::SkipRetry | FailureKind::Unregistered
        )
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::SkipRetry => "skip_retry",
            FailureKind::Transient => "transient",
            FailureKind::Panic => "panic",
            FailureKind::Timeout => "timeout",
            FailureKind::IdempotencyUnavailable => "idempotency_unavailable",
            FailureKind::Unregistered => "unregistered",
        }
    }
}

/// Error returned by a task handler.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    kind: FailureKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Retryable failure with a plain message.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
            source: None,
        }
    }

    /// Retryable failure wrapping an underlying error.
    pub fn new<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: FailureKind::Transient,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap an error with the skip-retry marker: the task fails immediately.
    pub fn skip_retry<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: FailureKind::SkipRetry,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Malformed input; the task fails immediately.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Validation,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panic,
            message: format!("handler panicked: {}", message.into()),
            source: None,
        }
    }

    pub(crate) fn timeout(deadline: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("processing deadline of {:?} exceeded", deadline),
            source: None,
        }
    }

    pub(crate) fn idempotency_unavailable(source: AnvilError) -> Self {
        Self {
            kind: FailureKind::IdempotencyUnavailable,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn unregistered(task_type: &str) -> Self {
        Self {
            kind: FailureKind::Unregistered,
            message: format!("no handler registered for task type '{}'", task_type),
            source: None,
        }
    }

    /// Failure classification.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Human readable message stored as the task's `last_error`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the skip-retry marker (or another terminal kind) is set.
    pub fn is_skip_retry(&self) -> bool {
        self.kind.is_terminal()
    }
}

impl From<AnvilError> for HandlerError {
    fn from(err: AnvilError) -> Self {
        HandlerError::new(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            kind: FailureKind::Validation,
            message: format!("invalid payload: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AnvilError::invalid_queue("nope").code(),
            ErrorCode::BadRequest
        );
        assert_eq!(AnvilError::task_not_found("t-1").code(), ErrorCode::NotFound);
        assert_eq!(
            AnvilError::idempotency_unavailable("down").code(),
            ErrorCode::Internal
        );
        assert_eq!(ErrorCode::BadRequest.as_str(), "ERR_BAD_REQUEST");
        assert_eq!(ErrorCode::NotFound.to_string(), "ERR_NOT_FOUND");
    }

    #[test]
    fn test_public_message_hides_internal_details() {
        let err = AnvilError::QueueError {
            message: "ERR wrong number of arguments for 'hset'".to_string(),
            source: None,
        };
        assert_eq!(err.public_message(), "internal error");

        let err = AnvilError::task_not_found("abc");
        assert!(err.public_message().contains("abc"));
    }

    #[test]
    fn test_skip_retry_marker() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad order id");
        let err = HandlerError::skip_retry(io);
        assert!(err.is_skip_retry());
        assert_eq!(err.kind(), FailureKind::SkipRetry);
        assert_eq!(err.message(), "bad order id");
        assert!(std::error::Error::source(&err).is_some());

        assert!(!HandlerError::transient("db timeout").is_skip_retry());
    }

    #[test]
    fn test_payload_decode_error_is_validation() {
        let decode: Result<u32, _> = serde_json::from_str("\"not a number\"");
        let err: HandlerError = decode.unwrap_err().into();
        assert_eq!(err.kind(), FailureKind::Validation);
        assert!(err.is_skip_retry());
    }
}
