//! Configuration types for anvilq.
//!
//! Everything the broker, the worker pool and the housekeeping loops need is
//! grouped under [`AnvilConfig`]. Loading it from a file or the environment is
//! left to the embedding application; all types derive serde.

use crate::idempotency::IdempotencyMode;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main configuration for anvilq.
///
/// # Examples
///
/// ```rust
/// use anvilq::config::{AnvilConfig, QueueSpec, WorkerConfig};
///
/// let config = AnvilConfig {
///     workers: WorkerConfig::with_workers(8).with_task_timeout(120),
///     queues: vec![QueueSpec::new("emails", 5), QueueSpec::new("reports", 1)],
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnvilConfig {
    /// Worker pool configuration
    pub workers: WorkerConfig,

    /// Named queues and their weights, in scheduling order
    pub queues: Vec<QueueSpec>,

    /// Retry and backoff policy
    pub retry: RetryPolicy,

    /// Idempotency guard defaults
    pub idempotency: IdempotencyConfig,

    /// Engine-level configuration
    pub engine: EngineConfig,

    /// Prometheus metrics configuration
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for AnvilConfig {
    fn default() -> Self {
        Self {
            workers: WorkerConfig::default(),
            queues: QueueSpec::defaults(),
            retry: RetryPolicy::default(),
            idempotency: IdempotencyConfig::default(),
            engine: EngineConfig::default(),
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// A named queue and its scheduling weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Positive scheduling weight
    pub weight: u32,
}

impl QueueSpec {
    /// Create a queue spec.
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }

    /// `critical: 6`, `default: 3`, `low: 1`
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("critical", 6),
            Self::new("default", 3),
            Self::new("low", 1),
        ]
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent execution loops
    pub num_workers: usize,

    /// Default processing deadline per task (in seconds)
    pub task_timeout_secs: Option<u64>,

    /// Grace period for in-flight tasks on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Upper bound on the idle wait between dequeue polls (in milliseconds)
    pub idle_timeout_ms: u64,

    /// Treat a recovered panic as terminal instead of transient
    pub panic_is_terminal: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            task_timeout_secs: Some(300),
            shutdown_timeout_secs: 30,
            idle_timeout_ms: 1000,
            panic_is_terminal: false,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific number of workers.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the default task deadline.
    pub fn with_task_timeout(mut self, timeout_secs: u64) -> Self {
        self.task_timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }

    /// Default deadline as a [`Duration`].
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry budget for tasks enqueued without an explicit one
    pub default_max_retry: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,

    /// Relative jitter band, `0.0` disables jitter
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_max_retry: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff.
    pub fn exponential(default_max_retry: u32) -> Self {
        Self {
            default_max_retry,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Create a retry policy with linear backoff.
    pub fn linear(default_max_retry: u32) -> Self {
        Self {
            default_max_retry,
            backoff_strategy: BackoffStrategy::Linear { increment_ms: 1000 },
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays and no jitter.
    pub fn fixed(default_max_retry: u32, delay_ms: u64) -> Self {
        Self {
            default_max_retry,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
        }
    }

    /// Delay before the given retry (1-based), jittered and capped at
    /// `max_delay_ms`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let attempt = retry_count.saturating_sub(1);
        let base = self.base_delay_ms as f64;
        let raw = match &self.backoff_strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear { increment_ms } => {
                base + (*increment_ms as f64) * attempt as f64
            }
            BackoffStrategy::Exponential { multiplier } => {
                base * multiplier.powi(attempt.min(63) as i32)
            }
        };

        let jittered = if self.jitter_factor > 0.0 {
            let band = self.jitter_factor.min(1.0);
            raw * (1.0 + rand::thread_rng().gen_range(-band..=band))
        } else {
            raw
        };

        let capped = jittered.clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Idempotency guard defaults, overridable per task type at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Whether the guard runs at all
    pub enabled: bool,

    /// Behaviour when the store is unreachable
    pub default_mode: IdempotencyMode,

    /// Record lifetime (in seconds)
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_mode: IdempotencyMode::FailOpen,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl IdempotencyConfig {
    /// Record lifetime as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Health monitor interval (in seconds)
    pub health_check_interval_secs: u64,

    /// Let the janitor drop old completed tasks and expired idempotency
    /// records. Stale `Active` recovery runs regardless.
    pub enable_auto_cleanup: bool,

    /// Janitor interval (in seconds)
    pub cleanup_interval_secs: u64,

    /// How long completed tasks are retained (in seconds)
    pub completed_retention_secs: u64,

    /// How long a task may stay `Active` before the janitor puts it back
    /// in its queue (in seconds). Must exceed the longest task deadline.
    pub active_lease_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            enable_auto_cleanup: true,
            cleanup_interval_secs: 60,
            completed_retention_secs: 3600,
            active_lease_secs: 900,
        }
    }
}

impl EngineConfig {
    /// Active lease as a [`Duration`].
    pub fn active_lease(&self) -> Duration {
        Duration::from_secs(self.active_lease_secs)
    }
}

/// Metrics configuration.
#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install the metrics middleware and refresh depth gauges
    pub enabled: bool,
}

#[cfg(feature = "metrics")]
impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl AnvilConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 2,
                task_timeout_secs: Some(60),
                ..Default::default()
            },
            engine: EngineConfig {
                health_check_interval_secs: 10,
                completed_retention_secs: 300,
                ..Default::default()
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig { enabled: false },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: num_cpus::get() * 2,
                task_timeout_secs: Some(300),
                shutdown_timeout_secs: 60,
                ..Default::default()
            },
            retry: RetryPolicy::exponential(5),
            idempotency: IdempotencyConfig {
                default_mode: IdempotencyMode::FailClosed,
                ..Default::default()
            },
            engine: EngineConfig {
                health_check_interval_secs: 60,
                completed_retention_secs: 86_400,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 1,
                task_timeout_secs: Some(10),
                shutdown_timeout_secs: 5,
                idle_timeout_ms: 50,
                panic_is_terminal: false,
            },
            retry: RetryPolicy::fixed(1, 10),
            engine: EngineConfig {
                health_check_interval_secs: 1,
                enable_auto_cleanup: false,
                ..Default::default()
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig { enabled: false },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Replace the queue set.
    pub fn with_queues(mut self, queues: Vec<QueueSpec>) -> Self {
        self.queues = queues;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Whether `queue` is one of the configured queues.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q.name == queue)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.num_workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.workers.num_workers > 1000 {
            errors.push("Number of workers should not exceed 1000".to_string());
        }

        if self.workers.task_timeout_secs == Some(0) {
            errors.push("Task timeout must be greater than 0".to_string());
        }

        if self.queues.is_empty() {
            errors.push("At least one queue must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                errors.push("Queue names must not be empty".to_string());
            }
            if queue.weight == 0 {
                errors.push(format!("Queue '{}' weight must be greater than 0", queue.name));
            }
            if !seen.insert(queue.name.as_str()) {
                errors.push(format!("Queue '{}' is configured twice", queue.name));
            }
        }

        if self.retry.base_delay_ms == 0 {
            errors.push("Retry base delay must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            errors.push("Retry jitter factor must be between 0.0 and 1.0".to_string());
        }

        if self.idempotency.enabled && self.idempotency.ttl_secs == 0 {
            errors.push("Idempotency TTL must be greater than 0".to_string());
        }

        if self.engine.health_check_interval_secs == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if self.engine.enable_auto_cleanup && self.engine.cleanup_interval_secs == 0 {
            errors.push("Cleanup interval must be greater than 0".to_string());
        }

        if self.engine.active_lease_secs == 0 {
            errors.push("Active lease must be greater than 0".to_string());
        } else if self
            .workers
            .task_timeout_secs
            .is_some_and(|timeout| self.engine.active_lease_secs <= timeout)
        {
            errors.push("Active lease must be longer than the task timeout".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
