//! The main Anvil facade and the engine behind it.
//!
//! [`Anvil`] ties together the broker over the configured queues, the task
//! registry, the idempotency guard and the worker pool, and offers the
//! producer API.

use crate::config::AnvilConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore};
use crate::inspector::QueueInspector;
use crate::queue::{QueueFactory, TaskQueue};
use crate::task::{AnvilTask, DEFAULT_QUEUE, EnqueueOptions, QueuedTask, TaskId, encode_payload};
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

pub mod broker;
pub mod engine;
pub mod handler;
pub mod lifecycle;
pub mod middleware;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use broker::Broker;
pub use engine::AnvilEngine;
pub use handler::{TaskContext, TaskHandler, handler_fn};
pub use lifecycle::{LifecyclePolicy, Transition};
pub use middleware::{Middleware, MiddlewareChain};
pub use registry::{HandlerOptions, RegistryBuilder, TaskRegistry};
pub use worker::{ShutdownReport, WorkerStats};

#[cfg(feature = "metrics")]
use crate::metrics::AnvilMetrics;

/// The main anvilq entry point.
///
/// # Examples
///
/// ```rust,no_run
/// use anvilq::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> AnvilResult<()> {
///     let registry = RegistryBuilder::new()
///         .handle_fn("mail:send", |_ctx, _payload| async { Ok(()) })
///         .build()?;
///     let anvil = Anvil::in_memory(AnvilConfig::default(), registry)?;
///
///     anvil.start_forging().await?;
///     anvil
///         .enqueue_raw("mail:send", &"user@example.com", EnqueueOptions::default())
///         .await?;
///     anvil.stop_forging().await?;
///     Ok(())
/// }
/// ```
pub struct Anvil {
    config: AnvilConfig,
    broker: Arc<Broker>,
    registry: Arc<TaskRegistry>,
    guard: IdempotencyGuard,
    engine: Mutex<Option<AnvilEngine>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<AnvilMetrics>>,
}

impl std::fmt::Debug for Anvil {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anvil")
            .field("broker", &self.broker)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Anvil {
    /// Create an Anvil over `backend` and `idempotency` after validating
    /// `config`. Pass a store shared by every process that consumes the same
    /// queues; a per-process store only deduplicates within one process.
    pub fn new(
        config: AnvilConfig,
        backend: TaskQueue,
        registry: TaskRegistry,
        idempotency: Arc<dyn IdempotencyStore>,
    ) -> AnvilResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(AnvilError::config(errors.join("; ")));
        }

        let broker = Broker::new(
            backend,
            config.queues.clone(),
            std::time::Duration::from_millis(config.workers.idle_timeout_ms),
        );

        #[cfg(feature = "metrics")]
        let metrics = if config.metrics.enabled {
            Some(Arc::new(AnvilMetrics::new()?))
        } else {
            None
        };

        Ok(Self {
            config,
            broker: Arc::new(broker),
            registry: Arc::new(registry),
            guard: IdempotencyGuard::new(idempotency),
            engine: Mutex::new(None),
            #[cfg(feature = "metrics")]
            metrics,
        })
    }

    /// Create an Anvil with in-memory queue and idempotency stores.
    pub fn in_memory(config: AnvilConfig, registry: TaskRegistry) -> AnvilResult<Self> {
        Self::new(
            config,
            QueueFactory::in_memory(),
            registry,
            Arc::new(InMemoryIdempotencyStore::new()),
        )
    }

    /// Create an Anvil with Redis queue and idempotency stores sharing
    /// `key_prefix`.
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub async fn with_redis(
        config: AnvilConfig,
        registry: TaskRegistry,
        connection_string: &str,
        key_prefix: &str,
    ) -> AnvilResult<Self> {
        let queue = crate::queue::RedisQueue::new(connection_string, key_prefix).await?;
        let store = crate::idempotency::RedisIdempotencyStore::from_connection(
            queue.connection(),
            key_prefix,
        );
        Self::new(config, Arc::new(queue), registry, Arc::new(store))
    }

    /// Enqueue a typed task with its own defaults.
    pub async fn enqueue<T: AnvilTask>(&self, task: T) -> AnvilResult<TaskId> {
        self.enqueue_with(task, EnqueueOptions::default()).await
    }

    /// Enqueue a typed task; `options` override the task's defaults.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use anvilq::prelude::*;
    /// # use serde::{Deserialize, Serialize};
    /// # use std::time::Duration;
    /// # #[derive(Debug, Serialize, Deserialize)]
    /// # struct EmailTask { to: String }
    /// # #[async_trait::async_trait]
    /// # impl AnvilTask for EmailTask {
    /// #     const TASK_TYPE: &'static str = "email:send";
    /// #     async fn forge(self, _ctx: &TaskContext) -> Result<(), HandlerError> { Ok(()) }
    /// # }
    /// # async fn example(anvil: &Anvil) -> AnvilResult<()> {
    /// let task = EmailTask { to: "user@example.com".to_string() };
    /// let options = EnqueueOptions::default()
    ///     .queue("critical")
    ///     .delay(Duration::from_secs(30));
    /// let task_id = anvil.enqueue_with(task, options).await?;
    /// # let _ = task_id;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn enqueue_with<T: AnvilTask>(
        &self,
        task: T,
        options: EnqueueOptions,
    ) -> AnvilResult<TaskId> {
        let queue = options.queue.clone().unwrap_or_else(|| task.queue().to_string());
        let options = EnqueueOptions {
            queue: Some(queue),
            max_retry: options.max_retry.or(Some(task.max_retry())),
            delay: options.delay.or_else(|| task.delay()),
            timeout: options.timeout,
        };
        self.enqueue_raw(T::TASK_TYPE, &task, options).await
    }

    /// Enqueue any serializable payload under `task_type`.
    ///
    /// A timeout override is kept in whole milliseconds, rounded up, and
    /// must be shorter than [`EngineConfig::active_lease`](crate::config::EngineConfig::active_lease).
    pub async fn enqueue_raw<P: Serialize + ?Sized>(
        &self,
        task_type: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> AnvilResult<TaskId> {
        let mut task = QueuedTask::new(
            task_type,
            encode_payload(payload)?,
            options.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            options
                .max_retry
                .unwrap_or(self.config.retry.default_max_retry),
        );
        task.process_at = options.delay.map(|delay| SystemTime::now() + delay);
        if let Some(timeout) = options.timeout {
            if timeout >= self.config.engine.active_lease() {
                return Err(AnvilError::config(
                    "Task timeout must be shorter than the active lease",
                ));
            }
            task.set_timeout(timeout);
        }

        self.broker.enqueue(task).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, task_id: &str) -> AnvilResult<Option<QueuedTask>> {
        self.broker.backend().get_task(task_id).await
    }

    /// Start the worker pool.
    pub async fn start_forging(&self) -> AnvilResult<()> {
        let mut engine_guard = self.engine.lock().await;
        if engine_guard.is_some() {
            return Err(AnvilError::AlreadyRunning);
        }

        let mut engine = self.build_engine();
        engine.start().await?;
        *engine_guard = Some(engine);

        tracing::info!(workers = self.config.workers.num_workers, "Anvil started forging");
        Ok(())
    }

    /// Stop the worker pool, draining in-flight tasks.
    pub async fn stop_forging(&self) -> AnvilResult<ShutdownReport> {
        let mut engine_guard = self.engine.lock().await;
        let Some(mut engine) = engine_guard.take() else {
            return Err(AnvilError::NotRunning);
        };

        let report = engine.shutdown().await?;
        tracing::info!("Anvil stopped forging");
        Ok(report)
    }

    /// Check if the pool is currently running.
    pub async fn is_forging(&self) -> bool {
        self.engine.lock().await.is_some()
    }

    /// Worker statistics, if the pool is running.
    pub async fn stats(&self) -> Option<WorkerStats> {
        self.engine.lock().await.as_ref().map(AnvilEngine::worker_stats)
    }

    /// Check the queue backend and, when running, the worker pool.
    pub async fn health_check(&self) -> AnvilResult<()> {
        self.broker.backend().health_check().await?;
        if let Some(engine) = self.engine.lock().await.as_ref() {
            engine.health_check().await?;
        }
        Ok(())
    }

    /// Admin view over the queues.
    pub fn inspector(&self) -> QueueInspector {
        QueueInspector::new(self.broker.clone())
    }

    /// The broker
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// The task registry
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Get the configuration used by this Anvil.
    pub fn config(&self) -> &AnvilConfig {
        &self.config
    }

    /// Prometheus metrics, when enabled in the configuration.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn metrics(&self) -> Option<&Arc<AnvilMetrics>> {
        self.metrics.as_ref()
    }

    #[cfg(feature = "metrics")]
    fn build_engine(&self) -> AnvilEngine {
        let engine = AnvilEngine::with_chain(
            self.config.clone(),
            self.broker.clone(),
            self.registry.clone(),
            Some(self.guard.clone()),
            middleware::default_chain(self.metrics.clone()),
        );
        match &self.metrics {
            Some(metrics) => engine.with_metrics(metrics.clone()),
            None => engine,
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn build_engine(&self) -> AnvilEngine {
        AnvilEngine::new(
            self.config.clone(),
            self.broker.clone(),
            self.registry.clone(),
            Some(self.guard.clone()),
        )
    }
}

impl Drop for Anvil {
    fn drop(&mut self) {
        if let Ok(engine) = self.engine.try_lock() {
            if engine.is_some() {
                tracing::warn!("Anvil dropped while running. Call stop_forging() for a graceful shutdown.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handler::TaskContext;
    use crate::error::HandlerError;
    use crate::task::TaskState;
    use serde::Deserialize;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[derive(Debug, Serialize, Deserialize)]
    struct ArchiveTask {
        bucket: String,
    }

    #[async_trait::async_trait]
    impl AnvilTask for ArchiveTask {
        const TASK_TYPE: &'static str = "storage:archive";

        async fn forge(self, ctx: &TaskContext) -> Result<(), HandlerError> {
            ctx.write_json(&format!("archived {}", self.bucket))?;
            Ok(())
        }

        fn queue(&self) -> &str {
            "low"
        }

        fn max_retry(&self) -> u32 {
            7
        }
    }

    fn anvil() -> Anvil {
        let registry = RegistryBuilder::new()
            .register_task::<ArchiveTask>()
            .build()
            .unwrap();
        Anvil::in_memory(AnvilConfig::testing(), registry).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = AnvilConfig::testing().with_queues(Vec::new());
        let err = Anvil::in_memory(config, TaskRegistry::default()).unwrap_err();
        assert!(matches!(err, AnvilError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_new_uses_given_idempotency_store() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        store
            .release("archive:nightly", Some(b"\"done earlier\""), Duration::from_secs(60))
            .await
            .unwrap();

        let registry = RegistryBuilder::new()
            .register_task_with::<ArchiveTask>(
                HandlerOptions::new().with_key(|_task| "archive:nightly".to_string()),
            )
            .build()
            .unwrap();
        let anvil = Anvil::new(
            AnvilConfig::testing(),
            QueueFactory::in_memory(),
            registry,
            store,
        )
        .unwrap();
        anvil.start_forging().await.unwrap();

        let id = anvil
            .enqueue(ArchiveTask {
                bucket: "nightly".to_string(),
            })
            .await
            .unwrap();
        let mut done = None;
        for _ in 0..200 {
            let task = anvil.get_task(&id).await.unwrap().unwrap();
            if task.state == TaskState::Completed {
                done = Some(task);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Served from the shared record, the handler never ran
        assert_eq!(done.unwrap().result.as_deref(), Some(&b"\"done earlier\""[..]));
        assert_eq!(anvil.stats().await.unwrap().tasks_deduplicated, 1);
        anvil.stop_forging().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_uses_task_defaults() {
        let anvil = anvil();
        let id = anvil
            .enqueue(ArchiveTask {
                bucket: "logs".to_string(),
            })
            .await
            .unwrap();

        let task = anvil.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.queue, "low");
        assert_eq!(task.max_retry, 7);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.task_type, "storage:archive");
    }

    #[tokio::test]
    async fn test_enqueue_options_override() {
        let anvil = anvil();
        let options = EnqueueOptions::default()
            .queue("critical")
            .max_retry(0)
            .delay(Duration::from_secs(60))
            .timeout(Duration::from_secs(5));
        let id = anvil
            .enqueue_with(ArchiveTask { bucket: "x".to_string() }, options)
            .await
            .unwrap();

        let task = anvil.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.queue, "critical");
        assert_eq!(task.max_retry, 0);
        assert_eq!(task.timeout(), Some(Duration::from_secs(5)));
        assert!(task.process_at.unwrap() > SystemTime::now());
    }

    #[tokio::test]
    async fn test_enqueue_keeps_sub_second_timeouts() {
        let anvil = anvil();
        let short = EnqueueOptions::default().timeout(Duration::from_millis(200));
        let id = anvil.enqueue_raw("mail:send", &1, short).await.unwrap();
        let task = anvil.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.timeout(), Some(Duration::from_millis(200)));

        let fractional = EnqueueOptions::default().timeout(Duration::from_micros(1_900_500));
        let id = anvil.enqueue_raw("mail:send", &1, fractional).await.unwrap();
        let task = anvil.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.timeout_ms, Some(1901));

        let too_long = EnqueueOptions::default().timeout(Duration::from_secs(86_400));
        assert!(anvil.enqueue_raw("mail:send", &1, too_long).await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_raw_validation() {
        let anvil = anvil();
        let err = anvil
            .enqueue_raw("mail:send", &1, EnqueueOptions::default().queue("bulk"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnvilError::InvalidQueue { .. }));

        assert!(anvil
            .enqueue_raw("", &1, EnqueueOptions::default())
            .await
            .is_err());

        let id = anvil
            .enqueue_raw("mail:send", &"hi", EnqueueOptions::default())
            .await
            .unwrap();
        let task = anvil.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.queue, DEFAULT_QUEUE);
        assert_eq!(task.max_retry, anvil.config().retry.default_max_retry);
    }

    #[tokio::test]
    async fn test_forging_lifecycle() {
        let anvil = anvil();
        assert!(!anvil.is_forging().await);
        assert!(matches!(anvil.stop_forging().await, Err(AnvilError::NotRunning)));

        assert_ok!(anvil.start_forging().await);
        assert!(anvil.is_forging().await);
        assert!(matches!(anvil.start_forging().await, Err(AnvilError::AlreadyRunning)));

        let id = anvil
            .enqueue(ArchiveTask {
                bucket: "media".to_string(),
            })
            .await
            .unwrap();

        let mut done = None;
        for _ in 0..200 {
            let task = anvil.get_task(&id).await.unwrap().unwrap();
            if task.state == TaskState::Completed {
                done = Some(task);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let done = done.unwrap();
        assert_eq!(done.result.as_deref(), Some(&b"\"archived media\""[..]));
        assert_eq!(anvil.stats().await.unwrap().tasks_completed, 1);

        anvil.stop_forging().await.unwrap();
        assert!(!anvil.is_forging().await);
        assert!(anvil.stats().await.is_none());

        // A stopped Anvil can start a fresh pool
        anvil.start_forging().await.unwrap();
        anvil.stop_forging().await.unwrap();
    }
}
