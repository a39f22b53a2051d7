//! The anvilq engine: runs the worker pool plus the monitor and janitor loops.
//!
//! Shutdown is structured. Cancelling the pool token stops dequeuing while
//! in-flight tasks run to completion; after the grace period the hard token
//! interrupts what is left and those tasks are requeued at the head of their
//! queues without consuming a retry.

use crate::config::AnvilConfig;
use crate::core::broker::Broker;
use crate::core::middleware::{MiddlewareChain, default_chain};
use crate::core::registry::TaskRegistry;
use crate::core::worker::{ShutdownReport, WorkerManager, WorkerShared, WorkerStats};
use crate::error::{AnvilError, AnvilResult};
use crate::idempotency::IdempotencyGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use crate::metrics::AnvilMetrics;

/// The main anvilq engine that orchestrates all components
pub struct AnvilEngine {
    config: AnvilConfig,
    broker: Arc<Broker>,
    guard: Option<IdempotencyGuard>,
    worker_manager: WorkerManager,
    shutdown: CancellationToken,
    hard: CancellationToken,
    is_running: Arc<AtomicBool>,
    background: Vec<JoinHandle<()>>,
    start_time: Option<Instant>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<AnvilMetrics>>,
}

impl AnvilEngine {
    /// Create an engine with the default middleware chain.
    pub fn new(
        config: AnvilConfig,
        broker: Arc<Broker>,
        registry: Arc<TaskRegistry>,
        guard: Option<IdempotencyGuard>,
    ) -> Self {
        #[cfg(feature = "metrics")]
        let chain = default_chain(None);
        #[cfg(not(feature = "metrics"))]
        let chain = default_chain();
        Self::with_chain(config, broker, registry, guard, chain)
    }

    /// Create an engine with a custom middleware chain.
    pub fn with_chain(
        config: AnvilConfig,
        broker: Arc<Broker>,
        registry: Arc<TaskRegistry>,
        guard: Option<IdempotencyGuard>,
        chain: MiddlewareChain,
    ) -> Self {
        let shared = WorkerShared::new(broker.clone(), registry, guard.clone(), &chain, &config);
        Self {
            config,
            broker,
            guard,
            worker_manager: WorkerManager::new(Arc::new(shared)),
            shutdown: CancellationToken::new(),
            hard: CancellationToken::new(),
            is_running: Arc::new(AtomicBool::new(false)),
            background: Vec::new(),
            start_time: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Publish queue depths to `metrics` from the monitor loop.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn with_metrics(mut self, metrics: Arc<AnvilMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the engine and all its components
    pub async fn start(&mut self) -> AnvilResult<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Err(AnvilError::AlreadyRunning);
        }
        if self.shutdown.is_cancelled() {
            return Err(AnvilError::config("Engine cannot be restarted after shutdown"));
        }

        tracing::info!(
            workers = self.config.workers.num_workers,
            queues = ?self.broker.queues().iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            "Starting anvilq engine"
        );

        for worker_id in 0..self.config.workers.num_workers {
            self.worker_manager
                .spawn_worker(worker_id, self.shutdown.clone(), self.hard.clone())
                .await;
        }

        self.background.push(self.start_monitor());
        self.background.push(self.start_janitor());

        self.is_running.store(true, Ordering::Relaxed);
        self.start_time = Some(Instant::now());
        tracing::info!("anvilq engine started");
        Ok(())
    }

    /// Shutdown the engine gracefully
    pub async fn shutdown(&mut self) -> AnvilResult<ShutdownReport> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(AnvilError::NotRunning);
        }

        tracing::info!("Shutting down anvilq engine");
        self.shutdown.cancel();

        let grace = Duration::from_secs(self.config.workers.shutdown_timeout_secs);
        let report = self.worker_manager.shutdown(grace, &self.hard).await;

        for handle in self.background.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Background loop ended abnormally");
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        tracing::info!(
            drained = report.drained,
            interrupted = report.interrupted,
            aborted = report.aborted,
            "anvilq engine shutdown complete"
        );
        Ok(report)
    }

    /// Start, wait for `token` to be cancelled, then shut down.
    pub async fn run(&mut self, token: CancellationToken) -> AnvilResult<ShutdownReport> {
        self.start().await?;
        token.cancelled().await;
        self.shutdown().await
    }

    /// Start, then shut down on Ctrl+C.
    pub async fn run_until_ctrl_c(&mut self) -> AnvilResult<ShutdownReport> {
        self.start().await?;
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
        } else {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        self.shutdown().await
    }

    fn start_monitor(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let worker_manager = self.worker_manager.clone();
        let expected_workers = self.config.workers.num_workers;
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(self.config.engine.health_check_interval_secs.max(1));
        #[cfg(feature = "metrics")]
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            tracing::debug!("Health monitor started");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(err) = broker.backend().health_check().await {
                    tracing::error!(error = %err, "Queue backend health check failed");
                    continue;
                }

                for spec in broker.queues() {
                    match broker.backend().queue_counts(&spec.name).await {
                        Ok(counts) => {
                            tracing::debug!(
                                queue = %spec.name,
                                pending = counts.pending,
                                scheduled = counts.scheduled,
                                active = counts.active,
                                failed = counts.failed,
                                "Queue depth"
                            );
                            #[cfg(feature = "metrics")]
                            if let Some(metrics) = &metrics {
                                metrics.update_queue_depth(&spec.name, &counts);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(queue = %spec.name, error = %err, "Failed to read queue counts");
                        }
                    }
                }

                let active = worker_manager.active_worker_count();
                let stats = worker_manager.stats();
                if active < expected_workers {
                    tracing::warn!(active, expected = expected_workers, "Worker pool degraded");
                } else {
                    tracing::debug!(
                        active,
                        busy = stats.busy_workers,
                        completed = stats.tasks_completed,
                        failed = stats.tasks_failed,
                        "Worker pool healthy"
                    );
                }
            }

            tracing::debug!("Health monitor stopped");
        })
    }

    fn start_janitor(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let guard = self.guard.clone();
        let shutdown = self.shutdown.clone();
        let lease = self.config.engine.active_lease();
        let cleanup = self.config.engine.enable_auto_cleanup;
        let period = Duration::from_secs(self.config.engine.cleanup_interval_secs.max(1)).min(lease);
        let retention = Duration::from_secs(self.config.engine.completed_retention_secs);

        tokio::spawn(async move {
            tracing::debug!("Janitor started");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match broker.backend().recover_stale(lease).await {
                    Ok(0) => {}
                    Ok(recovered) => tracing::warn!(
                        recovered,
                        lease_secs = lease.as_secs(),
                        "Requeued tasks held past their lease"
                    ),
                    Err(err) => tracing::warn!(error = %err, "Stale task recovery failed"),
                }

                if !cleanup {
                    continue;
                }

                match broker.backend().cleanup(retention).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Removed expired completed tasks"),
                    Err(err) => tracing::warn!(error = %err, "Task cleanup failed"),
                }

                if let Some(guard) = &guard {
                    match guard.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => tracing::debug!(purged, "Purged idempotency records"),
                        Err(err) => tracing::warn!(error = %err, "Idempotency purge failed"),
                    }
                }
            }

            tracing::debug!("Janitor stopped");
        })
    }

    /// Get worker statistics
    pub fn worker_stats(&self) -> WorkerStats {
        self.worker_manager.stats()
    }

    /// Perform a health check
    pub async fn health_check(&self) -> AnvilResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(AnvilError::NotRunning);
        }

        self.broker.backend().health_check().await?;

        let active_workers = self.worker_manager.active_worker_count();
        let expected_workers = self.config.workers.num_workers;
        if active_workers == 0 {
            return Err(AnvilError::config("No active workers"));
        }
        if active_workers < expected_workers / 2 {
            tracing::warn!(
                active_workers,
                expected_workers,
                "Less than half of expected workers active"
            );
        }
        Ok(())
    }

    /// Get engine uptime
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.map(|start| start.elapsed())
    }

    /// Check if engine is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Check if engine is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled() && self.is_running()
    }
}
