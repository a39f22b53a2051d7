//! Worker implementation for anvilq.
//!
//! Each worker pulls tasks from the [`Broker`], runs them through the
//! middleware chain under the idempotency guard and the processing deadline,
//! then writes the resulting transition back to the queue backend.

use crate::config::AnvilConfig;
use crate::core::broker::Broker;
use crate::core::handler::{TaskContext, TaskHandler};
use crate::core::lifecycle::{LifecyclePolicy, Transition, decide};
use crate::core::middleware::MiddlewareChain;
use crate::core::registry::{RegistryDispatch, TaskRegistry};
use crate::error::{AnvilError, HandlerError};
use crate::idempotency::{IdempotencyGuard, IdempotencyMode, Reservation};
use crate::task::QueuedTask;
use crate::utils::calculate_backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Attempts at writing a transition while the store is unreachable.
const COMMIT_ATTEMPTS: u32 = 5;

/// Attempts at dropping a reservation after a failed attempt.
const ABANDON_ATTEMPTS: u32 = 3;

/// Time workers get to requeue their tasks once the hard stop fires.
const HARD_STOP_GRACE: Duration = Duration::from_secs(5);

/// Statistics about worker performance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Workers whose loop is running
    pub active_workers: usize,
    /// Workers currently processing a task
    pub busy_workers: usize,
    /// Total number of workers spawned
    pub total_workers: usize,
    /// Tasks completed, including duplicates
    pub tasks_completed: u64,
    /// Attempts that scheduled a retry
    pub tasks_retried: u64,
    /// Tasks that reached `Failed`
    pub tasks_failed: u64,
    /// Tasks skipped by the idempotency guard
    pub tasks_deduplicated: u64,
    /// Tasks put back after a hard stop
    pub tasks_requeued: u64,
}

/// What happened to one dequeued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Processed {
    Completed,
    Retried,
    Failed,
    Duplicate,
    Requeued,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    busy: AtomicUsize,
    total: AtomicUsize,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    deduplicated: AtomicU64,
    requeued: AtomicU64,
}

impl Counters {
    fn record(&self, processed: Processed) {
        let counter = match processed {
            Processed::Completed => &self.completed,
            Processed::Retried => &self.retried,
            Processed::Failed => &self.failed,
            Processed::Duplicate => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                &self.deduplicated
            }
            Processed::Requeued => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            active_workers: self.active.load(Ordering::Relaxed),
            busy_workers: self.busy.load(Ordering::Relaxed),
            total_workers: self.total.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            tasks_retried: self.retried.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            tasks_deduplicated: self.deduplicated.load(Ordering::Relaxed),
            tasks_requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every worker of a pool.
pub(crate) struct WorkerShared {
    broker: Arc<Broker>,
    registry: Arc<TaskRegistry>,
    handler: Arc<dyn TaskHandler>,
    guard: Option<IdempotencyGuard>,
    policy: LifecyclePolicy,
    default_timeout: Option<Duration>,
    default_mode: IdempotencyMode,
    default_ttl: Duration,
    counters: Counters,
}

impl WorkerShared {
    pub(crate) fn new(
        broker: Arc<Broker>,
        registry: Arc<TaskRegistry>,
        guard: Option<IdempotencyGuard>,
        chain: &MiddlewareChain,
        config: &AnvilConfig,
    ) -> Self {
        let handler = chain.apply(Arc::new(RegistryDispatch::new(registry.clone())));
        Self {
            broker,
            registry,
            handler,
            guard: guard.filter(|_| config.idempotency.enabled),
            policy: LifecyclePolicy::new(config.retry.clone(), config.workers.panic_is_terminal),
            default_timeout: config.workers.task_timeout(),
            default_mode: config.idempotency.default_mode,
            default_ttl: config.idempotency.ttl(),
            counters: Counters::default(),
        }
    }
}

/// A key this attempt holds in the idempotency store.
struct Claim {
    key: String,
    ttl: Duration,
}

/// Backend write that ends an attempt.
#[derive(Debug, Clone, Copy)]
enum Write {
    Complete,
    Retry,
    Fail,
    Requeue,
}

impl From<&Transition> for Write {
    fn from(transition: &Transition) -> Self {
        match transition {
            Transition::Complete => Write::Complete,
            Transition::Retry { .. } => Write::Retry,
            Transition::Fail => Write::Fail,
        }
    }
}

/// Individual worker that processes tasks
pub struct Worker {
    id: usize,
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<WorkerShared>) -> Self {
        Self { id, shared }
    }

    /// Worker id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Run the worker loop until `shutdown` is cancelled.
    ///
    /// A task in flight when `shutdown` fires is finished normally; `hard`
    /// interrupts it and puts it back at the head of its queue.
    pub async fn run(&self, shutdown: CancellationToken, hard: CancellationToken) {
        tracing::info!(worker_id = self.id, "Worker started");
        let mut failures = 0u32;

        loop {
            let task = match self.shared.broker.dequeue(&shutdown).await {
                Ok(task) => {
                    failures = 0;
                    task
                }
                Err(AnvilError::Cancelled) => break,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let backoff_ms = calculate_backoff(failures, self.id as u64);
                    tracing::warn!(
                        worker_id = self.id,
                        error = %err,
                        backoff_ms,
                        "Dequeue failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(Duration::from_millis(backoff_ms)) => continue,
                    }
                }
            };

            self.shared.counters.busy.fetch_add(1, Ordering::Relaxed);
            let processed = self.process(task, &hard).await;
            self.shared.counters.busy.fetch_sub(1, Ordering::Relaxed);
            self.shared.counters.record(processed);
        }

        tracing::info!(worker_id = self.id, "Worker stopped");
    }

    /// Process one task that the broker handed out as `Active`.
    pub(crate) async fn process(&self, task: QueuedTask, hard: &CancellationToken) -> Processed {
        let mut claim = None;
        let mut refused = None;

        let registration = self.shared.registry.get(&task.task_type);
        if let (Some(registration), Some(guard)) = (registration, &self.shared.guard) {
            if registration.is_idempotent() {
                let key = registration.idempotency_key(&task);
                let ttl = registration.ttl_or(self.shared.default_ttl);
                let mode = registration.mode_or(self.shared.default_mode);

                match guard.reserve(&key, &task.id, ttl, mode).await {
                    Ok(Reservation::Proceed) => claim = Some(Claim { key, ttl }),
                    Ok(Reservation::Duplicate { cached_result }) => {
                        tracing::info!(
                            task_id = %task.id,
                            idempotency_key = %key,
                            "Duplicate task, handler skipped"
                        );
                        let done =
                            Transition::Complete.apply(&task, None, cached_result, SystemTime::now());
                        self.commit(Write::Complete, &done).await;
                        return Processed::Duplicate;
                    }
                    Err(err) => refused = Some(HandlerError::idempotency_unavailable(err)),
                }
            }
        }

        let (outcome, result) = match refused {
            Some(err) => (Err(err), None),
            None => match self.execute(&task, hard).await {
                Some(finished) => finished,
                None => {
                    if let Some(claim) = &claim {
                        self.abandon(claim, &task).await;
                    }
                    tracing::warn!(task_id = %task.id, "Task interrupted by hard stop, requeueing");
                    self.commit(Write::Requeue, &task).await;
                    return Processed::Requeued;
                }
            },
        };

        let transition = decide(&task, &outcome, &self.shared.policy);
        let next = transition.apply(&task, outcome.as_ref().err(), result, SystemTime::now());

        // Settle the key before the backend write makes the task visible again
        if let (Some(claim), Some(guard)) = (&claim, &self.shared.guard) {
            match transition {
                Transition::Complete => {
                    guard
                        .release(&claim.key, next.result.as_deref(), claim.ttl)
                        .await
                }
                Transition::Retry { .. } | Transition::Fail => self.abandon(claim, &task).await,
            }
        }

        match &transition {
            Transition::Retry { retry_count, delay } => tracing::debug!(
                task_id = %task.id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "Task scheduled for retry"
            ),
            Transition::Fail => tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                retry_count = task.retry_count,
                error = next.last_error.as_deref().unwrap_or_default(),
                "Task failed permanently"
            ),
            Transition::Complete => {}
        }

        self.commit(Write::from(&transition), &next).await;
        match transition {
            Transition::Complete => Processed::Completed,
            Transition::Retry { .. } => Processed::Retried,
            Transition::Fail => Processed::Failed,
        }
    }

    /// Run the handler chain. `None` means the hard stop interrupted it.
    async fn execute(
        &self,
        task: &QueuedTask,
        hard: &CancellationToken,
    ) -> Option<(Result<(), HandlerError>, Option<Vec<u8>>)> {
        let limit = task.timeout().or(self.shared.default_timeout);
        let ctx = TaskContext::new(task, limit.map(|l| Instant::now() + l), hard.child_token());

        let attempt = async {
            let call = self.shared.handler.handle(&ctx, &task.payload);
            match limit {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        ctx.cancel();
                        Err(HandlerError::timeout(limit))
                    }
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = hard.cancelled() => {
                ctx.cancel();
                None
            }
            outcome = attempt => Some((outcome, ctx.take_result())),
        }
    }

    /// Drop this attempt's reservation. If the store stays unreachable the
    /// record is left behind; the next attempt of the same task reclaims it
    /// as its owner.
    async fn abandon(&self, claim: &Claim, task: &QueuedTask) {
        let Some(guard) = &self.shared.guard else {
            return;
        };
        let mut attempt = 0u32;

        loop {
            match guard.abandon(&claim.key, &task.id).await {
                Ok(()) => return,
                Err(err) if attempt + 1 < ABANDON_ATTEMPTS => {
                    attempt += 1;
                    let backoff_ms = calculate_backoff(attempt, self.id as u64);
                    tracing::debug!(
                        task_id = %task.id,
                        error = %err,
                        backoff_ms,
                        "Abandon failed, retrying"
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(err) => {
                    tracing::warn!(
                        task_id = %task.id,
                        idempotency_key = %claim.key,
                        error = %err,
                        "Reservation left in place, next attempt reclaims it"
                    );
                    return;
                }
            }
        }
    }

    /// Write an end-of-attempt transition, retrying while the store is down.
    async fn commit(&self, write: Write, task: &QueuedTask) {
        let backend = self.shared.broker.backend();
        let mut attempt = 0u32;

        loop {
            let result = match write {
                Write::Complete => backend.complete(task).await,
                Write::Retry => backend.retry(task).await,
                Write::Fail => backend.fail(task).await,
                Write::Requeue => backend.requeue(task).await,
            };

            match result {
                Ok(()) => return,
                Err(err) if err.is_retryable() && attempt < COMMIT_ATTEMPTS => {
                    attempt += 1;
                    let backoff_ms = calculate_backoff(attempt, self.id as u64);
                    tracing::warn!(
                        task_id = %task.id,
                        write = ?write,
                        error = %err,
                        backoff_ms,
                        "Transition write failed, retrying"
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(AnvilError::TaskNotFound { .. }) => {
                    tracing::warn!(
                        task_id = %task.id,
                        write = ?write,
                        "Task is no longer active, transition dropped"
                    );
                    return;
                }
                Err(err) => {
                    tracing::error!(
                        task_id = %task.id,
                        write = ?write,
                        error = %err,
                        "Transition write failed, task left active"
                    );
                    return;
                }
            }
        }
    }
}

/// Manages the worker pool
#[derive(Clone)]
pub struct WorkerManager {
    shared: Arc<WorkerShared>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// How the pool wound down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that finished within the grace period
    pub drained: usize,
    /// Workers stopped by the hard cancel
    pub interrupted: usize,
    /// Workers aborted after the hard cancel did not stop them
    pub aborted: usize,
}

impl WorkerManager {
    pub(crate) fn new(shared: Arc<WorkerShared>) -> Self {
        Self {
            shared,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn a new worker
    pub async fn spawn_worker(
        &self,
        worker_id: usize,
        shutdown: CancellationToken,
        hard: CancellationToken,
    ) {
        let shared = Arc::clone(&self.shared);
        shared.counters.total.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(async move {
            shared.counters.active.fetch_add(1, Ordering::Relaxed);
            let worker = Worker::new(worker_id, shared.clone());
            worker.run(shutdown, hard).await;
            shared.counters.active.fetch_sub(1, Ordering::Relaxed);
        });

        self.handles.lock().await.push(handle);
        tracing::debug!(worker_id, "Spawned worker");
    }

    /// Get current worker statistics
    pub fn stats(&self) -> WorkerStats {
        self.shared.counters.snapshot()
    }

    /// Get the number of active workers
    pub fn active_worker_count(&self) -> usize {
        self.shared.counters.active.load(Ordering::Relaxed)
    }

    /// Wait for workers to stop after their shutdown token fired.
    ///
    /// Workers get `grace` to finish their current task. Stragglers are then
    /// hard-cancelled, which requeues their tasks, and anything still running
    /// after that is aborted.
    pub async fn shutdown(&self, grace: Duration, hard: &CancellationToken) -> ShutdownReport {
        let mut handles = std::mem::take(&mut *self.handles.lock().await);
        let total = handles.len();
        if total == 0 {
            return ShutdownReport::default();
        }

        tracing::info!(workers = total, grace_ms = grace.as_millis() as u64, "Draining workers");
        join_within(&mut handles, grace).await;
        let drained = total - handles.len();

        let mut interrupted = 0;
        if !handles.is_empty() {
            tracing::warn!(workers = handles.len(), "Grace period elapsed, interrupting tasks");
            hard.cancel();
            let stragglers = handles.len();
            join_within(&mut handles, HARD_STOP_GRACE).await;
            interrupted = stragglers - handles.len();
        }

        let aborted = handles.len();
        for handle in handles {
            handle.abort();
        }

        let report = ShutdownReport {
            drained,
            interrupted,
            aborted,
        };
        tracing::info!(?report, "Worker shutdown complete");
        report
    }
}

async fn join_within(handles: &mut Vec<JoinHandle<()>>, limit: Duration) {
    let joined = tokio::time::timeout(limit, futures::future::join_all(handles.iter_mut())).await;
    if let Ok(results) = joined {
        for err in results.into_iter().filter_map(Result::err) {
            tracing::error!(error = %err, "Worker task ended abnormally");
        }
    }
    handles.retain(|handle| !handle.is_finished());
}
