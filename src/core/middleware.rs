//! Ordered middleware around task handlers.
//!
//! The default chain, outermost first, is panic recovery, trace span,
//! metrics timer (feature `metrics`) and structured log.

use crate::core::handler::{TaskContext, TaskHandler};
use crate::error::HandlerError;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

#[cfg(feature = "metrics")]
use crate::metrics::AnvilMetrics;

/// Decorates a handler with cross-cutting behaviour.
pub trait Middleware: Send + Sync {
    /// Wrap `next`, returning the decorated handler.
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler>;
}

/// Ordered list of middleware; the first entry is the outermost layer.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer inside the existing ones.
    pub fn layer<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain has no layers
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wrap `handler` in every layer.
    pub fn apply(&self, handler: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        self.layers
            .iter()
            .rev()
            .fold(handler, |inner, layer| layer.wrap(inner))
    }
}

/// Converts a handler panic into a [`HandlerError`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Recover;

struct RecoverHandler {
    next: Arc<dyn TaskHandler>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Middleware for Recover {
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        Arc::new(RecoverHandler { next })
    }
}

#[async_trait]
impl TaskHandler for RecoverHandler {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.next.handle(ctx, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    task_id = ctx.task_id(),
                    task_type = ctx.task_type(),
                    panic = %message,
                    backtrace = %Backtrace::force_capture(),
                    "Task handler panicked"
                );
                Err(HandlerError::panic(message))
            }
        }
    }
}

/// Runs the handler inside a `task` span carrying the task identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tracing;

struct TracingHandler {
    next: Arc<dyn TaskHandler>,
}

impl Middleware for Tracing {
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        Arc::new(TracingHandler { next })
    }
}

#[async_trait]
impl TaskHandler for TracingHandler {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        let span = tracing::info_span!(
            "task",
            task_id = ctx.task_id(),
            task_type = ctx.task_type(),
            queue = ctx.queue(),
            retry = ctx.retry_count(),
        );
        self.next.handle(ctx, payload).instrument(span).await
    }
}

/// Records duration and outcome in [`AnvilMetrics`].
#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
#[derive(Clone)]
pub struct Metrics {
    metrics: Arc<AnvilMetrics>,
}

#[cfg(feature = "metrics")]
impl Metrics {
    /// Record into `metrics`.
    pub fn new(metrics: Arc<AnvilMetrics>) -> Self {
        Self { metrics }
    }
}

#[cfg(feature = "metrics")]
struct MetricsHandler {
    next: Arc<dyn TaskHandler>,
    metrics: Arc<AnvilMetrics>,
}

#[cfg(feature = "metrics")]
impl Middleware for Metrics {
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        Arc::new(MetricsHandler {
            next,
            metrics: self.metrics.clone(),
        })
    }
}

/// Busy-gauge slot for one attempt.
///
/// Dropped without [`Attempt::finish`] means the worker gave up on the future,
/// at its deadline (`timeout`) or on a hard stop (`interrupted`).
#[cfg(feature = "metrics")]
struct Attempt<'a> {
    metrics: &'a AnvilMetrics,
    ctx: &'a TaskContext,
    started: Instant,
    finished: bool,
}

#[cfg(feature = "metrics")]
impl<'a> Attempt<'a> {
    fn start(metrics: &'a AnvilMetrics, ctx: &'a TaskContext) -> Self {
        metrics.workers_busy.inc();
        Self {
            metrics,
            ctx,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, status: &str) {
        self.record(status);
        self.finished = true;
    }

    fn record(&self, status: &str) {
        self.metrics.observe_duration(
            self.ctx.queue(),
            self.ctx.task_type(),
            self.started.elapsed().as_secs_f64(),
        );
        self.metrics.inc_processed(self.ctx.queue(), status);
    }
}

#[cfg(feature = "metrics")]
impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        self.metrics.workers_busy.dec();
        if !self.finished {
            let expired = self
                .ctx
                .deadline()
                .is_some_and(|deadline| Instant::now() >= deadline);
            self.record(if expired { "timeout" } else { "interrupted" });
        }
    }
}

#[cfg(feature = "metrics")]
#[async_trait]
impl TaskHandler for MetricsHandler {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        let attempt = Attempt::start(&self.metrics, ctx);
        let result = self.next.handle(ctx, payload).await;

        attempt.finish(match &result {
            Ok(()) => "succeeded",
            Err(err) => err.kind().as_str(),
        });
        result
    }
}

/// Structured start/finish log lines per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct Logging;

struct LoggingHandler {
    next: Arc<dyn TaskHandler>,
}

impl Middleware for Logging {
    fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
        Arc::new(LoggingHandler { next })
    }
}

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
        tracing::debug!(payload_bytes = payload.len(), "Task started");
        let started = Instant::now();
        let result = self.next.handle(ctx, payload).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => tracing::info!(elapsed_ms, "Task succeeded"),
            Err(err) => tracing::warn!(
                elapsed_ms,
                kind = err.kind().as_str(),
                error = %err,
                "Task attempt failed"
            ),
        }
        result
    }
}

/// Recover, Tracing, Metrics (when given) and Logging, in that order.
pub fn default_chain(#[cfg(feature = "metrics")] metrics: Option<Arc<AnvilMetrics>>) -> MiddlewareChain {
    let chain = MiddlewareChain::new().layer(Recover).layer(Tracing);
    #[cfg(feature = "metrics")]
    let chain = match metrics {
        Some(metrics) => chain.layer(Metrics::new(metrics)),
        None => chain,
    };
    chain.layer(Logging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handler::handler_fn;
    use crate::error::FailureKind;
    use crate::task::QueuedTask;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> TaskContext {
        let task = QueuedTask::new("test:task", vec![], "default", 3);
        TaskContext::new(&task, None, CancellationToken::new())
    }

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    struct TagHandler {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        next: Arc<dyn TaskHandler>,
    }

    impl Middleware for Tag {
        fn wrap(&self, next: Arc<dyn TaskHandler>) -> Arc<dyn TaskHandler> {
            Arc::new(TagHandler {
                name: self.name,
                log: self.log.clone(),
                next,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for TagHandler {
        async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(self.name);
            self.next.handle(ctx, payload).await
        }
    }

    #[tokio::test]
    async fn test_chain_order_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .layer(Tag { name: "outer", log: log.clone() })
            .layer(Tag { name: "inner", log: log.clone() });
        assert_eq!(chain.len(), 2);

        let handler = chain.apply(Arc::new(handler_fn(|_ctx, _payload| async { Ok(()) })));
        handler.handle(&ctx(), b"").await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn test_recover_converts_panic() {
        let handler = MiddlewareChain::new().layer(Recover).apply(Arc::new(handler_fn(
            |_ctx, _payload| async {
                let items: Vec<u32> = Vec::new();
                if items.is_empty() {
                    panic!("no items to process");
                }
                Ok(())
            },
        )));

        let err = handler.handle(&ctx(), b"").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Panic);
        assert!(err.message().contains("no items to process"));
    }

    #[tokio::test]
    async fn test_default_chain_passes_errors_through() {
        #[cfg(feature = "metrics")]
        let chain = default_chain(None);
        #[cfg(not(feature = "metrics"))]
        let chain = default_chain();

        let handler = chain.apply(Arc::new(handler_fn(|_ctx, _payload| async {
            Err(HandlerError::transient("upstream 503"))
        })));
        let err = handler.handle(&ctx(), b"{}").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_metrics_settle_abandoned_attempts() {
        use std::time::Duration;

        let metrics = Arc::new(AnvilMetrics::new().unwrap());
        let handler = MiddlewareChain::new()
            .layer(Metrics::new(metrics.clone()))
            .apply(Arc::new(handler_fn(|ctx, _payload| async move {
                ctx.cancelled().await;
                Ok(())
            })));
        let task = QueuedTask::new("report:build", vec![], "default", 3);
        let processed = |status: &str| {
            metrics
                .processed_total
                .with_label_values(&["default", status])
                .get()
        };

        // Dropped at its deadline
        let limit = Duration::from_millis(50);
        let ctx = TaskContext::new(&task, Some(Instant::now() + limit), CancellationToken::new());
        assert!(tokio::time::timeout(limit, handler.handle(&ctx, b"")).await.is_err());
        assert_eq!(metrics.workers_busy.get(), 0);
        assert_eq!(processed("timeout"), 1);

        // Dropped before any deadline, as on a hard stop
        let ctx = TaskContext::new(&task, None, CancellationToken::new());
        let attempt = handler.handle(&ctx, b"");
        assert!(tokio::time::timeout(Duration::from_millis(20), attempt).await.is_err());
        assert_eq!(metrics.workers_busy.get(), 0);
        assert_eq!(processed("interrupted"), 1);
        assert_eq!(processed("succeeded"), 0);
    }
}
