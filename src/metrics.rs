//! Prometheus metrics for the worker pool and queues.

use crate::error::{AnvilError, AnvilResult};
use crate::queue::QueueCounts;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

fn metrics_error(err: prometheus::Error) -> AnvilError {
    AnvilError::config(format!("Failed to register metrics: {}", err))
}

/// Prometheus metrics for anvilq
#[derive(Clone)]
pub struct AnvilMetrics {
    /// Registry holding every anvilq collector
    pub registry: Registry,

    /// Handler outcomes by queue and status
    pub processed_total: IntCounterVec,

    /// Handler duration by queue and task type
    pub task_duration: HistogramVec,

    /// Queue depth by queue and state
    pub queue_depth: IntGaugeVec,

    /// Workers currently running a handler
    pub workers_busy: IntGauge,
}

impl std::fmt::Debug for AnvilMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnvilMetrics").finish_non_exhaustive()
    }
}

impl AnvilMetrics {
    /// Create metrics in a fresh registry.
    pub fn new() -> AnvilResult<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the collectors in an existing registry.
    pub fn with_registry(registry: Registry) -> AnvilResult<Self> {
        let processed_total = IntCounterVec::new(
            Opts::new("anvilq_processed_total", "Processed tasks by queue and status"),
            &["queue", "status"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(processed_total.clone()))
            .map_err(metrics_error)?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "anvilq_task_duration_seconds",
                "Handler duration in seconds",
            ),
            &["queue", "task_type"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(task_duration.clone()))
            .map_err(metrics_error)?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("anvilq_queue_depth", "Tasks per queue and state"),
            &["queue", "state"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metrics_error)?;

        let workers_busy = IntGauge::new("anvilq_workers_busy", "Workers running a handler")
            .map_err(metrics_error)?;
        registry
            .register(Box::new(workers_busy.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            processed_total,
            task_duration,
            queue_depth,
            workers_busy,
        })
    }

    /// Count one handler outcome.
    pub fn inc_processed(&self, queue: &str, status: &str) {
        self.processed_total
            .with_label_values(&[queue, status])
            .inc();
    }

    /// Record handler duration
    pub fn observe_duration(&self, queue: &str, task_type: &str, duration_secs: f64) {
        self.task_duration
            .with_label_values(&[queue, task_type])
            .observe(duration_secs);
    }

    /// Refresh the depth gauges of one queue.
    pub fn update_queue_depth(&self, queue: &str, counts: &QueueCounts) {
        for (state, value) in [
            ("pending", counts.pending),
            ("scheduled", counts.scheduled),
            ("active", counts.active),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            self.queue_depth
                .with_label_values(&[queue, state])
                .set(value as i64);
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> AnvilResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| AnvilError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = AnvilMetrics::new().unwrap();
        metrics.inc_processed("default", "succeeded");
        metrics.observe_duration("default", "mail:send", 0.25);
        metrics.update_queue_depth(
            "default",
            &QueueCounts {
                pending: 4,
                failed: 1,
                ..Default::default()
            },
        );

        let text = metrics.render().unwrap();
        assert!(text.contains("anvilq_processed_total"));
        assert!(text.contains("anvilq_task_duration_seconds"));
        assert!(text.contains("anvilq_queue_depth{queue=\"default\",state=\"pending\"} 4"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        AnvilMetrics::with_registry(registry.clone()).unwrap();
        assert!(AnvilMetrics::with_registry(registry).is_err());
    }
}
