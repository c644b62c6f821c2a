//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the scaffolder and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all scaffolder metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of tasks dispatched.
pub static TASKS_DISPATCHED: OnceLock<Counter> = OnceLock::new();

/// Total number of finished tasks, labeled by final status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, from claim to completion.
pub static TASK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage and status.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks currently being processed.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of tasks waiting to be claimed.
pub static OPEN_TASKS: OnceLock<Gauge> = OnceLock::new();

/// Number of live event subscriptions.
pub static ACTIVE_SUBSCRIPTIONS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again is harmless: the first registration wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_dispatched = Counter::new(
        "scaffolder_tasks_dispatched_total",
        "Total number of tasks dispatched",
    )?;

    let tasks_total = CounterVec::new(
        Opts::new("scaffolder_tasks_total", "Total number of finished tasks"),
        &["status"],
    )?;

    let task_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "scaffolder_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "scaffolder_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["stage", "status"],
    )?;

    let tasks_in_progress = Gauge::new(
        "scaffolder_tasks_in_progress",
        "Number of tasks currently being processed",
    )?;

    let open_tasks = Gauge::new("scaffolder_open_tasks", "Number of tasks waiting to be claimed")?;

    let active_subscriptions = Gauge::new(
        "scaffolder_active_subscriptions",
        "Number of live event subscriptions",
    )?;

    registry.register(Box::new(tasks_dispatched.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(open_tasks.clone()))?;
    registry.register(Box::new(active_subscriptions.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_DISPATCHED.set(tasks_dispatched);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = OPEN_TASKS.set(open_tasks);
    let _ = ACTIVE_SUBSCRIPTIONS.set(active_subscriptions);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}
