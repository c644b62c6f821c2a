//! High-level metric recording for the broker, worker and subscriptions.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library users that do not export metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_SUBSCRIPTIONS, OPEN_TASKS, STAGE_DURATION, TASKS_DISPATCHED, TASKS_IN_PROGRESS,
    TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording scaffolder operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a dispatched task and the resulting queue depth.
    pub fn record_dispatch(&self, open_tasks: usize) {
        if let Some(counter) = TASKS_DISPATCHED.get() {
            counter.inc();
        }
        self.set_open_tasks(open_tasks);
    }

    pub fn set_open_tasks(&self, open_tasks: usize) {
        if let Some(gauge) = OPEN_TASKS.get() {
            gauge.set(open_tasks as f64);
        }
    }

    /// Record that a worker started executing a task.
    pub fn task_started(&self) {
        if let Some(gauge) = TASKS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Record a finished task.
    ///
    /// # Arguments
    ///
    /// * `status` - Final task status (e.g., "completed", "failed")
    /// * `duration` - Time from claim to completion
    pub fn task_finished(&self, status: &str, duration: Duration) {
        if let Some(gauge) = TASKS_IN_PROGRESS.get() {
            gauge.dec();
        }
        if let Some(counter) = TASKS_TOTAL.get() {
            counter.with_label_values(&[status]).inc();
        }
        if let Some(histogram) = TASK_DURATION.get() {
            histogram.observe(duration.as_secs_f64());
        }
    }

    /// Record one stage execution.
    pub fn record_stage(&self, stage: &str, status: &str, duration: Duration) {
        if let Some(histogram) = STAGE_DURATION.get() {
            histogram
                .with_label_values(&[stage, status])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn subscription_opened(&self) {
        if let Some(gauge) = ACTIVE_SUBSCRIPTIONS.get() {
            gauge.inc();
        }
    }

    pub fn subscription_closed(&self) {
        if let Some(gauge) = ACTIVE_SUBSCRIPTIONS.get() {
            gauge.dec();
        }
    }
}
