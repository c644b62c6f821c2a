//! Metrics module for Prometheus-based monitoring.
//!
//! Collects task, stage and subscription metrics for the scaffolder.
//!
//! # Example
//!
//! ```ignore
//! use scaffolder::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_SUBSCRIPTIONS, OPEN_TASKS, REGISTRY, STAGE_DURATION, TASKS_DISPATCHED,
    TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};
