//! Scaffolder task core: broker, event log, registry and worker.
//!
//! # Architecture
//!
//! - **EventStore**: append-only per-task event log with 1-based offsets
//! - **TaskBroker**: task lifecycle (dispatch, claim, complete) and event
//!   fan-out to observers
//! - **TaskRegistry**: point-in-time status and stage results for polling
//!   clients
//! - **TaskWorker**: single consumer loop that runs each claimed task's
//!   stage pipeline
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scaffolder::tasks::{MemoryTaskBroker, TaskBroker, TaskSpec, TaskWorker};
//!
//! let broker = Arc::new(MemoryTaskBroker::new());
//! let worker = TaskWorker::new(broker.clone(), pipeline, config).start();
//!
//! let task_id = broker.dispatch(TaskSpec::new(template, values)).await?;
//! let mut events = broker.subscribe(task_id, None).await?;
//! while let Some(event) = events.next_event().await {
//!     println!("{} {}", event.offset, event.body.event_type());
//! }
//! ```

pub mod broker;
pub mod event_store;
pub mod registry;
pub mod subscription;
pub mod types;
pub mod worker;

pub use broker::{MemoryTaskBroker, TaskBroker};
pub use event_store::{EventStore, MemoryEventStore};
pub use registry::{RegistryStats, TaskRegistry, TaskSummary};
pub use subscription::{EventCallback, EventStream, ObservedEvents, Subscription};
pub use types::{
    EventBody, StageRecord, StageStatus, StageUpdate, Task, TaskEvent, TaskFailure, TaskSnapshot,
    TaskSpec, TaskStatus,
};
pub use worker::{TaskWorker, WorkerError, WorkerHandle, WorkerStats};
