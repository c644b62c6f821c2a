//! Task worker: claims open tasks and runs their stage pipeline.
//!
//! The worker is a single loop. It claims the oldest open task, asks its
//! [`PipelineFactory`] for the task's stages, runs them one after another
//! against an accumulating [`StageContext`] and finally appends the
//! completion event through the broker.
//!
//! # Features
//!
//! - Stage failures, timeouts and panics fail the task, never the loop
//! - Idle waits are bounded by the poll interval and woken by dispatches
//! - Graceful shutdown with a broadcast channel
//! - Worker statistics tracking

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BrokerError, CollaboratorError, StageExecutionError};
use crate::execution::DockerClient;
use crate::metrics::MetricsCollector;
use crate::pipeline::{PipelineFactory, ScaffolderConfig, Stage, StageContext, TaskLogger};

use super::broker::TaskBroker;
use super::types::{StageUpdate, Task, TaskFailure, TaskStatus};

/// Errors that can occur when stopping a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The worker loop itself panicked.
    #[error("Worker loop panicked: {0}")]
    Panicked(String),
}

/// Statistics about a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Whether a task is executing right now.
    pub active: bool,
    /// Tasks that finished with `completed`.
    pub tasks_completed: u64,
    /// Tasks that finished with `failed`.
    pub tasks_failed: u64,
    /// Average time from claim to completion.
    pub average_task_duration: Duration,
}

impl WorkerStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Counters shared between the worker loop and its handle.
#[derive(Default)]
struct SharedWorkerStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active: AtomicBool,
}

impl SharedWorkerStats {
    fn record(&self, status: TaskStatus, duration: Duration) {
        match status {
            TaskStatus::Completed => self.tasks_completed.fetch_add(1, Ordering::SeqCst),
            _ => self.tasks_failed.fetch_add(1, Ordering::SeqCst),
        };
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn snapshot(&self) -> WorkerStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        WorkerStats {
            active: self.active.load(Ordering::SeqCst),
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration: average,
        }
    }
}

/// Consumes open tasks from a broker and executes their pipelines.
pub struct TaskWorker {
    id: String,
    broker: Arc<dyn TaskBroker>,
    pipelines: Arc<dyn PipelineFactory>,
    config: ScaffolderConfig,
    docker: Option<Arc<DockerClient>>,
    stats: Arc<SharedWorkerStats>,
    metrics: MetricsCollector,
}

impl TaskWorker {
    pub fn new(
        broker: Arc<dyn TaskBroker>,
        pipelines: Arc<dyn PipelineFactory>,
        config: ScaffolderConfig,
    ) -> Self {
        Self {
            id: "worker-0".to_string(),
            broker,
            pipelines,
            config,
            docker: None,
            stats: Arc::new(SharedWorkerStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Container client handed to stages through their context.
    pub fn with_docker(mut self, docker: Arc<DockerClient>) -> Self {
        self.docker = Some(docker);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Spawns the worker loop.
    pub fn start(self) -> WorkerHandle {
        // one signal is all we ever send
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let id = self.id.clone();
        let stats = Arc::clone(&self.stats);
        let shutdown_timeout = self.config.shutdown_timeout;

        let join = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            id,
            shutdown_tx,
            join,
            stats,
            shutdown_timeout,
        }
    }

    /// Main worker loop.
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(worker_id = %self.id, "No open tasks");
                    tokio::select! {
                        _ = self.broker.wait_for_dispatch(self.config.poll_interval) => {}
                        _ = shutdown_rx.recv() => {
                            info!(worker_id = %self.id, "Worker received shutdown signal");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim task");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claims and fully processes at most one task.
    ///
    /// Returns `Ok(false)` when no task was open.
    pub async fn run_once(&self) -> Result<bool, BrokerError> {
        match self.broker.claim().await? {
            Some(task) => {
                self.process_task(task).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs one claimed task to its completion event.
    async fn process_task(&self, task: Task) {
        let task_id = task.id;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            template = %task.spec.template_name(),
            "Processing task"
        );

        self.stats.set_active(true);
        self.metrics.task_started();

        let logger = TaskLogger::new(Arc::clone(&self.broker), task_id);
        let mut ctx = StageContext::new(&task, logger, &self.config.working_directory)
            .with_docker(self.docker.clone());

        let (status, failure, output) = match self.execute(&task, &mut ctx).await {
            Ok(output) => (TaskStatus::Completed, None, output),
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    stage = %e.stage,
                    error = %e,
                    "Task failed"
                );
                (TaskStatus::Failed, Some(TaskFailure::from(&e)), None)
            }
        };

        // a task whose completion was rejected counts as failed
        let recorded = match self.broker.complete(task_id, status, failure, output).await {
            Ok(_) => status,
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %e,
                    "Failed to append completion event"
                );
                TaskStatus::Failed
            }
        };
        // scratch directories go away with the context
        drop(ctx);

        let duration = start_time.elapsed();
        self.stats.set_active(false);
        self.stats.record(recorded, duration);
        self.metrics.task_finished(&recorded.to_string(), duration);

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            status = %recorded,
            duration_ms = duration.as_millis(),
            "Task finished"
        );
    }

    /// Runs every stage in order; stops at the first failure.
    ///
    /// Returns the last stage's output on success.
    async fn execute(
        &self,
        task: &Task,
        ctx: &mut StageContext,
    ) -> Result<Option<Value>, StageExecutionError> {
        let stages = match self.pipelines.build(task).await {
            Ok(stages) => stages,
            Err(e) => {
                self.update_stage(task.id, &e.stage, StageUpdate::Started).await;
                ctx.enter_stage(&e.stage);
                ctx.logger().info(format!("Stage {} failed: {}", e.stage, e.cause)).await;
                self.update_stage(task.id, &e.stage, StageUpdate::Failed).await;
                return Err(e);
            }
        };

        let mut last_output = None;
        for stage in stages.iter() {
            let name = stage.name().to_string();

            if let Err(e) = self.broker.heartbeat(task.id).await {
                warn!(task_id = %task.id, error = %e, "Heartbeat failed");
            }
            self.update_stage(task.id, &name, StageUpdate::Started).await;
            ctx.enter_stage(&name);
            ctx.logger().info(format!("Beginning stage {name}")).await;

            let started = Instant::now();
            let result = self.run_stage(stage.as_ref(), ctx).await;
            let elapsed = started.elapsed();

            match result {
                Ok(delta) => {
                    self.metrics.record_stage(&name, "completed", elapsed);
                    ctx.logger().info(format!("Finished stage {name}")).await;

                    let output = Value::Object(delta.clone());
                    self.update_stage(
                        task.id,
                        &name,
                        StageUpdate::Completed {
                            output: output.clone(),
                        },
                    )
                    .await;
                    ctx.merge(delta);
                    last_output = Some(output);
                }
                Err(cause) => {
                    self.metrics.record_stage(&name, "failed", elapsed);
                    ctx.logger().info(format!("Stage {name} failed: {cause}")).await;
                    self.update_stage(task.id, &name, StageUpdate::Failed).await;
                    return Err(StageExecutionError::new(name, cause));
                }
            }
        }

        Ok(last_output)
    }

    /// Executes one stage under the stage timeout, catching panics.
    async fn run_stage(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
    ) -> Result<crate::pipeline::ContextDelta, CollaboratorError> {
        let execution = AssertUnwindSafe(stage.execute(ctx)).catch_unwind();

        let outcome = match self.config.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(CollaboratorError::Timeout(limit)),
            },
            None => execution.await,
        };

        outcome.unwrap_or_else(|panic| Err(CollaboratorError::Panicked(panic_message(&panic))))
    }

    async fn update_stage(&self, task_id: Uuid, stage: &str, update: StageUpdate) {
        if let Err(e) = self.broker.update_stage(task_id, stage, update).await {
            error!(task_id = %task_id, stage = %stage, error = %e, "Failed to record stage update");
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a running worker loop.
pub struct WorkerHandle {
    id: String,
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<SharedWorkerStats>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stops the loop after the in-flight task, if any, has completed.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ShutdownTimeout` if the loop does not stop
    /// within the configured shutdown timeout.
    pub async fn shutdown(self) -> Result<WorkerStats, WorkerError> {
        info!(worker_id = %self.id, "Initiating worker shutdown");

        // the loop may already have stopped
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.shutdown_timeout, self.join).await {
            Ok(Ok(())) => {
                info!(worker_id = %self.id, "Worker shutdown complete");
                Ok(self.stats.snapshot())
            }
            Ok(Err(e)) => Err(WorkerError::Panicked(e.to_string())),
            Err(_) => Err(WorkerError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }
}
