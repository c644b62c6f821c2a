//! Per-task stage context and the task log sink.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::TemplateEntity;
use crate::error::CollaboratorError;
use crate::execution::DockerClient;
use crate::tasks::{EventBody, Task, TaskBroker};

/// Partial context update returned by a stage.
pub type ContextDelta = Map<String, Value>;

/// Writes task log lines as `log` events through the broker.
///
/// Every line is mirrored to `tracing`. Broker failures are logged and
/// swallowed: losing a log line must not fail the stage that wrote it.
#[derive(Clone)]
pub struct TaskLogger {
    broker: Arc<dyn TaskBroker>,
    task_id: Uuid,
    stage: Option<String>,
}

impl TaskLogger {
    pub fn new(broker: Arc<dyn TaskBroker>, task_id: Uuid) -> Self {
        Self {
            broker,
            task_id,
            stage: None,
        }
    }

    /// Returns a logger that tags its lines with `stage`.
    pub fn for_stage(&self, stage: impl Into<String>) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            task_id: self.task_id,
            stage: Some(stage.into()),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    /// Appends one log line to the task's event stream.
    pub async fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(
            task_id = %self.task_id,
            stage = self.stage.as_deref().unwrap_or("-"),
            "{}",
            message
        );

        let body = match &self.stage {
            Some(stage) => EventBody::stage_log(stage.clone(), message),
            None => EventBody::log(message),
        };
        if let Err(e) = self.broker.emit_log(self.task_id, body).await {
            warn!(task_id = %self.task_id, error = %e, "Failed to append task log line");
        }
    }

    /// Appends every non-empty line of `output`.
    pub async fn lines(&self, output: &str) {
        for line in output.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            self.info(line).await;
        }
    }
}

impl std::fmt::Debug for TaskLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLogger")
            .field("task_id", &self.task_id)
            .field("stage", &self.stage)
            .finish()
    }
}

/// Scratch directories owned by one task execution.
///
/// Directories are deleted when the last clone of the owning context is
/// dropped, which the worker does once the task is terminal.
#[derive(Debug, Default)]
struct ScratchSpace {
    dirs: Mutex<Vec<TempDir>>,
}

/// Accumulated state of one task execution, handed to every stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    task_id: Uuid,
    template: TemplateEntity,
    values: Value,
    outputs: ContextDelta,
    logger: TaskLogger,
    working_directory: PathBuf,
    docker: Option<Arc<DockerClient>>,
    scratch: Arc<ScratchSpace>,
}

impl StageContext {
    /// Builds the initial context from a claimed task.
    pub fn new(task: &Task, logger: TaskLogger, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task.id,
            template: task.spec.template.clone(),
            values: task.spec.values.clone(),
            outputs: ContextDelta::new(),
            logger,
            working_directory: working_directory.into(),
            docker: None,
            scratch: Arc::new(ScratchSpace::default()),
        }
    }

    pub fn with_docker(mut self, docker: Option<Arc<DockerClient>>) -> Self {
        self.docker = docker;
        self
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn template(&self) -> &TemplateEntity {
        &self.template
    }

    /// Values the task was submitted with.
    pub fn values(&self) -> &Value {
        &self.values
    }

    /// Outputs merged from the stages that already ran.
    pub fn outputs(&self) -> &ContextDelta {
        &self.outputs
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// Reads a string output, failing with `MissingContext` when absent.
    pub fn require_str(&self, key: &str) -> Result<&str, CollaboratorError> {
        self.outputs
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| CollaboratorError::MissingContext(key.to_string()))
    }

    /// Reads a path output written by an earlier stage.
    pub fn require_path(&self, key: &str) -> Result<PathBuf, CollaboratorError> {
        self.require_str(key).map(PathBuf::from)
    }

    pub fn logger(&self) -> &TaskLogger {
        &self.logger
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Container client, or `ResourceUnavailable` when none was configured.
    pub fn docker(&self) -> Result<&Arc<DockerClient>, CollaboratorError> {
        self.docker.as_ref().ok_or_else(|| {
            CollaboratorError::ResourceUnavailable("no Docker client configured".to_string())
        })
    }

    /// Creates a directory under the working directory that lives as long
    /// as this task execution.
    pub fn scratch_dir(&self, prefix: &str) -> Result<PathBuf, CollaboratorError> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.working_directory)?;
        let path = dir.path().to_path_buf();
        self.scratch
            .dirs
            .lock()
            .expect("scratch lock poisoned")
            .push(dir);
        Ok(path)
    }

    /// Number of scratch directories created so far.
    pub fn scratch_count(&self) -> usize {
        self.scratch.dirs.lock().expect("scratch lock poisoned").len()
    }

    pub(crate) fn enter_stage(&mut self, stage: &str) {
        self.logger = self.logger.for_stage(stage);
    }

    /// Commits a stage's output; later keys overwrite earlier ones.
    pub(crate) fn merge(&mut self, delta: ContextDelta) {
        self.outputs.extend(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{MemoryTaskBroker, TaskSpec};
    use serde_json::json;

    async fn claimed_task(broker: &MemoryTaskBroker) -> Task {
        broker
            .dispatch(TaskSpec::new(
                TemplateEntity::new("ctx", "tera"),
                json!({"component_id": "foo"}),
            ))
            .await
            .unwrap();
        broker.claim().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_merge_and_require() {
        let broker = Arc::new(MemoryTaskBroker::new());
        let task = claimed_task(&broker).await;
        let logger = TaskLogger::new(broker.clone(), task.id);
        let mut ctx = StageContext::new(&task, logger, std::env::temp_dir());

        assert!(matches!(
            ctx.require_path("skeleton_dir"),
            Err(CollaboratorError::MissingContext(_))
        ));

        let mut delta = ContextDelta::new();
        delta.insert("skeleton_dir".to_string(), json!("/tmp/skeleton"));
        ctx.merge(delta);

        assert_eq!(ctx.require_path("skeleton_dir").unwrap(), PathBuf::from("/tmp/skeleton"));
        assert_eq!(ctx.values()["component_id"], "foo");
        assert!(ctx.docker().is_err());
    }

    #[tokio::test]
    async fn test_logger_appends_stage_tagged_events() {
        let broker = Arc::new(MemoryTaskBroker::new());
        let task = claimed_task(&broker).await;
        let logger = TaskLogger::new(broker.clone(), task.id).for_stage("prepare");

        logger.lines("first\n\nsecond\n").await;

        let events = broker.events(task.id, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].body,
            EventBody::stage_log("prepare", "first")
        );
    }

    #[tokio::test]
    async fn test_scratch_dirs_removed_with_context() {
        let broker = Arc::new(MemoryTaskBroker::new());
        let task = claimed_task(&broker).await;
        let work = tempfile::tempdir().unwrap();
        let ctx = StageContext::new(&task, TaskLogger::new(broker, task.id), work.path());

        let scratch = ctx.scratch_dir("skeleton-").unwrap();
        assert!(scratch.starts_with(work.path()));
        assert!(scratch.is_dir());
        assert_eq!(ctx.scratch_count(), 1);

        drop(ctx);
        assert!(!scratch.exists());
    }
}
