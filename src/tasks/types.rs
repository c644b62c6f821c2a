//! Task definitions for the scaffolder broker.
//!
//! This module defines the core types that flow between the broker, the
//! worker and observers:
//!
//! - `TaskSpec`: the template and resolved values a task was created with
//! - `Task`: the broker-owned task record
//! - `TaskEvent` / `EventBody`: the append-only per-task event log entries
//! - `StageRecord` / `TaskSnapshot`: point-in-time query results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::catalog::TemplateEntity;
use crate::error::{ErrorKind, StageExecutionError};

/// Lifecycle status of a task.
///
/// Transitions are `Open -> Processing -> {Completed, Failed}`; terminal
/// statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Dispatched and waiting for a worker.
    Open,
    /// Claimed by exactly one worker.
    Processing,
    /// Finished with a failure.
    Failed,
    /// Finished successfully.
    Completed,
}

impl TaskStatus {
    /// Returns whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Open => write!(f, "open"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// The initiating payload of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Resolved template definition.
    pub template: TemplateEntity,
    /// Values assumed to have passed the template's schema.
    pub values: Value,
}

impl TaskSpec {
    pub fn new(template: TemplateEntity, values: Value) -> Self {
        Self { template, values }
    }

    /// Name of the template this task materializes.
    pub fn template_name(&self) -> &str {
        &self.template.metadata.name
    }
}

/// A task record as owned by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identifier generated at dispatch.
    pub id: Uuid,
    /// Template and values the task was created with.
    pub spec: TaskSpec,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// When the task was dispatched.
    pub created_at: DateTime<Utc>,
    /// Highest appended event offset.
    pub last_offset: u64,
    /// Last heartbeat recorded by the worker holding the claim.
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: Uuid, spec: TaskSpec) -> Self {
        Self {
            id,
            spec,
            status: TaskStatus::Open,
            created_at: Utc::now(),
            last_offset: 0,
            last_heartbeat_at: None,
        }
    }

    /// Returns how long ago the task was dispatched.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Structured error attached to a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Error classification.
    pub name: ErrorKind,
    /// Stage the failure is attributed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Human readable message.
    pub message: String,
}

impl TaskFailure {
    pub fn new(name: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            name,
            stage: None,
            message: message.into(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

impl From<&StageExecutionError> for TaskFailure {
    fn from(err: &StageExecutionError) -> Self {
        TaskFailure::new(err.kind(), err.to_string()).with_stage(&err.stage)
    }
}

/// Payload of an event, tagged by event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "lowercase")]
pub enum EventBody {
    /// The task was created.
    Dispatch {
        template: String,
    },
    /// One unit of stage output.
    Log {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    /// The single terminal event of a task.
    Completion {
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TaskFailure>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
}

impl EventBody {
    pub fn log(message: impl Into<String>) -> Self {
        EventBody::Log {
            message: message.into(),
            stage: None,
        }
    }

    pub fn stage_log(stage: impl Into<String>, message: impl Into<String>) -> Self {
        EventBody::Log {
            message: message.into(),
            stage: Some(stage.into()),
        }
    }

    /// Returns the wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventBody::Dispatch { .. } => "dispatch",
            EventBody::Log { .. } => "log",
            EventBody::Completion { .. } => "completion",
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, EventBody::Completion { .. })
    }
}

/// An immutable entry in a task's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: Uuid,
    /// Strictly increasing, 1-based, per-task sequence number.
    pub offset: u64,
    #[serde(flatten)]
    pub body: EventBody,
    pub created_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn is_completion(&self) -> bool {
        self.body.is_completion()
    }
}

/// Status of a single pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Running => write!(f, "running"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Bookkeeping for one executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// The context delta the stage returned.
    #[serde(default)]
    pub output: Option<Value>,
    /// Log lines written while the stage ran.
    #[serde(default)]
    pub log: Vec<String>,
}

impl StageRecord {
    pub(crate) fn started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            output: None,
            log: Vec::new(),
        }
    }
}

/// A stage transition reported by the worker.
#[derive(Debug, Clone)]
pub enum StageUpdate {
    Started,
    Completed { output: Value },
    Failed,
}

/// Point-in-time view of a task for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub status: TaskStatus,
    pub template: String,
    pub values: Value,
    pub created_at: DateTime<Utc>,
    pub last_offset: u64,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
}

impl TaskSnapshot {
    /// Returns the record of the named stage, if it ran.
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Open.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn test_event_wire_format() {
        let event = TaskEvent {
            task_id: Uuid::nil(),
            offset: 3,
            body: EventBody::Completion {
                status: TaskStatus::Failed,
                error: Some(
                    TaskFailure::new(ErrorKind::StageExecution, "boom").with_stage("template"),
                ),
                output: None,
            },
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["type"], "completion");
        assert_eq!(value["offset"], 3);
        assert_eq!(value["body"]["status"], "failed");
        assert_eq!(value["body"]["error"]["name"], "StageExecutionError");
        assert_eq!(value["body"]["error"]["stage"], "template");
        assert!(value["body"].get("output").is_none());
    }

    #[test]
    fn test_log_event_type() {
        let body = EventBody::stage_log("prepare", "cloning");
        assert_eq!(body.event_type(), "log");
        assert!(!body.is_completion());

        let value = serde_json::to_value(&body).expect("body should serialize");
        assert_eq!(value, json!({"type": "log", "body": {"message": "cloning", "stage": "prepare"}}));
    }
}
