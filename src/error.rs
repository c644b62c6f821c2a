//! Error types for scaffolder operations.
//!
//! Defines error types for all major subsystems:
//! - Task broker and event store bookkeeping
//! - Values validation against a template's schema
//! - Template catalog lookup and parsing
//! - Pipeline collaborators (preparers, templaters, publishers)
//! - Stage execution
//! - Docker container management
//!
//! Every category maps onto one of the stable error kinds reported to
//! clients through [`ErrorKind`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::tasks::TaskStatus;

/// Stable, client-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown task or template.
    #[serde(rename = "NotFoundError")]
    NotFound,
    /// Caller-supplied values failed the template's schema.
    #[serde(rename = "ValidationError")]
    Validation,
    /// A pipeline stage failed.
    #[serde(rename = "StageExecutionError")]
    StageExecution,
    /// Operation is not allowed in the task's current status.
    #[serde(rename = "InvalidStateError")]
    InvalidState,
    /// A collaborator (container runtime, git host, ...) could not be reached.
    #[serde(rename = "ResourceUnavailableError")]
    ResourceUnavailable,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::StageExecution => "StageExecutionError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::ResourceUnavailable => "ResourceUnavailableError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by an event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("No event stream exists for task {0}")]
    StreamNotFound(Uuid),

    #[error("Event stream for task {0} already exists")]
    StreamExists(Uuid),
}

/// Errors that can occur during task broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Task {task_id} is {status}: {reason}")]
    InvalidState {
        task_id: Uuid,
        status: TaskStatus,
        reason: String,
    },

    #[error("Event store error: {0}")]
    EventStore(EventStoreError),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::TaskNotFound(_) => ErrorKind::NotFound,
            BrokerError::InvalidState { .. } => ErrorKind::InvalidState,
            BrokerError::EventStore(EventStoreError::StreamNotFound(_)) => ErrorKind::NotFound,
            BrokerError::EventStore(EventStoreError::StreamExists(_)) => ErrorKind::InvalidState,
        }
    }
}

impl From<EventStoreError> for BrokerError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::StreamNotFound(id) => BrokerError::TaskNotFound(id),
            other => BrokerError::EventStore(other),
        }
    }
}

/// A single schema violation found in submitted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueViolation {
    /// JSON pointer to the offending value (empty for the root).
    pub path: String,
    /// Human readable description of the violation.
    pub message: String,
}

impl fmt::Display for ValueViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() {
            "<root>"
        } else {
            self.path.as_str()
        };
        write!(f, "{} {}", path, self.message)
    }
}

/// Errors that can occur while validating submitted values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Values do not match the template schema: {}", join_violations(.0))]
    InvalidValues(Vec<ValueViolation>),

    #[error("Template schema is invalid: {0}")]
    InvalidSchema(String),

    #[error("Invalid storePath '{path}': {reason}")]
    InvalidStorePath { path: String, reason: String },
}

impl ValidationError {
    /// Returns the structured violations, if any.
    pub fn violations(&self) -> &[ValueViolation] {
        match self {
            ValidationError::InvalidValues(violations) => violations,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[ValueViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur during template catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Template '{0}' not found")]
    TemplateNotFound(String),

    #[error("Template '{0}' already exists in catalog")]
    DuplicateTemplate(String),

    #[error("Invalid template name '{0}': must be non-empty and contain only alphanumeric characters, hyphens, underscores and dots")]
    InvalidTemplateName(String),

    #[error("Invalid location for template '{template}': {reason}")]
    InvalidLocation { template: String, reason: String },

    #[error("Failed to parse template file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::TemplateNotFound(_) => ErrorKind::NotFound,
            CatalogError::Io(_) => ErrorKind::ResourceUnavailable,
            _ => ErrorKind::Validation,
        }
    }
}

/// Errors produced by pipeline collaborators (preparers, templaters, publishers).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("No {role} registered for '{key}'")]
    NoHandler { role: &'static str, key: String },

    #[error("Command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Missing context value '{0}'")]
    MissingContext(String),

    #[error("Template rendering failed for '{path}': {message}")]
    Render { path: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CollaboratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollaboratorError::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            CollaboratorError::Docker(DockerError::DaemonUnavailable(_)) => {
                ErrorKind::ResourceUnavailable
            }
            _ => ErrorKind::StageExecution,
        }
    }
}

impl From<tera::Error> for CollaboratorError {
    fn from(err: tera::Error) -> Self {
        CollaboratorError::Render {
            path: String::new(),
            message: render_chain(&err),
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            CollaboratorError::ResourceUnavailable(err.to_string())
        } else {
            CollaboratorError::Http(err.to_string())
        }
    }
}

/// Flattens a tera error and its sources into one line.
pub(crate) fn render_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// A pipeline stage failed; carries the failing stage's name and cause.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed: {cause}")]
pub struct StageExecutionError {
    pub stage: String,
    #[source]
    pub cause: CollaboratorError,
}

impl StageExecutionError {
    pub fn new(stage: impl Into<String>, cause: CollaboratorError) -> Self {
        Self {
            stage: stage.into(),
            cause,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.cause.kind() {
            ErrorKind::ResourceUnavailable => ErrorKind::ResourceUnavailable,
            _ => ErrorKind::StageExecution,
        }
    }
}

/// Errors surfaced by the Submit operation.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::Catalog(e) => e.kind(),
            SubmitError::Validation(_) => ErrorKind::Validation,
            SubmitError::Broker(e) => e.kind(),
        }
    }
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker image pull failed: {0}")]
    PullFailed(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Container exited with status {exit_code}")]
    NonZeroExit { exit_code: i64 },

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),
}
