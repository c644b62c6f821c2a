//! scaffolder: template-driven project creation as observable tasks.
//!
//! A submitted template and set of values becomes a task. A worker claims
//! it and runs the prepare, template and publish stages while every step is
//! appended to the task's event log, which clients can replay and follow.

pub mod catalog;
pub mod cli;
pub mod collaborators;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod pipeline;
pub mod service;
pub mod tasks;
pub mod validation;

// Re-export commonly used types
pub use error::{
    BrokerError, CatalogError, CollaboratorError, DockerError, ErrorKind, StageExecutionError,
    SubmitError, ValidationError,
};
pub use service::Scaffolder;
