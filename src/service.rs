//! Client-facing scaffolder operations: Submit, Query and Subscribe.
//!
//! [`Scaffolder`] wires a template resolver and a values validator in front
//! of a task broker. Validation happens before a task exists, so a rejected
//! submission never produces a task or an event.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{TemplateEntity, TemplateResolver};
use crate::error::{BrokerError, CatalogError, SubmitError};
use crate::execution::DockerClient;
use crate::pipeline::{PipelineFactory, ScaffolderConfig};
use crate::tasks::{
    EventCallback, EventStream, MemoryTaskBroker, Subscription, TaskBroker, TaskRegistry,
    TaskSnapshot, TaskSpec, TaskSummary, TaskWorker, WorkerHandle,
};
use crate::validation::{augment_values, JsonSchemaValidator, ValuesValidator};

/// Facade over the broker, the template catalog and the values validator.
#[derive(Clone)]
pub struct Scaffolder {
    broker: Arc<dyn TaskBroker>,
    registry: Option<Arc<TaskRegistry>>,
    resolver: Arc<dyn TemplateResolver>,
    validator: Arc<dyn ValuesValidator>,
}

impl Scaffolder {
    /// Uses an in-memory broker and JSON Schema validation.
    pub fn in_memory(resolver: Arc<dyn TemplateResolver>) -> Self {
        let broker = Arc::new(MemoryTaskBroker::new());
        let registry = Arc::clone(broker.registry());
        Self {
            broker,
            registry: Some(registry),
            resolver,
            validator: Arc::new(JsonSchemaValidator::new()),
        }
    }

    /// Uses an externally provided broker. Listing tasks is unavailable
    /// unless a registry is attached with [`Scaffolder::with_registry`].
    pub fn new(broker: Arc<dyn TaskBroker>, resolver: Arc<dyn TemplateResolver>) -> Self {
        Self {
            broker,
            registry: None,
            resolver,
            validator: Arc::new(JsonSchemaValidator::new()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ValuesValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn broker(&self) -> &Arc<dyn TaskBroker> {
        &self.broker
    }

    /// Resolves, validates and dispatches; returns the new task id.
    ///
    /// # Errors
    ///
    /// `SubmitError::Catalog` for unknown templates, `SubmitError::Validation`
    /// when the values do not satisfy the template schema.
    pub async fn submit(&self, template_name: &str, values: Value) -> Result<Uuid, SubmitError> {
        let template = self.resolver.find_template(template_name).await?;
        let values = self.check_values(&template, values)?;

        let task_id = self.broker.dispatch(TaskSpec::new(template, values)).await?;
        info!(task_id = %task_id, template = %template_name, "Task submitted");
        Ok(task_id)
    }

    /// Runs the submit-time checks without creating a task.
    pub async fn validate(&self, template_name: &str, values: Value) -> Result<Value, SubmitError> {
        let template = self.resolver.find_template(template_name).await?;
        self.check_values(&template, values)
    }

    fn check_values(&self, template: &TemplateEntity, values: Value) -> Result<Value, SubmitError> {
        let values = augment_values(values)?;
        self.validator.validate(&values, &template.spec.schema)?;
        debug!(template = %template.name(), "Values passed validation");
        Ok(values)
    }

    /// Current status, stage results and error of a task.
    pub async fn query(&self, task_id: Uuid) -> Result<TaskSnapshot, BrokerError> {
        self.broker.get(task_id).await
    }

    /// Live stream of a task's events after `after` (all events for `None`).
    pub async fn subscribe(
        &self,
        task_id: Uuid,
        after: Option<u64>,
    ) -> Result<EventStream, BrokerError> {
        self.broker.subscribe(task_id, after).await
    }

    /// Callback flavour of [`Scaffolder::subscribe`].
    pub async fn observe(
        &self,
        task_id: Uuid,
        after: Option<u64>,
        on_events: EventCallback,
    ) -> Result<Subscription, BrokerError> {
        self.broker.observe(task_id, after, on_events).await
    }

    /// Every known task, oldest first.
    pub fn list(&self) -> Vec<TaskSummary> {
        self.registry
            .as_ref()
            .map(|registry| registry.list())
            .unwrap_or_default()
    }

    pub async fn templates(&self) -> Result<Vec<TemplateEntity>, CatalogError> {
        self.resolver.list_templates().await
    }

    /// Starts a worker consuming this scaffolder's broker.
    pub fn start_worker(
        &self,
        pipelines: Arc<dyn PipelineFactory>,
        config: ScaffolderConfig,
        docker: Option<Arc<DockerClient>>,
    ) -> WorkerHandle {
        let mut worker = TaskWorker::new(Arc::clone(&self.broker), pipelines, config);
        if let Some(docker) = docker {
            worker = worker.with_docker(docker);
        }
        worker.start()
    }
}
