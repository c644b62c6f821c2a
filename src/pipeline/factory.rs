//! Per-task pipeline construction.
//!
//! A [`PipelineFactory`] turns a claimed task into the [`StageSet`] the worker
//! runs. [`ScaffolderPipeline`] is the standard prepare, template, publish
//! pipeline; it picks one preparer, templater and publisher from its
//! registries before any stage runs.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::catalog::{parse_location_annotation, LocationSpec, TemplateEntity};
use crate::collaborators::{
    path_value, GitDestination, Preparer, PreparerKey, Preparers, Publisher, PublisherKey,
    Publishers, Templater, TemplaterKind, Templaters,
};
use crate::error::{CollaboratorError, StageExecutionError};
use crate::tasks::Task;

use super::config::ScaffolderConfig;
use super::context::{ContextDelta, StageContext};
use super::stage::{Stage, StageSet};

pub const PREPARE_STAGE: &str = "prepare";
pub const TEMPLATE_STAGE: &str = "template";
pub const PUBLISH_STAGE: &str = "publish";

/// Context key written by the prepare stage.
pub const SKELETON_DIR_KEY: &str = "skeleton_dir";
/// Context key written by the template stage.
pub const RESULT_DIR_KEY: &str = "result_dir";

/// Builds the stages for one task.
///
/// A build error fails the task with the stage named in the error; no
/// stage runs.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn build(&self, task: &Task) -> Result<StageSet, StageExecutionError>;
}

#[async_trait]
impl<F> PipelineFactory for F
where
    F: Fn(&Task) -> Result<StageSet, StageExecutionError> + Send + Sync,
{
    async fn build(&self, task: &Task) -> Result<StageSet, StageExecutionError> {
        self(task)
    }
}

/// The prepare, template, publish pipeline over collaborator registries.
#[derive(Clone, Default)]
pub struct ScaffolderPipeline {
    preparers: Preparers,
    templaters: Templaters,
    publishers: Publishers,
}

impl ScaffolderPipeline {
    pub fn new(preparers: Preparers, templaters: Templaters, publishers: Publishers) -> Self {
        Self {
            preparers,
            templaters,
            publishers,
        }
    }

    /// Built-in collaborators configured from `config`.
    pub fn with_defaults(config: &ScaffolderConfig) -> Self {
        Self::new(
            Preparers::with_defaults(),
            Templaters::with_defaults(&config.cookiecutter_image),
            Publishers::with_defaults(config),
        )
    }

    pub fn preparers_mut(&mut self) -> &mut Preparers {
        &mut self.preparers
    }

    pub fn templaters_mut(&mut self) -> &mut Templaters {
        &mut self.templaters
    }

    pub fn publishers_mut(&mut self) -> &mut Publishers {
        &mut self.publishers
    }

    fn resolve_preparer(
        &self,
        template: &TemplateEntity,
    ) -> Result<(Arc<dyn Preparer>, LocationSpec), CollaboratorError> {
        let location = parse_location_annotation(template)?;
        let key = PreparerKey::for_location(&location)?;
        Ok((self.preparers.get(&key)?, location))
    }

    fn resolve_templater(
        &self,
        template: &TemplateEntity,
    ) -> Result<Arc<dyn Templater>, CollaboratorError> {
        let kind = TemplaterKind::from(template.spec.templater.as_str());
        self.templaters.get(&kind)
    }

    fn resolve_publisher(
        &self,
        task: &Task,
    ) -> Result<(Arc<dyn Publisher>, GitDestination), CollaboratorError> {
        let (key, destination) = PublisherKey::from_values(&task.spec.values)?;
        Ok((self.publishers.get(&key)?, destination))
    }
}

#[async_trait]
impl PipelineFactory for ScaffolderPipeline {
    async fn build(&self, task: &Task) -> Result<StageSet, StageExecutionError> {
        let template = &task.spec.template;

        let (preparer, location) = self
            .resolve_preparer(template)
            .map_err(|e| StageExecutionError::new(PREPARE_STAGE, e))?;
        let templater = self
            .resolve_templater(template)
            .map_err(|e| StageExecutionError::new(TEMPLATE_STAGE, e))?;
        let (publisher, destination) = self
            .resolve_publisher(task)
            .map_err(|e| StageExecutionError::new(PUBLISH_STAGE, e))?;

        debug!(
            task_id = %task.id,
            location = %location.location,
            templater = %template.spec.templater,
            destination = %destination.href,
            "Resolved pipeline collaborators"
        );

        Ok(StageSet::new()
            .with_stage(PrepareStage {
                preparer,
                location,
            })
            .with_stage(TemplateStage { templater })
            .with_stage(PublishStage {
                publisher,
                destination,
            }))
    }
}

/// Fetches the skeleton; writes `skeleton_dir`.
struct PrepareStage {
    preparer: Arc<dyn Preparer>,
    location: LocationSpec,
}

#[async_trait]
impl Stage for PrepareStage {
    fn name(&self) -> &str {
        PREPARE_STAGE
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ContextDelta, CollaboratorError> {
        let skeleton_dir = self
            .preparer
            .prepare(ctx.template(), &self.location, ctx)
            .await?;
        Ok(single(SKELETON_DIR_KEY, skeleton_dir))
    }
}

/// Renders the skeleton; writes `result_dir`.
struct TemplateStage {
    templater: Arc<dyn Templater>,
}

#[async_trait]
impl Stage for TemplateStage {
    fn name(&self) -> &str {
        TEMPLATE_STAGE
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ContextDelta, CollaboratorError> {
        let skeleton_dir = ctx.require_path(SKELETON_DIR_KEY)?;
        let result_dir = self
            .templater
            .run(&skeleton_dir, ctx.values(), ctx)
            .await?;
        Ok(single(RESULT_DIR_KEY, result_dir))
    }
}

/// Stores the rendered project; writes the publish result fields.
struct PublishStage {
    publisher: Arc<dyn Publisher>,
    destination: GitDestination,
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> &str {
        PUBLISH_STAGE
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ContextDelta, CollaboratorError> {
        let result_dir = ctx.require_path(RESULT_DIR_KEY)?;
        let published = self
            .publisher
            .publish(&result_dir, &self.destination, ctx)
            .await?;
        Ok(published.into_delta())
    }
}

fn single(key: &str, path: PathBuf) -> ContextDelta {
    let mut delta = ContextDelta::new();
    delta.insert(key.to_string(), path_value(&path));
    delta
}
