//! Stage pipeline executed for every scaffolder task.
//!
//! # Architecture
//!
//! - **Stage**: a named step from the accumulated [`StageContext`] to a
//!   [`ContextDelta`]. Stages know nothing about the broker.
//! - **StageSet**: the ordered stages of one task.
//! - **PipelineFactory**: builds the stage set for a claimed task;
//!   [`ScaffolderPipeline`] is the prepare, template, publish pipeline.
//! - **Config**: [`ScaffolderConfig`], shared by the worker and the built-in
//!   collaborators.
//!
//! # Pipeline Flow
//!
//! 1. **Prepare**: the preparer selected by the template location copies or
//!    clones the skeleton into a scratch directory (`skeleton_dir`)
//! 2. **Template**: the templater named by `spec.templater` renders the
//!    skeleton with the task values (`result_dir`)
//! 3. **Publish**: the publisher selected by `storePath` stores the result
//!    (`location`, `catalog_info_url`)
//!
//! # Example
//!
//! ```rust,ignore
//! use scaffolder::pipeline::{ScaffolderConfig, ScaffolderPipeline};
//!
//! let config = ScaffolderConfig::from_env()?;
//! let pipeline = ScaffolderPipeline::with_defaults(&config);
//! ```

pub mod config;
pub mod context;
pub mod factory;
pub mod stage;

pub use config::{ConfigError, ScaffolderConfig};
pub use context::{ContextDelta, StageContext, TaskLogger};
pub use factory::{
    PipelineFactory, ScaffolderPipeline, PREPARE_STAGE, PUBLISH_STAGE, RESULT_DIR_KEY,
    SKELETON_DIR_KEY, TEMPLATE_STAGE,
};
pub use stage::{FnStage, Stage, StageSet};
