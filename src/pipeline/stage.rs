//! Pipeline stages and ordered stage sets.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CollaboratorError;

use super::context::{ContextDelta, StageContext};

/// One named pipeline step.
///
/// Stages know nothing about the broker or about each other; they read the
/// accumulated context and return the keys they add to it.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &StageContext) -> Result<ContextDelta, CollaboratorError>;
}

/// Stage built from an async closure over an owned context snapshot.
pub struct FnStage<F> {
    name: String,
    handler: F,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ContextDelta, CollaboratorError>> + Send,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ContextDelta, CollaboratorError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ContextDelta, CollaboratorError> {
        (self.handler)(ctx.clone()).await
    }
}

/// Ordered list of stages executed for one task.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Appends an already shared stage.
    pub fn push(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TemplateEntity;
    use crate::pipeline::TaskLogger;
    use crate::tasks::{MemoryTaskBroker, TaskBroker, TaskSpec};
    use serde_json::json;

    #[test]
    fn test_stage_set_keeps_declared_order() {
        let set = StageSet::new()
            .with_stage(FnStage::new("prepare", |_| async { Ok(ContextDelta::new()) }))
            .with_stage(FnStage::new("template", |_| async { Ok(ContextDelta::new()) }))
            .with_stage(FnStage::new("publish", |_| async { Ok(ContextDelta::new()) }));

        assert_eq!(set.names(), vec!["prepare", "template", "publish"]);
        assert_eq!(set.len(), 3);
        assert!(!set.is_empty());
    }

    #[tokio::test]
    async fn test_fn_stage_sees_context() {
        let broker = Arc::new(MemoryTaskBroker::new());
        broker
            .dispatch(TaskSpec::new(
                TemplateEntity::new("t", "tera"),
                json!({"component_id": "foo"}),
            ))
            .await
            .unwrap();
        let task = broker.claim().await.unwrap().unwrap();
        let ctx = StageContext::new(&task, TaskLogger::new(broker, task.id), std::env::temp_dir());

        let stage = FnStage::new("echo", |ctx: StageContext| async move {
            let mut delta = ContextDelta::new();
            delta.insert("echo".to_string(), ctx.values()["component_id"].clone());
            Ok(delta)
        });

        let delta = stage.execute(&ctx).await.unwrap();
        assert_eq!(stage.name(), "echo");
        assert_eq!(delta["echo"], "foo");
    }
}
