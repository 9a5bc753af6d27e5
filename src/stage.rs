//! Stage unit of work.
//!
//! A stage is opaque to the scheduler: it exposes `run()` and nothing
//! else. What runs inside - trial search, training, reduction - is
//! supplied by a [`StageAction`] implementation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::environment::Environment;
use crate::pipeline::SubPipeline;
use crate::substrate::ResourceRequest;

/// Trial reduction: keep only the best `top_k` trial outputs of a stage
/// for consumption by dependent stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionSpec {
    pub top_k: usize,
}

impl ReductionSpec {
    pub fn top(top_k: usize) -> Self {
        Self { top_k }
    }
}

/// Reference to data produced by a completed stage.
///
/// Deliberately distinct from a stage handle: a handle answers "has this
/// finished", an artifact carries what it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub stage: String,
    pub data: Value,
}

impl Artifact {
    pub fn new(stage: impl Into<String>, data: Value) -> Self {
        Self {
            stage: stage.into(),
            data,
        }
    }

    pub fn empty(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            data: Value::Null,
        }
    }
}

/// Everything a stage sees while it runs.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub name: String,
    pub pipeline: SubPipeline,
    pub reductions: Option<ReductionSpec>,
    pub resources: ResourceRequest,
    pub env: Environment,
}

/// Pluggable stage interior.
///
/// Implementations run the actual computation (a hyperparameter search, a
/// training job, a script) and return the artifact dependent stages will
/// consume. Errors are captured in the stage's handle, not raised at
/// dispatch time.
#[async_trait]
pub trait StageAction: Send + Sync {
    fn name(&self) -> String;

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<Artifact>;
}

/// Future type produced by [`FnAction`] closures.
pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<Artifact>> + Send>>;

/// Wrapper turning a plain async closure into a [`StageAction`].
pub struct FnAction {
    name: String,
    func: Arc<dyn Fn(StageContext) -> ActionFuture + Send + Sync>,
}

impl FnAction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(StageContext) -> ActionFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl StageAction for FnAction {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<Artifact> {
        (self.func)(ctx.clone()).await
    }
}

/// One unit of pipeline work: a stage name, its sub-pipeline view, its
/// reduction and resource settings, and the action that does the work.
pub struct Stage {
    ctx: StageContext,
    action: Arc<dyn StageAction>,
}

impl Stage {
    pub fn new(ctx: StageContext, action: Arc<dyn StageAction>) -> Self {
        Self { ctx, action }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Run the stage to completion, producing its artifact.
    #[instrument(skip(self), fields(stage = %self.ctx.name, action = %self.action.name()))]
    pub async fn run(self) -> anyhow::Result<Artifact> {
        debug!(
            closure = self.ctx.pipeline.len(),
            reductions = ?self.ctx.reductions,
            "running stage"
        );
        self.action.execute(&self.ctx).await
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.ctx.name)
            .field("action", &self.action.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, StageSchema};
    use serde_json::json;

    fn context(name: &str) -> StageContext {
        let pipeline =
            Pipeline::new(vec![(name.to_string(), StageSchema::new("test"))]).unwrap();
        StageContext {
            name: name.to_string(),
            pipeline: pipeline.sub_pipeline(name).unwrap(),
            reductions: Some(ReductionSpec::top(2)),
            resources: ResourceRequest::default(),
            env: Environment::new("kiln_output"),
        }
    }

    #[tokio::test]
    async fn fn_action_runs_and_sees_its_context() {
        let action = FnAction::new("probe", |ctx: StageContext| {
            Box::pin(async move {
                assert_eq!(ctx.reductions, Some(ReductionSpec::top(2)));
                Ok(Artifact::new(&ctx.name, json!({"ok": true})))
            })
        });
        let stage = Stage::new(context("probe"), Arc::new(action));
        let artifact = stage.run().await.unwrap();
        assert_eq!(artifact.stage, "probe");
        assert_eq!(artifact.data["ok"], json!(true));
    }

    #[tokio::test]
    async fn action_errors_propagate_from_run() {
        let action = FnAction::new("broken", |_ctx| {
            Box::pin(async { anyhow::bail!("no dataset") })
        });
        let stage = Stage::new(context("broken"), Arc::new(action));
        let err = stage.run().await.unwrap_err();
        assert!(err.to_string().contains("no dataset"));
    }
}
