//! Experiment: the DAG scheduler.
//!
//! An experiment owns the declared pipeline plus per-stage settings
//! (action, reduction, resources). `run()` walks the stages in declaration
//! order, resolves each stage's immediate dependencies into prerequisite
//! handles, dispatches without blocking, and finally waits on the
//! completion barrier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument};

use crate::core::errors::{KilnError, Result};
use crate::environment::Environment;
use crate::pipeline::{Pipeline, StageSchema, SubPipeline};
use crate::stage::{ReductionSpec, Stage, StageAction, StageContext};
use crate::substrate::{
    LocalSubstrate, ResourceRequest, StageHandle, StageOutcome, Substrate, SubstrateMode,
};
use crate::utils::paths::check_system_reqs;

/// Wraps one stage's dispatch: builds the stage's context, hands its work
/// to the substrate with the resolved prerequisite handles, and returns
/// the new handle immediately.
pub struct StageDispatcher {
    substrate: Arc<dyn Substrate>,
    env: Environment,
}

impl StageDispatcher {
    pub fn new(substrate: Arc<dyn Substrate>, env: Environment) -> Self {
        Self { substrate, env }
    }

    /// Dispatch one stage. Never blocks on the stage's work; errors inside
    /// the stage are captured in the returned handle.
    #[instrument(skip_all, fields(stage = %name))]
    pub fn dispatch(
        &self,
        name: &str,
        pipeline: SubPipeline,
        action: Arc<dyn StageAction>,
        reductions: Option<ReductionSpec>,
        prerequisites: Vec<StageHandle>,
        resources: ResourceRequest,
    ) -> Result<StageHandle> {
        let ctx = StageContext {
            name: name.to_string(),
            pipeline,
            reductions,
            resources,
            env: self.env.clone(),
        };
        let stage = Stage::new(ctx, action);
        debug!(deps = prerequisites.len(), "dispatching stage");
        self.substrate
            .submit(name, Box::pin(stage.run()), prerequisites, resources)
    }
}

/// Summary of one experiment run.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub run_id: String,
    pub experiment: String,
    pub outcomes: Vec<StageOutcome>,
    pub success: bool,
}

impl ExperimentReport {
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }

    pub fn failures(&self) -> Vec<&StageOutcome> {
        self.outcomes.iter().filter(|o| !o.success).collect()
    }

    fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|o| {
                format!(
                    "{}: {}",
                    o.stage,
                    o.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A pipeline of interdependent stages executed as a distributed DAG.
pub struct Experiment {
    name: String,
    save_path: PathBuf,
    pipeline: Vec<(String, StageSchema)>,
    actions: HashMap<String, Arc<dyn StageAction>>,
    reductions: HashMap<String, ReductionSpec>,
    cpus_per_stage: HashMap<String, u32>,
    gpus_per_stage: HashMap<String, u32>,
    substrate: Option<Arc<dyn Substrate>>,
}

impl Experiment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            save_path: PathBuf::from("kiln_output"),
            pipeline: Vec::new(),
            actions: HashMap::new(),
            reductions: HashMap::new(),
            cpus_per_stage: HashMap::new(),
            gpus_per_stage: HashMap::new(),
            substrate: None,
        }
    }

    pub fn save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = path.into();
        self
    }

    /// Append a stage to the pipeline. Declaration order matters: it must
    /// be a topological order of the dependency graph.
    pub fn stage(
        mut self,
        name: impl Into<String>,
        schema: StageSchema,
        action: impl StageAction + 'static,
    ) -> Self {
        let name = name.into();
        self.actions.insert(name.clone(), Arc::new(action));
        self.pipeline.push((name, schema));
        self
    }

    /// Append stages parsed from a YAML pipeline description. Actions for
    /// these stages are registered separately via [`Experiment::action`];
    /// dependency structure is validated at run time.
    pub fn pipeline_yaml(mut self, yaml: &str) -> Result<Self> {
        self.pipeline
            .extend(crate::pipeline::parse_stages_yaml(yaml)?);
        Ok(self)
    }

    /// Register the action that runs `stage`.
    pub fn action(mut self, stage: impl Into<String>, action: impl StageAction + 'static) -> Self {
        self.actions.insert(stage.into(), Arc::new(action));
        self
    }

    /// Keep only the best `top_k` trial outputs of `stage`.
    pub fn reduce(mut self, stage: impl Into<String>, top_k: usize) -> Self {
        self.reductions
            .insert(stage.into(), ReductionSpec::top(top_k));
        self
    }

    /// Reserve `n` CPUs exclusively for `stage`.
    pub fn cpus_per_stage(mut self, stage: impl Into<String>, n: u32) -> Self {
        self.cpus_per_stage.insert(stage.into(), n);
        self
    }

    /// Reserve `n` GPUs exclusively for `stage`.
    pub fn gpus_per_stage(mut self, stage: impl Into<String>, n: u32) -> Self {
        self.gpus_per_stage.insert(stage.into(), n);
        self
    }

    /// Inject an execution substrate. Without one, a [`LocalSubstrate`]
    /// sized to the host is created at run time.
    pub fn substrate(mut self, substrate: Arc<dyn Substrate>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// Execute the experiment's DAG to completion.
    ///
    /// Structural errors (unknown stage, non-topological order, inactive
    /// substrate) abort synchronously before or during dispatch. Stage
    /// execution failures surface only after the completion barrier, which
    /// always waits for the full handle set; in-flight siblings of a
    /// failed stage are never cancelled.
    #[instrument(skip_all, fields(experiment = %self.name))]
    pub async fn run(&self, env: Option<Environment>) -> Result<ExperimentReport> {
        let env = env.unwrap_or_else(|| Environment::new(&self.save_path));
        check_system_reqs(env.output_path())?;

        let run_id = cuid2::create_id();
        info!(run_id = %run_id, stages = self.pipeline.len(), "starting experiment run");

        // Validates names, references and declaration order before any
        // stage is dispatched.
        let pipeline = Pipeline::new(self.pipeline.clone())?;
        for (name, _schema) in pipeline.stages() {
            if !self.actions.contains_key(name) {
                return Err(KilnError::configuration(format!(
                    "no action registered for stage '{}'",
                    name
                )));
            }
        }

        let substrate: Arc<dyn Substrate> = match &self.substrate {
            Some(s) => s.clone(),
            None => Arc::new(LocalSubstrate::with_host_capacity()),
        };
        let mode = if env.debug() {
            SubstrateMode::Debug
        } else {
            SubstrateMode::Parallel
        };
        substrate.ensure_active(mode).await?;

        let dispatcher = StageDispatcher::new(substrate.clone(), env);

        // Stage-name-to-handle table, owned and mutated only by this loop.
        let mut table: HashMap<String, StageHandle> = HashMap::new();
        let mut handles = Vec::with_capacity(pipeline.len());

        for (name, _schema) in pipeline.stages() {
            let sub = pipeline.sub_pipeline(name)?;

            let mut prerequisites = Vec::with_capacity(sub.dependencies().len());
            for dep in sub.dependencies() {
                let handle = table
                    .get(dep.as_str())
                    .ok_or_else(|| KilnError::unresolved_dependency(name, dep.as_str()))?;
                prerequisites.push(handle.clone());
            }

            let action = self.actions.get(name).cloned().ok_or_else(|| {
                KilnError::configuration(format!("no action registered for stage '{}'", name))
            })?;
            let resources = ResourceRequest {
                cpus: self.cpus_per_stage.get(name).copied(),
                gpus: self.gpus_per_stage.get(name).copied(),
            };
            let reductions = self.reductions.get(name).copied();

            let handle =
                dispatcher.dispatch(name, sub, action, reductions, prerequisites, resources)?;
            table.insert(name.to_string(), handle.clone());
            handles.push(handle);
        }

        debug!(dispatched = handles.len(), "all stages dispatched; awaiting completion");
        let outcomes = substrate.await_all(&handles).await;

        let report = ExperimentReport {
            run_id,
            experiment: self.name.clone(),
            success: outcomes.iter().all(|o| o.success),
            outcomes,
        };

        if !report.success {
            for outcome in report.failures() {
                error!(
                    stage = %outcome.stage,
                    error = outcome.error.as_deref().unwrap_or("unknown error"),
                    "stage failed"
                );
            }
            let failed_stages = report
                .failures()
                .iter()
                .map(|o| o.stage.clone())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(KilnError::stage_execution(
                failed_stages,
                report.failure_summary(),
            ));
        }

        info!(run_id = %report.run_id, stages = report.outcomes.len(), "experiment completed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Artifact;
    use chrono::NaiveDateTime;

    fn outcome(stage: &str, success: bool) -> StageOutcome {
        StageOutcome {
            stage: stage.to_string(),
            success,
            error: (!success).then(|| "boom".to_string()),
            artifact: success.then(|| Artifact::empty(stage)),
            reservation: crate::substrate::Reservation { cpus: 1, gpus: 0 },
            started_at: NaiveDateTime::default(),
            finished_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn report_collects_every_failure() {
        let report = ExperimentReport {
            run_id: "r".to_string(),
            experiment: "e".to_string(),
            outcomes: vec![outcome("a", true), outcome("b", false), outcome("c", false)],
            success: false,
        };
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        let summary = report.failure_summary();
        assert!(summary.contains("b: boom"));
        assert!(summary.contains("c: boom"));
        assert!(report.outcome("a").unwrap().success);
    }
}
