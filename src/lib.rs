//! Kiln - a library for orchestrating computational experiments as
//! distributed DAGs of interdependent stages.
//!
//! A pipeline is an ordered set of declarative stage definitions; stages
//! reference earlier stages through links, forming a dependency graph.
//! The [`Experiment`] scheduler dispatches every stage to an execution
//! substrate without blocking, passing each stage the handles of its
//! immediate dependencies, then waits on a single completion barrier.
//! Stages with no dependency relationship execute concurrently.

// Core infrastructure modules
pub mod core {
    pub mod errors;
}

pub mod environment;
pub mod experiment;
pub mod logging;
pub mod pipeline;
pub mod stage;
pub mod substrate;
pub mod utils;

// Re-exports for convenience
pub use core::errors::{KilnError, Result};
pub use environment::Environment;
pub use experiment::{Experiment, ExperimentReport, StageDispatcher};
pub use pipeline::{Pipeline, StageSchema, SubPipeline};
pub use stage::{Artifact, FnAction, ReductionSpec, Stage, StageAction, StageContext};
pub use substrate::{
    await_handles, LocalSubstrate, Reservation, ResourceRequest, StageHandle, StageOutcome,
    StageWork, Substrate, SubstrateMode,
};
