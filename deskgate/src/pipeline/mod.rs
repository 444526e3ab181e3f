//! Pipeline definition and execution.
//!
//! This module provides:
//! - Stage specifications and command templates
//! - Pipeline builder with validation
//! - Dependency ordering
//! - Restart policies with backoff
//! - The orchestrator that starts, supervises and stops stages

mod builder;
mod dag;
mod orchestrator;
mod retry;
mod spec;
mod stage;
pub mod template;
mod watch;

#[cfg(test)]
mod integration_tests;

pub use builder::{Pipeline, PipelineBuilder};
pub use dag::topological_order;
pub use orchestrator::{OrchestratorConfig, PipelineOrchestrator, PipelineView};
pub use retry::{BackoffConfig, BackoffStrategy, JitterStrategy, RestartPolicy, RetryState};
pub use spec::StageSpec;
pub use stage::{ResolvedStage, Stage, StageDefaults};
pub use watch::{ExitNotice, LivenessWatch, WatchTargets};
