//! # Deskgate
//!
//! A password-gated remote desktop in front of a supervised process pipeline.
//!
//! Deskgate starts a chain of long-running external processes (virtual
//! display, desktop session, framebuffer server, websocket bridge) in
//! dependency order, gating each on an observable readiness signal, and
//! serves a login page that embeds the desktop stream only once every stage
//! is ready.
//!
//! - **Ordered startup**: stage *i+1* is spawned only after stage *i* passed
//!   its readiness probe, and may be parameterised by its outputs
//! - **Bounded waits**: every probe and every stop carries a deadline
//! - **Total teardown**: failure, cancellation and shutdown stop every
//!   started stage in reverse order, escalating to SIGKILL
//! - **Restart policies**: bounded retries with backoff, at startup and at
//!   runtime
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deskgate::prelude::*;
//!
//! let pipeline = PipelineBuilder::new("desk")
//!     .stage(StageSpec::new("framebuffer", "x11vnc")
//!         .with_args(["-rfbport", "{self.port}"])
//!         .with_output("host", "127.0.0.1")
//!         .with_output("port", "5901")
//!         .with_readiness(ReadinessPolicy::socket("127.0.0.1", 5901)))
//!     .stage(StageSpec::new("bridge", "websockify")
//!         .with_args(["6080", "{framebuffer.host}:{framebuffer.port}"])
//!         .with_dependency("framebuffer")
//!         .with_readiness(ReadinessPolicy::socket("127.0.0.1", 6080)))
//!     .build()?;
//!
//! let orchestrator = PipelineOrchestrator::new(pipeline, OrchestratorConfig::default());
//! orchestrator.start_all().await?;
//! // ...
//! orchestrator.stop_all().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod credential;
pub mod desktop;
pub mod errors;
pub mod events;
pub mod gate;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod readiness;
pub mod telemetry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::DeskgateConfig;
    pub use crate::core::{
        PipelineState, PipelineStatus, ProcessState, StageOutput, StageSnapshot, StreamEndpoint,
    };
    pub use crate::credential::{CredentialFallback, CredentialSpec};
    pub use crate::errors::{
        CycleDetectedError, DeskgateError, MissingExecutableError, PipelineStartError,
        PipelineValidationError, StageError, StopError,
    };
    pub use crate::events::{EventSink, LoggingEventSink};
    pub use crate::pipeline::{
        OrchestratorConfig, Pipeline, PipelineBuilder, PipelineOrchestrator, PipelineView,
        RestartPolicy, StageSpec,
    };
    pub use crate::process::{LaunchSpec, LogSink, ProcessHandle};
    pub use crate::readiness::{ReadinessPolicy, ReadinessProbe};
}
