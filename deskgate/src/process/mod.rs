//! Spawned stage processes.
//!
//! A [`ProcessHandle`] is the only thing in the crate that signals an OS
//! process. The orchestrator owns every handle; the liveness watch only
//! sees [`Liveness`] views.

mod handle;
mod launch;

pub use handle::{Liveness, ProcessHandle, StopOutcome};
pub use launch::{LaunchSpec, LogSink};
