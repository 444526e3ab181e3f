//! Core domain model types for deskgate.
//!
//! This module contains the fundamental types shared by the orchestrator
//! and the session gate:
//! - Process and pipeline state enums
//! - Stage outputs and the stream endpoint

mod output;
mod status;

pub use output::{keys, StageOutput, StreamEndpoint};
pub use status::{PipelineState, PipelineStatus, ProcessState, StageSnapshot};
