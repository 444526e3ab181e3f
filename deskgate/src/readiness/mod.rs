//! Stage readiness detection.
//!
//! "Spawned" is not "ready": a stage is ready once it accepts connections,
//! has produced a file, or (as a last resort) a fixed delay has passed.

mod policy;
mod probe;

pub use policy::ReadinessPolicy;
pub use probe::{ProbeOutcome, ReadinessProbe};
