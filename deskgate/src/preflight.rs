//! Startup checks for stage executables.

use crate::errors::MissingExecutableError;
use crate::pipeline::Pipeline;
use std::path::PathBuf;
use tracing::debug;

/// A program a stage needs, with where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutable {
    /// The stage needing it.
    pub stage: String,
    /// The program as written in the stage command.
    pub program: String,
    /// Where it was found.
    pub path: PathBuf,
}

/// Lists `(stage, program)` pairs the pipeline will launch, including
/// credential store commands. Templated programs are skipped.
#[must_use]
pub fn required_executables(pipeline: &Pipeline) -> Vec<(String, String)> {
    let mut required = Vec::new();
    for spec in pipeline.specs() {
        let programs = std::iter::once(spec.program())
            .chain(spec.credential.as_ref().and_then(|c| c.store_program()));
        for program in programs {
            if program.is_empty() || program.contains('{') {
                continue;
            }
            let entry = (spec.name.clone(), program.to_string());
            if !required.contains(&entry) {
                required.push(entry);
            }
        }
    }
    required
}

/// Checks that every executable the pipeline needs is on `PATH`.
///
/// # Errors
///
/// Returns [`MissingExecutableError`] listing every missing program.
pub fn check(pipeline: &Pipeline) -> Result<Vec<ResolvedExecutable>, MissingExecutableError> {
    let mut found = Vec::new();
    let mut missing = Vec::new();

    for (stage, program) in required_executables(pipeline) {
        match which::which(&program) {
            Ok(path) => {
                debug!(stage = %stage, program = %program, path = %path.display(), "Executable found");
                found.push(ResolvedExecutable { stage, program, path });
            }
            Err(_) => missing.push((stage, program)),
        }
    }

    if missing.is_empty() {
        Ok(found)
    } else {
        Err(MissingExecutableError::new(missing))
    }
}
