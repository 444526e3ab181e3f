//! Stage specifications.

use crate::credential::CredentialSpec;
use crate::errors::{ErrorInfo, PipelineValidationError};
use crate::readiness::ReadinessPolicy;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::RestartPolicy;

/// Immutable declaration of one pipeline stage.
///
/// `command`, `env` values and `outputs` values may contain placeholders:
/// `{dep.key}` reads an output of the dependency `dep`, `{self.key}` reads
/// one of this stage's own outputs. Declared outputs are published to
/// dependents once the stage is ready.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Environment overrides merged over the parent's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Names of stages this stage depends on.
    #[serde(default, rename = "depends_on")]
    pub dependencies: BTreeSet<String>,
    /// How readiness is detected.
    pub readiness: ReadinessPolicy,
    /// Whether a failed attempt is retried.
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Values published to dependents.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Credential prepared before launch.
    #[serde(default)]
    pub credential: Option<CredentialSpec>,
    /// Overrides the pipeline's stop grace period.
    #[serde(default)]
    pub grace_period_ms: Option<u64>,
    /// Overrides the pipeline's readiness deadline.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl StageSpec {
    /// Creates a stage running `program` with no arguments.
    ///
    /// Readiness defaults to a zero-length fixed delay.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: vec![program.into()],
            env: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            readiness: ReadinessPolicy::fixed_delay(Duration::ZERO),
            restart: RestartPolicy::Never,
            outputs: BTreeMap::new(),
            credential: None,
            grace_period_ms: None,
            deadline_ms: None,
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Sets the readiness policy.
    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Sets the restart policy.
    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Declares an output.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    /// Sets the credential.
    #[must_use]
    pub fn with_credential(mut self, credential: CredentialSpec) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Overrides the stop grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = Some(millis(grace));
        self
    }

    /// Overrides the readiness deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(millis(deadline));
        self
    }

    /// Returns the program to execute.
    #[must_use]
    pub fn program(&self) -> &str {
        self.command.first().map_or("", String::as_str)
    }

    /// Grace period, falling back to `default`.
    #[must_use]
    pub fn grace_period(&self, default: Duration) -> Duration {
        self.grace_period_ms.map_or(default, Duration::from_millis)
    }

    /// Readiness deadline, falling back to `default`.
    #[must_use]
    pub fn deadline(&self, default: Duration) -> Duration {
        self.deadline_ms.map_or(default, Duration::from_millis)
    }

    /// Validates the stage on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or command is empty, or the stage
    /// depends on itself.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty")
                .with_error_info(ErrorInfo::new("DESK-CONFIG-NAME", "Empty stage name")));
        }

        if self.program().trim().is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' has no command",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ErrorInfo::new("DESK-CONFIG-COMMAND", "Stage command is empty")
                    .with_fix_hint("Set `command` to the program followed by its arguments."),
            ));
        }

        if self.dependencies.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }

        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
