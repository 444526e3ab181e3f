//! Error types for the deskgate pipeline.
//!
//! Stage-local failures (spawn, readiness, unexpected exit, template and
//! credential problems) are collected under [`StageError`] and handled by
//! the orchestrator's restart/abort logic. Only aggregate results reach the
//! HTTP-facing layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for deskgate operations.
#[derive(Debug, Error)]
pub enum DeskgateError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the stage dependency graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// One or more stage executables could not be found.
    #[error("{0}")]
    MissingExecutable(#[from] MissingExecutableError),

    /// The pipeline failed to start.
    #[error("{0}")]
    PipelineStart(#[from] PipelineStartError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Startup was cancelled before the pipeline became ready.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// `start_all` was called on an orchestrator that already ran.
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeskgateError {
    /// Returns the diagnostic code for this error, if it has one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Validation(e) => e.error_info.as_ref().map(|i| i.code.as_str()),
            Self::CycleDetected(e) => Some(e.error_info.code.as_str()),
            Self::MissingExecutable(e) => Some(e.error_info.code.as_str()),
            Self::PipelineStart(e) => Some(e.cause.code()),
            Self::Config(_) => Some("DESK-CONFIG"),
            Self::Cancelled(_) => Some("DESK-CANCELLED"),
            Self::AlreadyStarted | Self::Io(_) => None,
        }
    }
}

/// Diagnostic metadata attached to errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "DESK-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when the stage set is malformed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// Error raised when a cycle is detected in the dependency graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "DESK-CYCLE",
            format!("Stage dependencies form a cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a stage template references a stage it does not depend on.
#[derive(Debug, Clone, Error)]
#[error("Undeclared dependency: stage '{stage}' references '{key}' which is not one of its dependencies")]
pub struct UndeclaredDependencyError {
    /// The stage being resolved.
    pub stage: String,
    /// The referenced stage.
    pub key: String,
}

impl UndeclaredDependencyError {
    /// Creates a new undeclared dependency error.
    #[must_use]
    pub fn new(stage: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            key: key.into(),
        }
    }
}

/// Errors raised while resolving a stage's command template.
#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    /// The template referenced a stage outside the declared dependencies.
    #[error("{0}")]
    UndeclaredDependency(#[from] UndeclaredDependencyError),

    /// The referenced stage did not publish the requested value.
    #[error("Stage '{stage}' references '{{{placeholder}}}' but no such value was published")]
    MissingValue {
        /// The stage being resolved.
        stage: String,
        /// The placeholder text, without braces.
        placeholder: String,
    },

    /// A placeholder was not of the form `namespace.key`.
    #[error("Stage '{stage}' has a malformed placeholder '{{{placeholder}}}'")]
    Malformed {
        /// The stage being resolved.
        stage: String,
        /// The placeholder text, without braces.
        placeholder: String,
    },
}

/// Error raised when a stage's executable cannot be launched.
#[derive(Debug, Error)]
#[error("Failed to spawn stage '{stage}' ({program}): {source}")]
pub struct SpawnError {
    /// The stage name.
    pub stage: String,
    /// The program that failed to launch.
    pub program: String,
    /// The underlying OS error.
    #[source]
    pub source: std::io::Error,
}

impl SpawnError {
    /// Creates a new spawn error.
    #[must_use]
    pub fn new(stage: impl Into<String>, program: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            stage: stage.into(),
            program: program.into(),
            source,
        }
    }

    /// Returns true if the executable was not found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == std::io::ErrorKind::NotFound
    }
}

/// Error raised when a stage never became ready.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' was not ready after {attempts} probe attempt(s) within {}ms", deadline.as_millis())]
pub struct ProbeTimeoutError {
    /// The stage name.
    pub stage: String,
    /// Probe attempts made.
    pub attempts: u32,
    /// The deadline that was exceeded.
    pub deadline: Duration,
}

/// Error raised when a stage process exited without being asked to.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' (pid {pid}) exited unexpectedly: {status}")]
pub struct UnexpectedExitError {
    /// The stage name.
    pub stage: String,
    /// The OS process id.
    pub pid: u32,
    /// Human readable exit status.
    pub status: String,
}

/// Error raised when a stage did not terminate gracefully.
///
/// Stop errors are logged and never re-raised: teardown always continues.
#[derive(Debug, Clone, Error)]
pub enum StopError {
    /// The process ignored the graceful request and was killed.
    #[error("Stage '{stage}' (pid {pid}) ignored SIGTERM for {}ms and was killed", grace.as_millis())]
    Forced {
        /// The stage name.
        stage: String,
        /// The OS process id.
        pid: u32,
        /// The grace period that expired.
        grace: Duration,
    },

    /// A signal could not be delivered.
    #[error("Failed to signal stage '{stage}' (pid {pid}): {reason}")]
    Signal {
        /// The stage name.
        stage: String,
        /// The OS process id.
        pid: u32,
        /// The failure reason.
        reason: String,
    },

    /// The process could not be reaped after the forced kill.
    #[error("Stage '{stage}' (pid {pid}) could not be reaped: {reason}")]
    Reap {
        /// The stage name.
        stage: String,
        /// The OS process id.
        pid: u32,
        /// The failure reason.
        reason: String,
    },
}

/// Errors raised while preparing a stage's credential file.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The credential file could not be created or secured.
    #[error("Failed to prepare credential file {path}: {source}")]
    Io {
        /// The credential path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The store command exited unsuccessfully.
    #[error("Credential store command '{program}' failed with {status}")]
    StoreFailed {
        /// The store program.
        program: String,
        /// Human readable exit status.
        status: String,
    },

    /// The credential file was empty after the store command ran.
    #[error("Credential file {path} is empty")]
    Empty {
        /// The credential path.
        path: PathBuf,
    },
}

/// A stage-local failure. Handled by the orchestrator, never shown to users.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage could not be spawned.
    #[error("{0}")]
    Spawn(#[from] SpawnError),

    /// The stage never became ready.
    #[error("{0}")]
    ProbeTimeout(#[from] ProbeTimeoutError),

    /// The stage exited on its own.
    #[error("{0}")]
    UnexpectedExit(#[from] UnexpectedExitError),

    /// The stage's command could not be resolved.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// The stage's credential could not be prepared.
    #[error("{0}")]
    Credential(#[from] CredentialError),
}

impl StageError {
    /// Returns the diagnostic code for this failure.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "DESK-SPAWN",
            Self::ProbeTimeout(_) => "DESK-PROBE-TIMEOUT",
            Self::UnexpectedExit(_) => "DESK-UNEXPECTED-EXIT",
            Self::Template(_) => "DESK-TEMPLATE",
            Self::Credential(_) => "DESK-CREDENTIAL",
        }
    }

    /// Returns diagnostic info for this failure.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.code(), self.to_string());
        match self {
            Self::Spawn(e) if e.is_not_found() => {
                info.with_fix_hint(format!("Install '{}' or fix the stage command.", e.program))
            }
            Self::ProbeTimeout(_) => {
                info.with_fix_hint("Check the stage log or raise its readiness deadline.")
            }
            Self::Template(_) => info.with_fix_hint("Declare the referenced stage in depends_on."),
            _ => info,
        }
    }
}

/// Error surfaced when startup is aborted because a stage failed.
#[derive(Debug, Error)]
#[error("Pipeline failed to start at stage '{failed_stage}': {cause}")]
pub struct PipelineStartError {
    /// The stage that failed.
    pub failed_stage: String,
    /// The stage-local cause.
    #[source]
    pub cause: StageError,
}

/// Error raised when required executables are not on `PATH`.
#[derive(Debug, Clone, Error)]
#[error("Missing executable(s): {}", missing.iter().map(|(stage, program)| format!("{program} (stage '{stage}')")).collect::<Vec<_>>().join(", "))]
pub struct MissingExecutableError {
    /// `(stage, program)` pairs that could not be found.
    pub missing: Vec<(String, String)>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl MissingExecutableError {
    /// Creates a new missing executable error.
    #[must_use]
    pub fn new(missing: Vec<(String, String)>) -> Self {
        let programs: Vec<&str> = missing.iter().map(|(_, p)| p.as_str()).collect();
        let info = ErrorInfo::new(
            "DESK-MISSING-EXEC",
            format!("Executables not found on PATH: {}", programs.join(", ")),
        )
        .with_fix_hint("Install the missing packages or point the stage command at an absolute path.");

        Self {
            missing,
            error_info: info,
        }
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file from disk.
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        /// The config path.
        path: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML file at {path}: {source}")]
    TomlParse {
        /// The config path.
        path: PathBuf,
        /// The parse error.
        source: toml::de::Error,
    },

    /// An environment override had an invalid value.
    #[error("Invalid value for {var}: {reason}")]
    InvalidEnv {
        /// The environment variable.
        var: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration was structurally invalid.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error").with_fix_hint("Fix this by doing that");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.error_info.code, "DESK-CYCLE");
        assert_eq!(DeskgateError::from(err).code(), Some("DESK-CYCLE"));
    }

    #[test]
    fn test_spawn_error_not_found() {
        let err = SpawnError::new(
            "framebuffer",
            "x11vnc",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_not_found());

        let info = StageError::from(err).error_info();
        assert_eq!(info.code, "DESK-SPAWN");
        assert!(info.fix_hint.unwrap().contains("x11vnc"));
    }

    #[test]
    fn test_pipeline_start_error_message() {
        let err = PipelineStartError {
            failed_stage: "bridge".to_string(),
            cause: StageError::ProbeTimeout(ProbeTimeoutError {
                stage: "bridge".to_string(),
                attempts: 3,
                deadline: Duration::from_millis(600),
            }),
        };

        let msg = err.to_string();
        assert!(msg.contains("'bridge'"));
        assert!(msg.contains("3 probe attempt(s)"));
        assert_eq!(
            DeskgateError::from(err).code(),
            Some("DESK-PROBE-TIMEOUT")
        );
    }

    #[test]
    fn test_missing_executable_lists_programs() {
        let err = MissingExecutableError::new(vec![
            ("display".to_string(), "Xvfb".to_string()),
            ("bridge".to_string(), "websockify".to_string()),
        ]);

        let msg = err.to_string();
        assert!(msg.contains("Xvfb (stage 'display')"));
        assert!(msg.contains("websockify (stage 'bridge')"));
        assert_eq!(err.error_info.code, "DESK-MISSING-EXEC");
    }

    #[test]
    fn test_template_error_message() {
        let err = TemplateError::MissingValue {
            stage: "bridge".to_string(),
            placeholder: "framebuffer.port".to_string(),
        };
        assert!(err.to_string().contains("{framebuffer.port}"));
    }
}
