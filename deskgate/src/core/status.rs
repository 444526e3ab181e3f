//! Process and pipeline state enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of one stage's process.
///
/// `Pending → Starting → Running → {Stopping → Stopped | Failed}`, with
/// `Starting → Failed` on probe exhaustion or immediate exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// The stage has not been spawned yet.
    #[default]
    Pending,
    /// The process was spawned and is being probed.
    Starting,
    /// The process passed its readiness probe.
    Running,
    /// A stop was requested or an unexpected exit is being handled.
    Stopping,
    /// The process exited and was reaped.
    Stopped,
    /// The process never became ready or died unexpectedly.
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl ProcessState {
    /// Returns true if the state is terminal for this handle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Returns true if a transition to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use ProcessState::{Failed, Pending, Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Pending | Stopped | Failed, Starting)
                | (Starting, Running | Failed | Stopping)
                | (Running, Stopping | Failed)
                | (Stopping, Stopped | Failed)
        )
    }
}

/// Aggregate pipeline state, derived from the stage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// No stage failed, but not every stage is ready yet.
    #[default]
    Pending,
    /// Every stage reached `Running`.
    Ready,
    /// A restart-policy retry is in progress.
    Degraded,
    /// A stage exhausted its retries or a non-restartable stage exited.
    Failed,
    /// The pipeline was torn down on request.
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A point-in-time view of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    /// The stage name.
    pub name: String,
    /// The current process state.
    pub state: ProcessState,
    /// Whether a restart of this stage is pending or in progress.
    pub retry_pending: bool,
    /// Spawn attempts made so far.
    pub attempts: u32,
    /// The OS process id, while a process exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl StageSnapshot {
    /// Creates a snapshot for a stage that has not started.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ProcessState::Pending,
            retry_pending: false,
            attempts: 0,
            pid: None,
        }
    }
}

/// The `GetStatus` view consumed by the session gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    /// The aggregate state.
    pub state: PipelineState,
    /// Number of stages currently `Running`.
    pub ready_stage_count: usize,
    /// The stage that caused a `Failed` state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
}

impl PipelineStatus {
    /// Derives the aggregate status from stage snapshots given in start order.
    ///
    /// `stopped` marks a pipeline that was deliberately torn down.
    #[must_use]
    pub fn derive(stages: &[StageSnapshot], stopped: bool) -> Self {
        let ready_stage_count = stages
            .iter()
            .filter(|s| s.state == ProcessState::Running)
            .count();

        let failed_stage = stages
            .iter()
            .find(|s| s.state == ProcessState::Failed && !s.retry_pending)
            .map(|s| s.name.clone());

        let state = if failed_stage.is_some() {
            PipelineState::Failed
        } else if stopped {
            PipelineState::Stopped
        } else if stages.iter().any(|s| s.retry_pending) {
            PipelineState::Degraded
        } else if !stages.is_empty() && ready_stage_count == stages.len() {
            PipelineState::Ready
        } else {
            PipelineState::Pending
        };

        Self {
            state,
            ready_stage_count,
            failed_stage,
        }
    }

    /// Returns true if the stream may be embedded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == PipelineState::Ready
    }
}
