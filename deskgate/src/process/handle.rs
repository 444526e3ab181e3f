//! A single spawned stage process.

use crate::core::ProcessState;
use crate::errors::{SpawnError, StopError};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{LaunchSpec, LogSink};

/// How often a stopping process is polled for exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on waiting for the kernel to reap after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How a successful [`ProcessHandle::stop`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited (or was stopped earlier).
    AlreadyStopped,
    /// The process group exited within the grace period.
    Graceful,
}

/// Owns one spawned external process and its process group.
///
/// The child is placed in its own process group so that stop signals reach
/// anything it forks (an X session spawns many helpers). Dropping a handle
/// whose process is still alive kills the whole group.
#[derive(Debug)]
pub struct ProcessHandle {
    stage: String,
    pid: u32,
    started_at: DateTime<Utc>,
    state: ProcessState,
    child: Arc<Mutex<Child>>,
}

impl ProcessHandle {
    /// Spawns `launch` for `stage`, detached from the parent's stdio.
    ///
    /// The handle starts in [`ProcessState::Starting`].
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the executable cannot be found or launched,
    /// or if the log file cannot be opened.
    pub fn start(stage: &str, launch: &LaunchSpec, logs: &LogSink) -> Result<Self, SpawnError> {
        let (stdout, stderr) = logs
            .stdio(stage)
            .map_err(|e| SpawnError::new(stage, &launch.program, e))?;

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| SpawnError::new(stage, &launch.program, e))?;

        let pid = child.id().ok_or_else(|| {
            SpawnError::new(
                stage,
                &launch.program,
                std::io::Error::new(std::io::ErrorKind::Other, "process exited before its pid was read"),
            )
        })?;

        debug!(stage = %stage, pid, command = %launch.program, "Spawned stage process");

        Ok(Self {
            stage: stage.to_string(),
            pid,
            started_at: Utc::now(),
            state: ProcessState::Starting,
            child: Arc::new(Mutex::new(child)),
        })
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the OS process id (also the process group id).
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns when the process was spawned.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Moves the handle to `next`. Illegal transitions are ignored.
    pub fn transition(&mut self, next: ProcessState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            debug!(
                stage = %self.stage,
                from = ?self.state,
                to = ?next,
                "Ignoring illegal state transition"
            );
        }
    }

    /// Returns a cloneable liveness view for the watch loop.
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        Liveness {
            stage: self.stage.clone(),
            pid: self.pid,
            child: Arc::clone(&self.child),
        }
    }

    /// Non-blocking liveness check.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        try_exit_status(&self.child).is_none()
    }

    /// Stops the process group, escalating to SIGKILL after `grace`.
    ///
    /// Idempotent. On return the direct child has been reaped, except when
    /// [`StopError::Reap`] is returned.
    ///
    /// # Errors
    ///
    /// [`StopError::Forced`] when SIGKILL was needed (the process is still
    /// reaped), [`StopError::Reap`] when even SIGKILL did not end it.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, StopError> {
        if matches!(self.state, ProcessState::Stopped) {
            return Ok(StopOutcome::AlreadyStopped);
        }

        if !self.is_alive() {
            self.sweep_group();
            self.state = ProcessState::Stopped;
            return Ok(StopOutcome::AlreadyStopped);
        }

        self.state = ProcessState::Stopping;
        if let Err(e) = self.signal_group(Signal::SIGTERM) {
            warn!(stage = %self.stage, error = %e, "SIGTERM failed, waiting out the grace period");
        }

        let deadline = Instant::now() + grace;
        if self.wait_until(deadline, |h| !h.is_alive()).await {
            // Give the rest of the group what remains of the grace period.
            self.wait_until(deadline, |h| !h.group_alive()).await;
            self.sweep_group();
            self.state = ProcessState::Stopped;
            debug!(stage = %self.stage, pid = self.pid, "Stage stopped gracefully");
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            stage = %self.stage,
            pid = self.pid,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Stage ignored SIGTERM, sending SIGKILL"
        );
        self.kill_group();

        if self
            .wait_until(Instant::now() + KILL_REAP_TIMEOUT, |h| !h.is_alive())
            .await
        {
            self.state = ProcessState::Stopped;
            Err(StopError::Forced {
                stage: self.stage.clone(),
                pid: self.pid,
                grace,
            })
        } else {
            self.state = ProcessState::Failed;
            Err(StopError::Reap {
                stage: self.stage.clone(),
                pid: self.pid,
                reason: format!(
                    "still running {}ms after SIGKILL",
                    KILL_REAP_TIMEOUT.as_millis()
                ),
            })
        }
    }

    fn pgid(&self) -> Option<Pid> {
        i32::try_from(self.pid).ok().map(Pid::from_raw)
    }

    fn signal_group(&self, signal: Signal) -> Result<(), StopError> {
        let Some(pgid) = self.pgid() else {
            return Err(StopError::Signal {
                stage: self.stage.clone(),
                pid: self.pid,
                reason: "pid out of range".to_string(),
            });
        };
        match killpg(pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(StopError::Signal {
                stage: self.stage.clone(),
                pid: self.pid,
                reason: e.to_string(),
            }),
        }
    }

    fn kill_group(&self) {
        self.sweep_group();
        // Covers the leader even if group signalling was refused.
        if let Err(e) = self.child.lock().start_kill() {
            debug!(stage = %self.stage, error = %e, "start_kill on leader failed");
        }
    }

    /// SIGKILLs whatever is left in the stage's process group.
    fn sweep_group(&self) {
        if let Err(e) = self.signal_group(Signal::SIGKILL) {
            warn!(stage = %self.stage, error = %e, "SIGKILL to process group failed");
        }
    }

    /// True while any process in the stage's group still exists.
    fn group_alive(&self) -> bool {
        self.pgid()
            .is_some_and(|pgid| !matches!(killpg(pgid, None), Err(Errno::ESRCH)))
    }

    async fn wait_until(&self, deadline: Instant, done: impl Fn(&Self) -> bool) -> bool {
        loop {
            if done(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if matches!(self.state, ProcessState::Stopped) {
            return;
        }
        if self.is_alive() {
            warn!(stage = %self.stage, pid = self.pid, "Dropping live stage, killing process group");
            self.kill_group();
        } else {
            self.sweep_group();
        }
    }
}

/// Cloneable, read-only view of a process used by the liveness watch.
///
/// Each check is a single non-blocking `waitpid`.
#[derive(Debug, Clone)]
pub struct Liveness {
    stage: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl Liveness {
    /// Returns the stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the exit description if the process has exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<String> {
        try_exit_status(&self.child)
    }

    /// Non-blocking liveness check.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Resolves once the process has exited, polling every `interval`.
    pub async fn exited(&self, interval: Duration) -> String {
        loop {
            if let Some(status) = self.exit_status() {
                return status;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn try_exit_status(child: &Mutex<Child>) -> Option<String> {
    match child.lock().try_wait() {
        Ok(Some(status)) => Some(describe(status)),
        Ok(None) => None,
        Err(e) => Some(format!("unknown ({e})")),
    }
}

fn describe(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let mut handle = ProcessHandle::start("sleeper", &sh("exec sleep 30"), &LogSink::Discard).unwrap();
        assert_eq!(handle.state(), ProcessState::Starting);
        assert!(handle.is_alive());
        assert!(handle.pid() > 0);

        let outcome = handle.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut handle = ProcessHandle::start("sleeper", &sh("exec sleep 30"), &LogSink::Discard).unwrap();

        handle.stop(Duration::from_secs(2)).await.unwrap();
        let second = handle.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(second, StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let mut handle = ProcessHandle::start(
            "stubborn",
            &sh("trap '' TERM; while true; do sleep 1; done"),
            &LogSink::Discard,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = handle.stop(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, StopError::Forced { .. }));
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_stop_reaches_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let mut handle = ProcessHandle::start("forker", &sh(&script), &LogSink::Discard).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let grandchild = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();

        handle.stop(Duration::from_secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Gone, or a zombie waiting for init to reap it.
        let stat = std::fs::read_to_string(format!("/proc/{grandchild}/stat")).unwrap_or_default();
        let state = stat.rsplit(')').next().unwrap_or("").trim_start().chars().next();
        assert!(matches!(state, None | Some('Z' | 'X')), "grandchild state {state:?}");
    }

    #[tokio::test]
    async fn test_exited_process_reported() {
        let handle = ProcessHandle::start("quitter", &sh("exit 3"), &LogSink::Discard).unwrap();
        let liveness = handle.liveness();

        let status = tokio::time::timeout(
            Duration::from_secs(2),
            liveness.exited(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert_eq!(status, "exit code 3");
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_missing_executable() {
        let err = ProcessHandle::start(
            "ghost",
            &LaunchSpec::new("deskgate-no-such-binary"),
            &LogSink::Discard,
        )
        .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.stage, "ghost");
    }

    #[tokio::test]
    async fn test_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogSink::Directory(dir.path().to_path_buf());
        let handle = ProcessHandle::start("talker", &sh("echo hello; echo oops >&2"), &logs).unwrap();

        handle.liveness().exited(Duration::from_millis(10)).await;
        let contents = std::fs::read_to_string(dir.path().join("talker.log")).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.contains("oops"));
    }

    #[tokio::test]
    async fn test_drop_kills_process_group() {
        let handle = ProcessHandle::start("dropped", &sh("exec sleep 30"), &LogSink::Discard).unwrap();
        let liveness = handle.liveness();
        drop(handle);

        let status = tokio::time::timeout(
            Duration::from_secs(2),
            liveness.exited(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert_eq!(status, "signal 9");
    }
}
