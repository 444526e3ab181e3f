//! The pipeline orchestrator.
//!
//! Stages start strictly in dependency order: stage *i+1* is not spawned
//! until stage *i* passed its readiness probe, because later commands are
//! parameterised by earlier outputs. Any terminal failure, cancellation or
//! [`PipelineOrchestrator::stop_all`] tears the started stages down in
//! reverse start order.
//!
//! Every process handle lives in a single arena behind a `parking_lot`
//! mutex. The lock is only held for bookkeeping, never across an await.
//! Readers ([`PipelineOrchestrator::status`]) see a snapshot refreshed at
//! each transition.

use crate::cancellation::CancellationToken;
use crate::core::{PipelineState, PipelineStatus, ProcessState, StageOutput, StageSnapshot, StreamEndpoint};
use crate::errors::{
    DeskgateError, PipelineStartError, ProbeTimeoutError, StageError, StopError, UnexpectedExitError,
};
use crate::events::{EventSink, LoggingEventSink};
use crate::process::{Liveness, LogSink, ProcessHandle};
use crate::readiness::ProbeOutcome;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::stage::{Stage, StageDefaults};
use super::watch::{ExitNotice, LivenessWatch, WatchTargets};
use super::{Pipeline, RetryState};

/// How often a probing stage is checked for an early exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Read-only view of a pipeline, as consumed by the session gate.
pub trait PipelineView: Send + Sync {
    /// Current aggregate status. Never blocks on child processes.
    fn status(&self) -> PipelineStatus;

    /// The bridge endpoint, only while the pipeline is `Ready`.
    fn stream_endpoint(&self) -> Option<StreamEndpoint>;
}

/// Orchestrator settings that apply to every stage.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Per-stage timing fallbacks.
    pub defaults: StageDefaults,
    /// Liveness watch polling interval.
    pub watch_interval: Duration,
    /// Where stage output goes.
    pub log_sink: LogSink,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            defaults: StageDefaults::default(),
            watch_interval: Duration::from_secs(1),
            log_sink: LogSink::Discard,
        }
    }
}

impl OrchestratorConfig {
    /// Sets the default stop grace period.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.defaults.grace_period = grace;
        self
    }

    /// Sets the default readiness deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.defaults.deadline = deadline;
        self
    }

    /// Sets the liveness watch interval.
    #[must_use]
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Sets the log sink.
    #[must_use]
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: ProcessState,
    handle: Option<ProcessHandle>,
    retry: RetryState,
    restarts_used: u32,
    retry_pending: bool,
    output: Option<StageOutput>,
    grace_period: Duration,
}

/// All stage slots, indexed by name.
#[derive(Debug, Default)]
struct HandleArena {
    slots: BTreeMap<String, Slot>,
    /// Planned start order.
    order: Vec<String>,
    /// Observed start order (first spawn of each stage).
    started: Vec<String>,
    endpoint_stage: Option<String>,
}

impl HandleArena {
    fn slot_mut(&mut self, name: &str) -> &mut Slot {
        self.slots.entry(name.to_string()).or_default()
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    status: PipelineStatus,
    stages: Vec<StageSnapshot>,
    endpoint: Option<StreamEndpoint>,
}

enum AttemptError {
    Cancelled,
    Failed(StageError),
}

/// Starts, supervises and stops a [`Pipeline`].
pub struct PipelineOrchestrator {
    pipeline: Pipeline,
    config: OrchestratorConfig,
    arena: Mutex<HandleArena>,
    snapshot: RwLock<Snapshot>,
    cancel: Arc<CancellationToken>,
    events: Arc<dyn EventSink>,
    /// Held while stages are being spawned, by startup and runtime restarts.
    startup_lock: tokio::sync::Mutex<()>,
    teardown_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("pipeline", &self.pipeline.name())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator. Nothing is spawned until [`Self::start_all`].
    #[must_use]
    pub fn new(pipeline: Pipeline, config: OrchestratorConfig) -> Self {
        let stages = pipeline
            .specs()
            .map(|s| StageSnapshot::pending(s.name.clone()))
            .collect::<Vec<_>>();

        Self {
            pipeline,
            config,
            arena: Mutex::new(HandleArena::default()),
            snapshot: RwLock::new(Snapshot {
                status: PipelineStatus::derive(&stages, false),
                stages,
                endpoint: None,
            }),
            cancel: Arc::new(CancellationToken::new()),
            events: Arc::new(LoggingEventSink::debug()),
            startup_lock: tokio::sync::Mutex::new(()),
            teardown_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Returns the pipeline definition.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns the cancellation token observed by startup and supervision.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Requests cancellation. Startup falls into reverse-order teardown.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Per-stage snapshots in planned start order.
    #[must_use]
    pub fn stage_snapshots(&self) -> Vec<StageSnapshot> {
        self.snapshot.read().stages.clone()
    }

    /// Stages in the order they were first spawned.
    #[must_use]
    pub fn start_order(&self) -> Vec<String> {
        self.arena.lock().started.clone()
    }

    /// Starts every stage in dependency order.
    ///
    /// Single-shot: a second call fails with
    /// [`DeskgateError::AlreadyStarted`] without spawning.
    ///
    /// # Errors
    ///
    /// - [`DeskgateError::CycleDetected`] before anything is spawned
    /// - [`DeskgateError::PipelineStart`] when a stage exhausted its attempts;
    ///   every started stage has been stopped by then
    /// - [`DeskgateError::Cancelled`] when cancelled; same teardown
    pub async fn start_all(&self) -> Result<(), DeskgateError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DeskgateError::AlreadyStarted);
        }
        let _startup = self.startup_lock.lock().await;

        let order = self.pipeline.start_order()?;
        let endpoint_stage = self.pipeline.endpoint_stage(&order);
        self.update(|arena| {
            for name in &order {
                arena.slot_mut(name);
            }
            arena.order.clone_from(&order);
            arena.endpoint_stage = endpoint_stage;
        });
        info!(pipeline = %self.pipeline.name(), order = ?order, "Starting pipeline");

        let mut upstream: BTreeMap<String, StageOutput> = BTreeMap::new();
        for name in &order {
            if self.cancel.is_cancelled() {
                return Err(self.abort_cancelled().await);
            }
            let Some(spec) = self.pipeline.stage(name) else {
                continue;
            };
            let stage = Stage::new(spec.clone());

            match self.start_stage(&stage, &upstream).await {
                Ok(output) => {
                    upstream.insert(name.clone(), output);
                }
                Err(AttemptError::Cancelled) => return Err(self.abort_cancelled().await),
                Err(AttemptError::Failed(cause)) => {
                    error!(stage = %name, error = %cause, "Pipeline start failed, tearing down");
                    self.events
                        .emit("pipeline.failed", Some(json!({ "stage": name, "code": cause.code() })))
                        .await;
                    self.teardown().await;
                    return Err(PipelineStartError {
                        failed_stage: name.clone(),
                        cause,
                    }
                    .into());
                }
            }
        }

        info!(pipeline = %self.pipeline.name(), stages = order.len(), "Pipeline ready");
        self.events
            .emit("pipeline.ready", Some(json!({ "stages": order.len() })))
            .await;
        Ok(())
    }

    /// Stops every stage in reverse start order.
    ///
    /// Idempotent and safe to call from a signal handler task, concurrently
    /// with [`Self::start_all`]: an in-flight start observes the cancellation,
    /// unwinds, and only then is the teardown run, so nothing spawned by it
    /// outlives this call. Individual failures do not abort the teardown;
    /// they are logged and returned.
    pub async fn stop_all(&self) -> Vec<StopError> {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        self.cancel.cancel("stop requested");

        let _startup = self.startup_lock.lock().await;
        let errors = self.teardown().await;
        self.update(|_| ());

        if first {
            info!(pipeline = %self.pipeline.name(), forced = errors.len(), "Pipeline stopped");
            self.events
                .emit("pipeline.stopped", Some(json!({ "forced": errors.len() })))
                .await;
        }
        errors
    }

    /// Watches running stages and applies restart policies until the
    /// pipeline fails or is cancelled.
    ///
    /// Returns immediately unless the pipeline is `Ready`.
    pub async fn supervise(&self) {
        if !self.status().is_ready() {
            return;
        }

        let (tx, mut rx) = mpsc::channel(self.pipeline.len().max(1));
        let watch = LivenessWatch::new(self.config.watch_interval);
        let watching = watch.run(self, tx);
        tokio::pin!(watching);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(notice) = rx.recv() => {
                    if !self.handle_exit(notice).await {
                        break;
                    }
                }
                () = &mut watching => break,
            }
        }
        debug!(pipeline = %self.pipeline.name(), "Supervision ended");
    }

    /// Runs one stage's attempt loop: resolve, spawn, probe, back off.
    async fn start_stage(
        &self,
        stage: &Stage,
        upstream: &BTreeMap<String, StageOutput>,
    ) -> Result<StageOutput, AttemptError> {
        let name = stage.name();
        let policy = stage.spec().restart;
        self.update(|arena| arena.slot_mut(name).retry = RetryState::new());

        loop {
            let attempt = self.update(|arena| {
                let slot = arena.slot_mut(name);
                slot.retry.record_attempt();
                slot.retry.attempts
            });

            let cause = match self.attempt_stage(stage, upstream, attempt).await {
                Ok(output) => return Ok(output),
                Err(AttemptError::Cancelled) => return Err(AttemptError::Cancelled),
                Err(AttemptError::Failed(cause)) => cause,
            };

            let delay = self.update(|arena| {
                let slot = arena.slot_mut(name);
                slot.state = ProcessState::Failed;
                slot.retry_pending = slot.retry.has_remaining(&policy);
                slot.retry_pending
                    .then(|| slot.retry.next_delay(&policy.backoff()))
            });

            warn!(stage = %name, attempt, error = %cause, "Stage attempt failed");
            self.events.try_emit(
                "stage.failed",
                Some(json!({
                    "stage": name,
                    "attempt": attempt,
                    "code": cause.code(),
                })),
            );

            let Some(delay) = delay else {
                return Err(AttemptError::Failed(cause));
            };

            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            debug!(stage = %name, next_attempt = attempt + 1, delay_ms, "Retrying stage");
            self.events.try_emit(
                "stage.retrying",
                Some(json!({ "stage": name, "attempt": attempt + 1, "delay_ms": delay_ms })),
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One spawn plus readiness wait.
    async fn attempt_stage(
        &self,
        stage: &Stage,
        upstream: &BTreeMap<String, StageOutput>,
        attempt: u32,
    ) -> Result<StageOutput, AttemptError> {
        let name = stage.name();
        let resolved = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
            resolved = stage.resolve(upstream, self.config.defaults) => {
                resolved.map_err(AttemptError::Failed)?
            }
        };
        if self.cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        let handle = ProcessHandle::start(name, &resolved.launch, &self.config.log_sink)
            .map_err(|e| AttemptError::Failed(e.into()))?;
        let liveness = handle.liveness();
        let pid = handle.pid();

        self.update(|arena| {
            if !arena.started.iter().any(|s| s == name) {
                arena.started.push(name.to_string());
            }
            let slot = arena.slot_mut(name);
            slot.state = ProcessState::Starting;
            slot.grace_period = resolved.grace_period;
            slot.handle = Some(handle);
        });
        info!(stage = %name, pid, attempt, command = %resolved.launch.program, "Stage spawned");
        self.events.try_emit(
            "stage.spawned",
            Some(json!({ "stage": name, "pid": pid, "attempt": attempt })),
        );

        let probed: Result<u32, StageError> = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
            status = liveness.exited(EXIT_POLL_INTERVAL) => Err(UnexpectedExitError {
                stage: name.to_string(),
                pid,
                status,
            }
            .into()),
            outcome = resolved.probe.await_ready() => match outcome {
                ProbeOutcome::Ready { attempts } => Ok(attempts),
                ProbeOutcome::TimedOut { attempts } => Err(ProbeTimeoutError {
                    stage: name.to_string(),
                    attempts,
                    deadline: resolved.probe.deadline(),
                }
                .into()),
            },
        };

        match probed {
            Ok(probes) => {
                self.update(|arena| {
                    let slot = arena.slot_mut(name);
                    slot.state = ProcessState::Running;
                    slot.retry_pending = false;
                    slot.output = Some(resolved.output.clone());
                    if let Some(handle) = slot.handle.as_mut() {
                        handle.transition(ProcessState::Running);
                    }
                });
                info!(stage = %name, pid, probes, "Stage ready");
                self.events.try_emit(
                    "stage.ready",
                    Some(json!({ "stage": name, "pid": pid, "probes": probes })),
                );
                Ok(resolved.output)
            }
            Err(cause) => {
                self.discard(name).await;
                Err(AttemptError::Failed(cause))
            }
        }
    }

    /// Stops and drops a stage's handle without touching its slot state.
    async fn discard(&self, name: &str) {
        let taken = self.update(|arena| {
            let slot = arena.slot_mut(name);
            slot.handle.take().map(|h| (h, slot.grace_period))
        });
        if let Some((mut handle, grace)) = taken {
            if let Err(e) = handle.stop(grace).await {
                warn!(stage = %name, error = %e, "Failed attempt did not stop cleanly");
            }
        }
    }

    /// Handles one exit reported by the liveness watch.
    ///
    /// Returns false once the pipeline has failed or been cancelled.
    async fn handle_exit(&self, notice: ExitNotice) -> bool {
        let Some(spec) = self.pipeline.stage(&notice.stage) else {
            return true;
        };
        let policy = spec.restart;

        let restart = self.update(|arena| {
            let slot = arena.slots.get_mut(&notice.stage)?;
            let current_pid = slot.handle.as_ref().map(ProcessHandle::pid);
            if slot.state != ProcessState::Running || current_pid != Some(notice.pid) {
                return None;
            }
            slot.state = ProcessState::Failed;
            slot.retry_pending = slot.restarts_used < policy.runtime_budget();
            if slot.retry_pending {
                slot.restarts_used += 1;
            }
            Some(slot.retry_pending)
        });
        let Some(restart) = restart else {
            debug!(stage = %notice.stage, pid = notice.pid, "Ignoring stale exit notice");
            return true;
        };

        warn!(stage = %notice.stage, pid = notice.pid, status = %notice.status, "Stage exited unexpectedly");
        self.events.try_emit(
            "stage.exited",
            Some(json!({ "stage": notice.stage, "pid": notice.pid, "status": notice.status })),
        );
        self.discard(&notice.stage).await;

        if restart {
            self.events
                .emit("pipeline.degraded", Some(json!({ "stage": notice.stage })))
                .await;
            let upstream = self.collect_upstream(&notice.stage);
            let _startup = self.startup_lock.lock().await;
            match self.start_stage(&Stage::new(spec.clone()), &upstream).await {
                Ok(_) => {
                    info!(stage = %notice.stage, "Stage restarted, pipeline ready again");
                    self.events
                        .emit(
                            "pipeline.ready",
                            Some(json!({ "stages": self.pipeline.len(), "restarted": notice.stage })),
                        )
                        .await;
                    return true;
                }
                Err(AttemptError::Cancelled) => {
                    self.teardown().await;
                    return false;
                }
                Err(AttemptError::Failed(cause)) => {
                    error!(stage = %notice.stage, error = %cause, "Stage restart failed");
                }
            }
        } else {
            let cause = StageError::from(UnexpectedExitError {
                stage: notice.stage.clone(),
                pid: notice.pid,
                status: notice.status.clone(),
            });
            error!(stage = %notice.stage, error = %cause, "No restart budget left");
        }

        self.events
            .emit("pipeline.failed", Some(json!({ "stage": notice.stage })))
            .await;
        self.teardown().await;
        false
    }

    fn collect_upstream(&self, name: &str) -> BTreeMap<String, StageOutput> {
        let Some(spec) = self.pipeline.stage(name) else {
            return BTreeMap::new();
        };
        let arena = self.arena.lock();
        spec.dependencies
            .iter()
            .filter_map(|dep| {
                let output = arena.slots.get(dep)?.output.clone()?;
                Some((dep.clone(), output))
            })
            .collect()
    }

    async fn abort_cancelled(&self) -> DeskgateError {
        let reason = self.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        info!(reason = %reason, "Startup cancelled, tearing down");
        self.teardown().await;
        DeskgateError::Cancelled(reason)
    }

    /// Stops every handle in reverse observed start order.
    async fn teardown(&self) -> Vec<StopError> {
        let _guard = self.teardown_lock.lock().await;
        let order: Vec<String> = self.arena.lock().started.iter().rev().cloned().collect();
        let mut errors = Vec::new();

        for name in order {
            let taken = self.update(|arena| {
                let slot = arena.slots.get_mut(&name)?;
                let handle = slot.handle.take()?;
                if slot.state != ProcessState::Failed {
                    slot.state = ProcessState::Stopping;
                }
                Some((handle, slot.grace_period))
            });
            let Some((mut handle, grace)) = taken else {
                continue;
            };

            let pid = handle.pid();
            self.events
                .try_emit("stage.stopping", Some(json!({ "stage": name, "pid": pid })));

            let forced = match handle.stop(grace).await {
                Ok(_) => false,
                Err(e) => {
                    warn!(stage = %name, pid, error = %e, "Stage did not stop gracefully");
                    errors.push(e);
                    true
                }
            };
            drop(handle);

            self.update(|arena| {
                if let Some(slot) = arena.slots.get_mut(&name) {
                    if slot.state != ProcessState::Failed {
                        slot.state = ProcessState::Stopped;
                    }
                    slot.retry_pending = false;
                }
            });
            debug!(stage = %name, pid, forced, "Stage stopped");
            self.events.try_emit(
                "stage.stopped",
                Some(json!({ "stage": name, "pid": pid, "forced": forced })),
            );
        }

        errors
    }

    /// Mutates the arena and republishes the snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut HandleArena) -> R) -> R {
        let mut arena = self.arena.lock();
        let result = f(&mut arena);
        self.publish(&arena);
        result
    }

    fn publish(&self, arena: &HandleArena) {
        let names: Vec<&String> = if arena.order.is_empty() {
            self.pipeline.specs().map(|s| &s.name).collect()
        } else {
            arena.order.iter().collect()
        };

        let stages: Vec<StageSnapshot> = names
            .into_iter()
            .map(|name| match arena.slots.get(name) {
                Some(slot) => StageSnapshot {
                    name: name.clone(),
                    state: slot.state,
                    retry_pending: slot.retry_pending,
                    attempts: slot.retry.attempts,
                    pid: slot.handle.as_ref().map(ProcessHandle::pid),
                },
                None => StageSnapshot::pending(name.clone()),
            })
            .collect();

        let status = PipelineStatus::derive(&stages, self.stopped.load(Ordering::SeqCst));
        let endpoint = if status.state == PipelineState::Ready {
            arena
                .endpoint_stage
                .as_ref()
                .and_then(|name| arena.slots.get(name))
                .and_then(|slot| slot.output.as_ref())
                .and_then(StageOutput::stream_endpoint)
        } else {
            None
        };

        *self.snapshot.write() = Snapshot {
            status,
            stages,
            endpoint,
        };
    }
}

impl PipelineView for PipelineOrchestrator {
    fn status(&self) -> PipelineStatus {
        self.snapshot.read().status.clone()
    }

    fn stream_endpoint(&self) -> Option<StreamEndpoint> {
        self.snapshot.read().endpoint.clone()
    }
}

impl WatchTargets for PipelineOrchestrator {
    fn watch_targets(&self) -> Vec<Liveness> {
        self.arena
            .lock()
            .slots
            .values()
            .filter(|slot| slot.state == ProcessState::Running)
            .filter_map(|slot| slot.handle.as_ref().map(ProcessHandle::liveness))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineBuilder, StageSpec};
    use crate::readiness::ReadinessPolicy;

    fn sleeper(name: &str) -> StageSpec {
        StageSpec::new(name, "sleep")
            .with_args(["30"])
            .with_readiness(ReadinessPolicy::fixed_delay(Duration::from_millis(20)))
    }

    fn orchestrator(specs: Vec<StageSpec>) -> PipelineOrchestrator {
        let pipeline = PipelineBuilder::new("test").stages(specs).build().unwrap();
        PipelineOrchestrator::new(pipeline, OrchestratorConfig::default())
    }

    #[test]
    fn test_initial_status_pending() {
        let orch = orchestrator(vec![sleeper("a")]);
        let status = orch.status();
        assert_eq!(status.state, PipelineState::Pending);
        assert_eq!(status.ready_stage_count, 0);
        assert!(orch.stream_endpoint().is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop_single_stage() {
        let orch = orchestrator(vec![sleeper("a")]);

        orch.start_all().await.unwrap();
        assert_eq!(orch.status().state, PipelineState::Ready);
        assert_eq!(orch.status().ready_stage_count, 1);
        let pid = orch.stage_snapshots()[0].pid;
        assert!(pid.is_some());

        assert!(orch.stop_all().await.is_empty());
        assert_eq!(orch.status().state, PipelineState::Stopped);
        assert_eq!(orch.stage_snapshots()[0].state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_start_all_is_single_shot() {
        let orch = orchestrator(vec![sleeper("a")]);
        orch.start_all().await.unwrap();

        assert!(matches!(orch.start_all().await, Err(DeskgateError::AlreadyStarted)));
        orch.stop_all().await;
    }

    #[tokio::test]
    async fn test_cancel_before_start_spawns_nothing() {
        let orch = orchestrator(vec![sleeper("a")]);
        orch.cancel("shutdown");

        let err = orch.start_all().await.unwrap_err();
        assert!(matches!(err, DeskgateError::Cancelled(ref r) if r == "shutdown"));
        assert!(orch.start_order().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_exit_is_stage_failure() {
        let orch = orchestrator(vec![StageSpec::new("quitter", "sh")
            .with_args(["-c", "exit 2"])
            .with_readiness(ReadinessPolicy::fixed_delay(Duration::from_secs(5)))]);

        let err = orch.start_all().await.unwrap_err();
        let DeskgateError::PipelineStart(err) = err else {
            panic!("expected start error, got {err:?}");
        };
        assert!(matches!(err.cause, StageError::UnexpectedExit(_)));
        assert_eq!(orch.status().failed_stage.as_deref(), Some("quitter"));
    }

    #[tokio::test]
    async fn test_supervise_returns_when_not_ready() {
        let orch = orchestrator(vec![sleeper("a")]);
        tokio::time::timeout(Duration::from_millis(200), orch.supervise())
            .await
            .unwrap();
    }
}
