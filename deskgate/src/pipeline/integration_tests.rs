//! Integration tests for pipeline execution against real child processes.

#[cfg(test)]
mod tests {
    use crate::core::{PipelineState, ProcessState};
    use crate::credential::CredentialSpec;
    use crate::errors::{DeskgateError, StageError};
    use crate::events::CollectingEventSink;
    use crate::pipeline::{
        OrchestratorConfig, PipelineBuilder, PipelineOrchestrator, PipelineView, RestartPolicy,
        StageSpec,
    };
    use crate::process::LogSink;
    use crate::readiness::ReadinessPolicy;
    use crate::testing::{counting_crasher, free_port, listener, pid_running, sleeper, spawn_count};
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn orchestrator(
        specs: Vec<StageSpec>,
        config: OrchestratorConfig,
    ) -> (PipelineOrchestrator, Arc<CollectingEventSink>) {
        let pipeline = PipelineBuilder::new("test").stages(specs).build().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let orch = PipelineOrchestrator::new(pipeline, config).with_event_sink(events.clone());
        (orch, events)
    }

    fn pids(orch: &PipelineOrchestrator) -> Vec<u32> {
        orch.stage_snapshots().iter().filter_map(|s| s.pid).collect()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stages_start_in_dependency_order_and_stop_in_reverse() {
        let (orch, events) = orchestrator(
            vec![
                sleeper("c").with_dependency("b"),
                sleeper("a"),
                sleeper("b").with_dependency("a"),
            ],
            OrchestratorConfig::default(),
        );

        orch.start_all().await.unwrap();
        assert_eq!(orch.start_order(), vec!["a", "b", "c"]);
        assert_eq!(events.stages_for("stage.ready"), vec!["a", "b", "c"]);
        assert_eq!(orch.status().state, PipelineState::Ready);
        assert_eq!(orch.status().ready_stage_count, 3);

        orch.stop_all().await;
        assert_eq!(events.stages_for("stage.stopping"), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_stop_all_leaves_no_processes() {
        let (orch, _) = orchestrator(
            vec![
                sleeper("a"),
                StageSpec::new("forker", "sh")
                    .with_args(["-c", "sleep 30 & sleep 30 & wait"])
                    .with_dependency("a")
                    .with_readiness(ReadinessPolicy::fixed_delay(Duration::from_millis(50))),
            ],
            OrchestratorConfig::default(),
        );

        orch.start_all().await.unwrap();
        let running = pids(&orch);
        assert_eq!(running.len(), 2);

        assert!(orch.stop_all().await.is_empty());
        for pid in running {
            assert!(!pid_running(pid), "pid {pid} survived teardown");
        }
        assert!(orch
            .stage_snapshots()
            .iter()
            .all(|s| s.state == ProcessState::Stopped && s.pid.is_none()));
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let (orch, events) = orchestrator(vec![sleeper("a")], OrchestratorConfig::default());
        orch.start_all().await.unwrap();

        orch.stop_all().await;
        assert!(orch.stop_all().await.is_empty());
        assert_eq!(events.events_of_type("pipeline.stopped").len(), 1);
        assert_eq!(events.stages_for("stage.stopping"), vec!["a"]);
        assert_eq!(orch.status().state, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_harmless() {
        let (orch, _) = orchestrator(vec![sleeper("a")], OrchestratorConfig::default());
        assert!(orch.stop_all().await.is_empty());
        assert!(matches!(orch.start_all().await, Err(DeskgateError::Cancelled(_))));
        assert!(orch.start_order().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_spawn() {
        let (orch, events) = orchestrator(
            vec![
                sleeper("a").with_dependency("b"),
                sleeper("b").with_dependency("a"),
            ],
            OrchestratorConfig::default(),
        );

        let err = orch.start_all().await.unwrap_err();
        let DeskgateError::CycleDetected(cycle) = err else {
            panic!("expected cycle error, got {err:?}");
        };
        assert_eq!(cycle.cycle_path, vec!["a", "b", "a"]);
        assert!(orch.start_order().is_empty());
        assert!(events.events_of_type("stage.spawned").is_empty());
    }

    #[tokio::test]
    async fn test_retry_bound_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let (orch, events) = orchestrator(
            vec![counting_crasher("flaky", &counter, 3)],
            OrchestratorConfig::default(),
        );

        let err = orch.start_all().await.unwrap_err();
        let DeskgateError::PipelineStart(err) = err else {
            panic!("expected start error, got {err:?}");
        };
        assert_eq!(err.failed_stage, "flaky");
        assert!(matches!(err.cause, StageError::UnexpectedExit(_)));

        assert_eq!(spawn_count(&counter), 3);
        assert_eq!(events.events_of_type("stage.spawned").len(), 3);
        assert_eq!(events.events_of_type("stage.retrying").len(), 2);
        assert_eq!(orch.stage_snapshots()[0].attempts, 3);

        let status = orch.status();
        assert_eq!(status.state, PipelineState::Failed);
        assert_eq!(status.failed_stage.as_deref(), Some("flaky"));
    }

    #[tokio::test]
    async fn test_never_policy_spawns_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let (orch, _) = orchestrator(
            vec![counting_crasher("once", &counter, 1).with_restart(RestartPolicy::Never)],
            OrchestratorConfig::default(),
        );

        assert!(orch.start_all().await.is_err());
        assert_eq!(spawn_count(&counter), 1);
    }

    #[tokio::test]
    async fn test_missing_executable_tears_down_earlier_stages() {
        let (orch, events) = orchestrator(
            vec![
                sleeper("display"),
                StageSpec::new("framebuffer", "deskgate-no-such-binary")
                    .with_dependency("display")
                    .with_output("host", "127.0.0.1")
                    .with_output("port", "5901"),
                sleeper("bridge")
                    .with_dependency("framebuffer")
                    .with_args(["{framebuffer.port}"]),
            ],
            OrchestratorConfig::default(),
        );

        let err = orch.start_all().await.unwrap_err();
        let DeskgateError::PipelineStart(err) = err else {
            panic!("expected start error, got {err:?}");
        };
        assert_eq!(err.failed_stage, "framebuffer");
        assert!(matches!(err.cause, StageError::Spawn(ref e) if e.is_not_found()));

        let snapshots = orch.stage_snapshots();
        assert_eq!(snapshots[0].state, ProcessState::Stopped);
        assert_eq!(snapshots[1].state, ProcessState::Failed);
        assert_eq!(snapshots[2].state, ProcessState::Pending);
        assert_eq!(snapshots[2].attempts, 0);
        assert_eq!(events.stages_for("stage.spawned"), vec!["display"]);
        assert_eq!(events.stages_for("stage.stopping"), vec!["display"]);

        let status = orch.status();
        assert_eq!(status.state, PipelineState::Failed);
        assert_eq!(status.failed_stage.as_deref(), Some("framebuffer"));
        assert!(orch.stream_endpoint().is_none());
    }

    #[tokio::test]
    async fn test_probe_timeout_fails_stage() {
        let port = free_port().unwrap();
        let (orch, _) = orchestrator(
            vec![sleeper("silent").with_readiness(
                ReadinessPolicy::socket("127.0.0.1", port)
                    .with_interval(Duration::from_millis(20))
                    .with_max_attempts(5),
            )],
            OrchestratorConfig::default(),
        );

        let err = orch.start_all().await.unwrap_err();
        let DeskgateError::PipelineStart(err) = err else {
            panic!("expected start error, got {err:?}");
        };
        assert!(matches!(err.cause, StageError::ProbeTimeout(ref e) if e.attempts == 5));
        assert!(pids(&orch).is_empty());
    }

    #[tokio::test]
    async fn test_desktop_chain_end_to_end() {
        let logs = tempfile::tempdir().unwrap();
        let framebuffer_port = free_port().unwrap();
        let bridge_port = free_port().unwrap();

        let (orch, _) = orchestrator(
            vec![
                sleeper("display"),
                listener("framebuffer", framebuffer_port, std::iter::empty::<String>())
                    .with_dependency("display"),
                listener(
                    "bridge",
                    bridge_port,
                    ["{framebuffer.host}:{framebuffer.port}"],
                )
                .with_dependency("framebuffer")
                .with_output("path", format!("/vnc.html?port={bridge_port}")),
            ],
            OrchestratorConfig::default().with_log_sink(LogSink::Directory(logs.path().to_path_buf())),
        );

        orch.start_all().await.unwrap();
        assert!(orch.status().is_ready());

        let endpoint = orch.stream_endpoint().unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, bridge_port);
        assert_eq!(endpoint.path_prefix, format!("/vnc.html?port={bridge_port}"));

        let bridge_log = logs.path().join("bridge.log");
        let expected = format!("127.0.0.1:{framebuffer_port}");
        wait_for(|| {
            std::fs::read_to_string(&bridge_log).is_ok_and(|log| log.contains(&expected))
        })
        .await;

        orch.stop_all().await;
        assert!(orch.stream_endpoint().is_none());
        assert!(std::net::TcpStream::connect(("127.0.0.1", bridge_port)).is_err());
    }

    #[tokio::test]
    async fn test_cancel_during_startup_tears_down() {
        let (orch, events) = orchestrator(
            vec![
                sleeper("a"),
                sleeper("b")
                    .with_dependency("a")
                    .with_readiness(ReadinessPolicy::fixed_delay(Duration::from_secs(10))),
            ],
            OrchestratorConfig::default(),
        );
        let orch = Arc::new(orch);

        let starting = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_all().await }
        });
        wait_for(|| events.stages_for("stage.spawned").len() == 2).await;
        let running = pids(&orch);
        orch.cancel("test shutdown");

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(DeskgateError::Cancelled(ref r)) if r == "test shutdown"));
        assert_eq!(events.stages_for("stage.stopping"), vec!["b", "a"]);
        for pid in running {
            assert!(!pid_running(pid));
        }
    }

    #[tokio::test]
    async fn test_stop_during_credential_preparation_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let credential = CredentialSpec::new(dir.path().join("passwd"), SecretString::from("vncpass"))
            .with_store_command(["sh", "-c", r#"sleep 1.5; printf x > "$0""#, "{path}"]);
        let (orch, events) = orchestrator(
            vec![sleeper("fb").with_credential(credential)],
            OrchestratorConfig::default(),
        );
        let orch = Arc::new(orch);

        let starting = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_all().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopping = Instant::now();
        assert!(orch.stop_all().await.is_empty());
        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert!(events.stages_for("stage.spawned").is_empty());

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(DeskgateError::Cancelled(_))));

        // Past the point where the store command would have finished.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(events.stages_for("stage.spawned").is_empty());
        assert!(orch.start_order().is_empty());
        assert_eq!(orch.status().state, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_stop_during_readiness_wait_leaves_no_child() {
        let port = free_port().unwrap();
        let (orch, events) = orchestrator(
            vec![
                sleeper("a"),
                sleeper("b")
                    .with_dependency("a")
                    .with_readiness(ReadinessPolicy::socket("127.0.0.1", port))
                    .with_deadline(Duration::from_secs(30)),
            ],
            OrchestratorConfig::default(),
        );
        let orch = Arc::new(orch);

        let starting = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_all().await }
        });
        wait_for(|| events.stages_for("stage.spawned").len() == 2).await;
        let running = pids(&orch);
        assert_eq!(running.len(), 2);

        orch.stop_all().await;
        for pid in &running {
            assert!(!pid_running(*pid), "pid {pid} outlived stop_all");
        }
        assert_eq!(events.stages_for("stage.stopping"), vec!["b", "a"]);
        assert!(matches!(starting.await.unwrap(), Err(DeskgateError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_runtime_exit_restarts_until_budget_spent() {
        let (orch, events) = orchestrator(
            vec![
                sleeper("display"),
                StageSpec::new("session", "sh")
                    .with_args(["-c", "sleep 0.3; exit 1"])
                    .with_dependency("display")
                    .with_readiness(ReadinessPolicy::fixed_delay(Duration::from_millis(20)))
                    .with_restart(RestartPolicy::on_failure(2)),
            ],
            OrchestratorConfig::default().with_watch_interval(Duration::from_millis(50)),
        );
        let orch = Arc::new(orch);

        orch.start_all().await.unwrap();
        let supervising = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.supervise().await }
        });

        wait_for(|| !events.events_of_type("pipeline.degraded").is_empty()).await;
        wait_for(|| events.events_of_type("pipeline.ready").len() >= 2).await;

        tokio::time::timeout(Duration::from_secs(10), supervising)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(events.stages_for("pipeline.degraded"), vec!["session", "session"]);
        assert_eq!(events.stages_for("stage.exited"), vec!["session", "session", "session"]);
        let status = orch.status();
        assert_eq!(status.state, PipelineState::Failed);
        assert_eq!(status.failed_stage.as_deref(), Some("session"));
        assert!(pids(&orch).is_empty());
    }

    #[tokio::test]
    async fn test_supervise_stops_on_cancel() {
        let (orch, _) = orchestrator(
            vec![sleeper("a")],
            OrchestratorConfig::default().with_watch_interval(Duration::from_millis(20)),
        );
        let orch = Arc::new(orch);
        orch.start_all().await.unwrap();

        let supervising = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.supervise().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        orch.cancel("done");

        tokio::time::timeout(Duration::from_secs(2), supervising)
            .await
            .unwrap()
            .unwrap();
        orch.stop_all().await;
        assert_eq!(orch.status().state, PipelineState::Stopped);
    }
}
