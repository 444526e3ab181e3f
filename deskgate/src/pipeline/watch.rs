//! Background liveness watch.
//!
//! The watch never touches the handle arena directly. It polls
//! [`Liveness`] views and reports exits as [`ExitNotice`] messages; the
//! orchestrator decides whether to restart or abort.

use crate::process::Liveness;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A process the watch found dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNotice {
    /// The stage name.
    pub stage: String,
    /// The pid that exited.
    pub pid: u32,
    /// Human readable exit status.
    pub status: String,
}

/// Source of the processes to watch.
pub trait WatchTargets: Send + Sync {
    /// Liveness views of the stages currently expected to be running.
    fn watch_targets(&self) -> Vec<Liveness>;
}

/// Periodic poller over [`WatchTargets`].
#[derive(Debug, Clone, Copy)]
pub struct LivenessWatch {
    interval: Duration,
}

impl LivenessWatch {
    /// Creates a watch polling every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Polls until the receiving side of `notices` is dropped.
    ///
    /// Each pid is reported at most once.
    pub async fn run<T: WatchTargets + ?Sized>(&self, targets: &T, notices: mpsc::Sender<ExitNotice>) {
        let mut reported = HashSet::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if notices.is_closed() {
                return;
            }

            for target in targets.watch_targets() {
                if reported.contains(&target.pid()) {
                    continue;
                }
                let Some(status) = target.exit_status() else {
                    continue;
                };
                debug!(stage = %target.stage(), pid = target.pid(), %status, "Liveness watch saw exit");
                reported.insert(target.pid());

                let notice = ExitNotice {
                    stage: target.stage().to_string(),
                    pid: target.pid(),
                    status,
                };
                if notices.send(notice).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{LaunchSpec, LogSink, ProcessHandle};
    use parking_lot::Mutex;

    struct Fixed(Mutex<Vec<ProcessHandle>>);

    impl WatchTargets for Fixed {
        fn watch_targets(&self) -> Vec<Liveness> {
            self.0.lock().iter().map(ProcessHandle::liveness).collect()
        }
    }

    fn sh(name: &str, script: &str) -> ProcessHandle {
        ProcessHandle::start(name, &LaunchSpec::new("sh").with_args(["-c", script]), &LogSink::Discard).unwrap()
    }

    #[tokio::test]
    async fn test_reports_exit_once() {
        let targets = Fixed(Mutex::new(vec![
            sh("steady", "exec sleep 30"),
            sh("flaky", "sleep 0.1; exit 7"),
        ]));
        let (tx, mut rx) = mpsc::channel(4);
        let watch = LivenessWatch::new(Duration::from_millis(20));

        let notice = tokio::select! {
            () = watch.run(&targets, tx) => None,
            notice = rx.recv() => notice,
        };
        let notice = notice.unwrap();
        assert_eq!(notice.stage, "flaky");
        assert_eq!(notice.status, "exit code 7");
    }

    #[tokio::test]
    async fn test_stops_when_receiver_dropped() {
        let targets = Fixed(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        tokio::time::timeout(
            Duration::from_secs(1),
            LivenessWatch::new(Duration::from_millis(10)).run(&targets, tx),
        )
        .await
        .unwrap();
    }
}
