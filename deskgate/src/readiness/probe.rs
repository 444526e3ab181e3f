//! Bounded readiness polling.

use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::trace;

use super::ReadinessPolicy;

/// Upper bound on a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of waiting for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The condition was observed.
    Ready {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// The deadline or attempt bound ran out first.
    TimedOut {
        /// Attempts made.
        attempts: u32,
    },
}

impl ProbeOutcome {
    /// Returns true for [`ProbeOutcome::Ready`].
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// A readiness policy bound to a deadline.
///
/// Files modified before the probe was created count as stale for policies
/// that require a fresh file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    policy: ReadinessPolicy,
    deadline: Duration,
    not_before: SystemTime,
}

impl ReadinessProbe {
    /// Creates a probe. Create it before spawning the stage it watches.
    #[must_use]
    pub fn new(policy: ReadinessPolicy, deadline: Duration) -> Self {
        Self {
            policy,
            deadline,
            not_before: SystemTime::now(),
        }
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Returns the deadline.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Polls until ready, the attempt bound, or the deadline.
    ///
    /// Timing out is a failure for the owning stage, never an implicit
    /// success.
    pub async fn await_ready(&self) -> ProbeOutcome {
        let until = Instant::now() + self.deadline;

        match &self.policy {
            ReadinessPolicy::FixedDelay { delay_ms } => {
                let delay = Duration::from_millis(*delay_ms);
                if delay > self.deadline {
                    tokio::time::sleep(self.deadline).await;
                    return ProbeOutcome::TimedOut { attempts: 1 };
                }
                tokio::time::sleep(delay).await;
                ProbeOutcome::Ready { attempts: 1 }
            }
            ReadinessPolicy::Socket {
                host,
                port,
                interval_ms,
                max_attempts,
            } => {
                poll(until, *interval_ms, *max_attempts, |remaining| {
                    socket_accepts(host, *port, remaining)
                })
                .await
            }
            ReadinessPolicy::File {
                path,
                require_non_empty,
                require_fresh,
                interval_ms,
                max_attempts,
            } => {
                let not_before = require_fresh.then_some(self.not_before);
                poll(until, *interval_ms, *max_attempts, |_| {
                    file_present(path, *require_non_empty, not_before)
                })
                .await
            }
        }
    }
}

async fn poll<F, Fut>(until: Instant, interval_ms: u64, max_attempts: u32, mut check: F) -> ProbeOutcome
where
    F: FnMut(Duration) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let interval = Duration::from_millis(interval_ms);
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let remaining = until.saturating_duration_since(Instant::now());
        if check(remaining).await {
            return ProbeOutcome::Ready { attempts };
        }
        trace!(attempts, "Readiness check not satisfied yet");

        let remaining = until.saturating_duration_since(Instant::now());
        if attempts >= max_attempts || remaining.is_zero() {
            return ProbeOutcome::TimedOut { attempts };
        }
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

/// Connects and immediately closes. No data is sent.
async fn socket_accepts(host: &str, port: u16, remaining: Duration) -> bool {
    let budget = CONNECT_TIMEOUT.min(remaining).max(Duration::from_millis(1));
    matches!(
        tokio::time::timeout(budget, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

async fn file_present(path: &Path, require_non_empty: bool, not_before: Option<SystemTime>) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    if require_non_empty && meta.len() == 0 {
        return false;
    }
    match not_before {
        Some(not_before) => meta.modified().is_ok_and(|modified| modified >= not_before),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_socket_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = ReadinessProbe::new(
            ReadinessPolicy::socket("127.0.0.1", port),
            Duration::from_secs(2),
        );
        assert_eq!(probe.await_ready().await, ProbeOutcome::Ready { attempts: 1 });
    }

    #[tokio::test]
    async fn test_socket_ready_after_late_bind() {
        let port = closed_port().await;
        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        let probe = ReadinessProbe::new(
            ReadinessPolicy::socket("127.0.0.1", port).with_interval(Duration::from_millis(20)),
            Duration::from_secs(3),
        );
        let outcome = probe.await_ready().await;
        assert!(outcome.is_ready());
        assert!(matches!(outcome, ProbeOutcome::Ready { attempts } if attempts > 1));
        binder.abort();
    }

    #[tokio::test]
    async fn test_socket_attempt_bound() {
        let port = closed_port().await;
        let probe = ReadinessProbe::new(
            ReadinessPolicy::socket("127.0.0.1", port)
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(3),
            Duration::from_secs(5),
        );
        assert_eq!(probe.await_ready().await, ProbeOutcome::TimedOut { attempts: 3 });
    }

    #[tokio::test]
    async fn test_deadline_bounds_polling() {
        let port = closed_port().await;
        let probe = ReadinessProbe::new(
            ReadinessPolicy::socket("127.0.0.1", port)
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(10_000),
            Duration::from_millis(150),
        );

        let started = std::time::Instant::now();
        let outcome = probe.await_ready().await;
        assert!(!outcome.is_ready());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_file_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");
        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                tokio::fs::write(path, b"").await.unwrap();
            })
        };

        let probe = ReadinessProbe::new(
            ReadinessPolicy::file(&path).with_interval(Duration::from_millis(20)),
            Duration::from_secs(2),
        );
        assert!(probe.await_ready().await.is_ready());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_probe_requires_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        std::fs::write(&path, b"").unwrap();

        let probe = ReadinessProbe::new(
            ReadinessPolicy::file(&path)
                .non_empty()
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(3),
            Duration::from_secs(1),
        );
        assert_eq!(probe.await_ready().await, ProbeOutcome::TimedOut { attempts: 3 });

        std::fs::write(&path, b"secret").unwrap();
        assert!(probe.await_ready().await.is_ready());
    }

    #[tokio::test]
    async fn test_fresh_file_check_ignores_leftover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X1");
        std::fs::write(&path, b"").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let probe = ReadinessProbe::new(
            ReadinessPolicy::file(&path)
                .fresh()
                .with_interval(Duration::from_millis(10))
                .with_max_attempts(3),
            Duration::from_secs(1),
        );
        assert_eq!(probe.await_ready().await, ProbeOutcome::TimedOut { attempts: 3 });

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"").unwrap();
        assert!(probe.await_ready().await.is_ready());
    }

    #[tokio::test]
    async fn test_fixed_delay() {
        let probe = ReadinessProbe::new(
            ReadinessPolicy::fixed_delay(Duration::from_millis(30)),
            Duration::from_secs(1),
        );
        assert!(probe.await_ready().await.is_ready());

        let too_long = ReadinessProbe::new(
            ReadinessPolicy::fixed_delay(Duration::from_secs(5)),
            Duration::from_millis(20),
        );
        assert_eq!(too_long.await_ready().await, ProbeOutcome::TimedOut { attempts: 1 });
    }
}
