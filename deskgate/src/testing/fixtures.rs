//! Stage fixtures backed by small, always-available programs.

use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use crate::pipeline::{RestartPolicy, StageSpec};
use crate::readiness::ReadinessPolicy;

/// A TCP listener that prints its argv, accepts and closes connections.
///
/// argv: `<port> [anything...]`. The extra arguments are only echoed, so
/// tests can check how templates were rendered.
const LISTENER_SCRIPT: &str = r"
import socket, sys
print(' '.join(sys.argv[1:]), flush=True)
s = socket.socket()
s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)
s.bind(('127.0.0.1', int(sys.argv[1])))
s.listen(16)
while True:
    c, _ = s.accept()
    c.close()
";

/// Returns a TCP port that was free a moment ago.
///
/// # Errors
///
/// Returns an error if no ephemeral port could be bound.
pub fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// A stage that sleeps and is "ready" after a short fixed delay.
#[must_use]
pub fn sleeper(name: &str) -> StageSpec {
    StageSpec::new(name, "sleep")
        .with_args(["30"])
        .with_readiness(ReadinessPolicy::fixed_delay(Duration::from_millis(20)))
}

/// A stage that listens on `port` and is ready once the port accepts.
///
/// `extra_args` may contain templates; they are echoed to the stage log.
#[must_use]
pub fn listener<I, S>(name: &str, port: u16, extra_args: I) -> StageSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    StageSpec::new(name, "python3")
        .with_args(["-c".to_string(), LISTENER_SCRIPT.to_string(), port.to_string()])
        .with_args(extra_args)
        .with_readiness(
            ReadinessPolicy::socket("127.0.0.1", port).with_interval(Duration::from_millis(50)),
        )
        .with_output("host", "127.0.0.1")
        .with_output("port", port.to_string())
}

/// A stage that appends a line to `counter` and exits at once.
///
/// Every spawn is counted, so [`spawn_count`] tells how many attempts ran.
#[must_use]
pub fn counting_crasher(name: &str, counter: &Path, max_attempts: u32) -> StageSpec {
    StageSpec::new(name, "sh")
        .with_args([
            "-c".to_string(),
            r#"echo spawn >> "$0"; exit 1"#.to_string(),
            counter.to_string_lossy().into_owned(),
        ])
        .with_readiness(ReadinessPolicy::fixed_delay(Duration::from_secs(5)))
        .with_restart(RestartPolicy::on_failure(max_attempts).with_backoff(
            crate::pipeline::BackoffConfig::default().with_base_delay_ms(10),
        ))
}

/// Number of spawns recorded by a [`counting_crasher`].
#[must_use]
pub fn spawn_count(counter: &Path) -> usize {
    std::fs::read_to_string(counter)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Returns true if a process with this pid still runs (zombies count as gone).
#[must_use]
pub fn pid_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // Field 3 is the state; the command name in field 2 may contain spaces.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}
