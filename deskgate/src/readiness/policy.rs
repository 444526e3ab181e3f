//! Readiness policies.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub(crate) const DEFAULT_INTERVAL_MS: u64 = 200;
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 50;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// How a stage proves it is accepting work.
///
/// In TOML:
///
/// ```toml
/// readiness = { kind = "socket", port = 5901 }
/// readiness = { kind = "file", path = "/tmp/.X11-unix/X1" }
/// readiness = { kind = "fixed-delay", delay_ms = 2000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReadinessPolicy {
    /// Connect to `(host, port)`; an accepted connection means ready.
    Socket {
        /// Host to connect to.
        #[serde(default = "default_host")]
        host: String,
        /// Port to connect to.
        port: u16,
        /// Delay between attempts.
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
        /// Attempt bound.
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },

    /// Wait for a path to exist (optionally with content).
    File {
        /// Path to poll.
        path: PathBuf,
        /// Also require a non-empty file.
        #[serde(default)]
        require_non_empty: bool,
        /// Ignore a file last modified before the probe was created, such
        /// as a socket left behind by an earlier run.
        #[serde(default)]
        require_fresh: bool,
        /// Delay between attempts.
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
        /// Attempt bound.
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },

    /// Wait unconditionally. The weakest guarantee; only for stages with
    /// nothing observable to probe.
    FixedDelay {
        /// How long to wait.
        delay_ms: u64,
    },
}

impl ReadinessPolicy {
    /// Socket probe with default interval and attempts.
    #[must_use]
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self::Socket {
            host: host.into(),
            port,
            interval_ms: DEFAULT_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// File-existence probe with default interval and attempts.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            require_non_empty: false,
            require_fresh: false,
            interval_ms: DEFAULT_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Fixed-delay readiness.
    #[must_use]
    pub fn fixed_delay(delay: Duration) -> Self {
        Self::FixedDelay {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Requires the probed file to be non-empty. No effect on other kinds.
    #[must_use]
    pub fn non_empty(mut self) -> Self {
        if let Self::File {
            require_non_empty, ..
        } = &mut self
        {
            *require_non_empty = true;
        }
        self
    }

    /// Rejects files older than the probe. No effect on other kinds.
    #[must_use]
    pub fn fresh(mut self) -> Self {
        if let Self::File { require_fresh, .. } = &mut self {
            *require_fresh = true;
        }
        self
    }

    /// Sets the polling interval. No effect on fixed delays.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        match &mut self {
            Self::Socket { interval_ms, .. } | Self::File { interval_ms, .. } => *interval_ms = ms,
            Self::FixedDelay { .. } => {}
        }
        self
    }

    /// Sets the attempt bound. No effect on fixed delays.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        match &mut self {
            Self::Socket { max_attempts, .. } | Self::File { max_attempts, .. } => {
                *max_attempts = attempts.max(1);
            }
            Self::FixedDelay { .. } => {}
        }
        self
    }

    /// Short description for logs and `deskgate plan`.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Socket {
                host,
                port,
                interval_ms,
                max_attempts,
            } => format!("socket {host}:{port} every {interval_ms}ms x{max_attempts}"),
            Self::File {
                path,
                require_non_empty,
                require_fresh,
                interval_ms,
                max_attempts,
            } => {
                let what = if *require_non_empty { "non-empty file" } else { "file" };
                let age = if *require_fresh { "fresh " } else { "" };
                format!("{age}{what} {} every {interval_ms}ms x{max_attempts}", path.display())
            }
            Self::FixedDelay { delay_ms } => format!("fixed delay {delay_ms}ms"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Deserialize)]
    struct Holder {
        readiness: ReadinessPolicy,
    }

    fn parse(toml_src: &str) -> ReadinessPolicy {
        toml::from_str::<Holder>(toml_src).unwrap().readiness
    }

    #[test]
    fn test_socket_from_toml_uses_defaults() {
        assert_eq!(
            parse(r#"readiness = { kind = "socket", port = 5901 }"#),
            ReadinessPolicy::socket("127.0.0.1", 5901)
        );
    }

    #[test]
    fn test_file_and_fixed_delay_from_toml() {
        assert_eq!(
            parse(r#"readiness = { kind = "file", path = "/tmp/x", require_non_empty = true, max_attempts = 5 }"#),
            ReadinessPolicy::file("/tmp/x").non_empty().with_max_attempts(5)
        );
        assert_eq!(
            parse(r#"readiness = { kind = "fixed-delay", delay_ms = 1000 }"#),
            ReadinessPolicy::fixed_delay(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_builders_ignore_fixed_delay() {
        let policy = ReadinessPolicy::fixed_delay(Duration::from_millis(5))
            .with_interval(Duration::from_millis(1))
            .with_max_attempts(9)
            .non_empty()
            .fresh();
        assert_eq!(policy, ReadinessPolicy::FixedDelay { delay_ms: 5 });
    }

    #[test]
    fn test_describe() {
        let policy = ReadinessPolicy::socket("127.0.0.1", 6080)
            .with_interval(Duration::from_millis(150))
            .with_max_attempts(10);
        assert_eq!(policy.describe(), "socket 127.0.0.1:6080 every 150ms x10");

        let policy = ReadinessPolicy::file("/tmp/.X11-unix/X1").fresh().with_max_attempts(3);
        assert_eq!(policy.describe(), "fresh file /tmp/.X11-unix/X1 every 200ms x3");
    }
}
