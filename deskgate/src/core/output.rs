//! Resolved stage outputs and the stream endpoint derived from them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known output keys.
pub mod keys {
    /// Host a stage listens on.
    pub const HOST: &str = "host";
    /// Port a stage listens on.
    pub const PORT: &str = "port";
    /// Path prefix for HTTP-facing stages.
    pub const PATH: &str = "path";
    /// Credential file generated for the stage.
    pub const CREDENTIAL_PATH: &str = "credential_path";
}

/// Values a stage publishes to its dependents once it is ready.
///
/// Outputs are plain strings so they can be substituted into the command
/// templates of downstream stages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageOutput {
    values: BTreeMap<String, String>,
}

impl StageOutput {
    /// Creates an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an output from a map of values.
    #[must_use]
    pub fn from_values(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Adds a value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Sets a value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Gets a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the published host, if any.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.get(keys::HOST)
    }

    /// Returns the published port, if it parses.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.get(keys::PORT).and_then(|p| p.parse().ok())
    }

    /// Returns all values.
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Builds a stream endpoint from the host, port and path values.
    #[must_use]
    pub fn stream_endpoint(&self) -> Option<StreamEndpoint> {
        Some(StreamEndpoint {
            host: self.host()?.to_string(),
            port: self.port()?,
            path_prefix: self.get(keys::PATH).unwrap_or("/").to_string(),
        })
    }
}

/// Where the bridged desktop stream can be reached (`GetStreamEndpoint`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndpoint {
    /// Host the bridge listens on.
    pub host: String,
    /// Port the bridge listens on.
    pub port: u16,
    /// Path and query prefix of the web client.
    pub path_prefix: String,
}

impl StreamEndpoint {
    /// Builds the browser-facing URL for a request arriving at `public_host`.
    ///
    /// The bridge listens on its own port, so the URL reuses the host the
    /// browser used to reach the gate rather than the bridge's bind address.
    #[must_use]
    pub fn url_for(&self, scheme: &str, public_host: &str) -> String {
        let separator = if self.path_prefix.contains('?') { '&' } else { '?' };
        format!(
            "{scheme}://{public_host}:{port}{path}{separator}host={public_host}",
            port = self.port,
            path = self.path_prefix,
        )
    }
}
