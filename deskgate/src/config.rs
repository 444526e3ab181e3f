//! Configuration loading.
//!
//! Settings come from an optional TOML file, then environment overrides
//! (`CLOUD_USER`, `VNC_PORT`, ...), then validation. Everything has a
//! default, so an empty file and no environment give the stock desktop.

use crate::credential::{deserialize_secret, secret_matches, CredentialFallback};
use crate::desktop;
use crate::errors::{ConfigError, PipelineValidationError};
use crate::pipeline::{OrchestratorConfig, Pipeline, PipelineBuilder, StageDefaults, StageSpec};
use crate::process::LogSink;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_PATH: &str = "deskgate.toml";

/// Environment variables that override file settings.
pub mod env {
    /// Login user name.
    pub const CLOUD_USER: &str = "CLOUD_USER";
    /// Login password.
    pub const CLOUD_PASS: &str = "CLOUD_PASS";
    /// Framebuffer password.
    pub const VNC_PASSWORD: &str = "VNC_PASSWORD";
    /// Gate listen port.
    pub const PORT: &str = "PORT";
    /// X display identifier.
    pub const DISPLAY_NUM: &str = "DISPLAY_NUM";
    /// Framebuffer port.
    pub const VNC_PORT: &str = "VNC_PORT";
    /// Bridge port.
    pub const WEBSOCKIFY_PORT: &str = "WEBSOCKIFY_PORT";
    /// Web client document root.
    pub const NOVNC_WEBROOT: &str = "NOVNC_WEBROOT";
    /// Per-stage log directory.
    pub const LOG_DIR: &str = "DESKGATE_LOG_DIR";
}

const DEFAULT_USER: &str = "user";
const DEFAULT_PASSWORD: &str = "pass";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeskgateConfig {
    /// Login page settings.
    pub gate: GateConfig,
    /// Built-in desktop pipeline settings.
    pub desktop: DesktopConfig,
    /// Orchestrator tuning.
    pub orchestrator: OrchestratorSettings,
    /// Custom stages. When non-empty they replace the desktop pipeline.
    pub stages: Vec<StageSpec>,
}

/// Login page settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Address to bind.
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
    /// Login user name.
    pub user: String,
    /// Login password.
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    /// Session lifetime in seconds.
    pub session_ttl_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            user: DEFAULT_USER.to_string(),
            password: SecretString::from(DEFAULT_PASSWORD),
            session_ttl_secs: 60 * 60 * 24,
        }
    }
}

impl GateConfig {
    /// Session lifetime.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Built-in desktop pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DesktopConfig {
    /// X display identifier, e.g. `:1`.
    pub display: String,
    /// Virtual screen geometry, `WxHxDepth`.
    pub geometry: String,
    /// Whether to start the audio server.
    pub audio: bool,
    /// Desktop session command.
    pub session_command: Vec<String>,
    /// Framebuffer (VNC) port.
    pub vnc_port: u16,
    /// Framebuffer password.
    #[serde(deserialize_with = "deserialize_secret")]
    pub vnc_password: SecretString,
    /// Where the framebuffer password file is written.
    pub credential_path: PathBuf,
    /// What to do when the password file cannot be written.
    pub credential_fallback: CredentialFallback,
    /// Bridge (websockify) port.
    pub websockify_port: u16,
    /// Web client document root served by the bridge.
    pub novnc_webroot: PathBuf,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            display: ":1".to_string(),
            geometry: "1280x720x24".to_string(),
            audio: true,
            session_command: vec!["startxfce4".to_string()],
            vnc_port: 5901,
            vnc_password: SecretString::from("vncpass"),
            credential_path: PathBuf::from("/tmp/.vncpasswd"),
            credential_fallback: CredentialFallback::Fail,
            websockify_port: 6080,
            novnc_webroot: PathBuf::from("/usr/share/novnc"),
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// SIGTERM to SIGKILL window.
    pub grace_period_ms: u64,
    /// Liveness polling interval.
    pub watch_interval_ms: u64,
    /// Delay between readiness checks of the built-in stages.
    pub probe_interval_ms: u64,
    /// Readiness checks before the built-in stages give up.
    pub probe_attempts: u32,
    /// Readiness deadline per stage.
    pub stage_deadline_ms: u64,
    /// Directory for per-stage logs. Output is discarded when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 1_000,
            watch_interval_ms: 1_000,
            probe_interval_ms: 200,
            probe_attempts: 50,
            stage_deadline_ms: 15_000,
            log_dir: None,
        }
    }
}

impl OrchestratorSettings {
    /// Delay between readiness checks.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl DeskgateConfig {
    /// Loads configuration from `path`, or from [`DEFAULT_CONFIG_PATH`]
    /// when it exists, then applies the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, a file does not
    /// parse, an environment value is invalid, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?,
            None => Self::default(),
        };
        config.apply_env_with(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if a port does not parse.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(user) = lookup(env::CLOUD_USER) {
            self.gate.user = user;
        }
        if let Some(pass) = lookup(env::CLOUD_PASS) {
            self.gate.password = SecretString::from(pass);
        }
        if let Some(pass) = lookup(env::VNC_PASSWORD) {
            self.desktop.vnc_password = SecretString::from(pass);
        }
        if let Some(port) = lookup(env::PORT) {
            self.gate.port = parse_port(env::PORT, &port)?;
        }
        if let Some(display) = lookup(env::DISPLAY_NUM) {
            self.desktop.display = display;
        }
        if let Some(port) = lookup(env::VNC_PORT) {
            self.desktop.vnc_port = parse_port(env::VNC_PORT, &port)?;
        }
        if let Some(port) = lookup(env::WEBSOCKIFY_PORT) {
            self.desktop.websockify_port = parse_port(env::WEBSOCKIFY_PORT, &port)?;
        }
        if let Some(root) = lookup(env::NOVNC_WEBROOT) {
            self.desktop.novnc_webroot = PathBuf::from(root);
        }
        if let Some(dir) = lookup(env::LOG_DIR).filter(|d| !d.is_empty()) {
            self.orchestrator.log_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Checks values that cannot be expressed in the types.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.user.is_empty() {
            return Err(ConfigError::Invalid("gate.user must not be empty".to_string()));
        }
        if self.gate.password.expose_secret().is_empty() {
            return Err(ConfigError::Invalid("gate.password must not be empty".to_string()));
        }
        if self.orchestrator.probe_attempts == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.probe_attempts must be at least 1".to_string(),
            ));
        }
        if self.orchestrator.watch_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.watch_interval_ms must be positive".to_string(),
            ));
        }
        if self.stages.is_empty() {
            let d = &self.desktop;
            if d.vnc_port == d.websockify_port {
                return Err(ConfigError::Invalid(format!(
                    "desktop.vnc_port and desktop.websockify_port are both {}",
                    d.vnc_port
                )));
            }
            if d.session_command.is_empty() {
                return Err(ConfigError::Invalid("desktop.session_command must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Returns true if the login still uses the built-in credentials.
    #[must_use]
    pub fn uses_default_login(&self) -> bool {
        self.gate.user == DEFAULT_USER && secret_matches(&self.gate.password, DEFAULT_PASSWORD)
    }

    /// Logs warnings about insecure settings.
    pub fn warn_insecure(&self) {
        if self.uses_default_login() {
            warn!("Login uses the default credentials; set CLOUD_USER and CLOUD_PASS");
        }
        if self.stages.is_empty() && self.desktop.credential_fallback == CredentialFallback::Unauthenticated {
            warn!("credential_fallback = \"unauthenticated\": the framebuffer may start without a password");
        }
    }

    /// Builds the pipeline: the custom `[[stages]]` if any, otherwise the
    /// desktop stage set.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed custom stages.
    pub fn pipeline(&self) -> Result<Pipeline, PipelineValidationError> {
        if self.stages.is_empty() {
            return desktop::desktop_pipeline(&self.desktop, &self.orchestrator);
        }
        PipelineBuilder::new("custom")
            .stages(self.stages.iter().cloned())
            .build()
    }

    /// Orchestrator settings derived from this configuration.
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            defaults: StageDefaults {
                grace_period: Duration::from_millis(o.grace_period_ms),
                deadline: Duration::from_millis(o.stage_deadline_ms),
            },
            watch_interval: Duration::from_millis(o.watch_interval_ms),
            log_sink: o
                .log_dir
                .clone()
                .map_or(LogSink::Discard, LogSink::Directory),
        }
    }
}

fn parse_port(var: &str, value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(0) => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            reason: "port must not be 0".to_string(),
        }),
        Ok(port) => Ok(port),
        Err(e) => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            reason: format!("'{value}' is not a port: {e}"),
        }),
    }
}
