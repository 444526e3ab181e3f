//! Credential files for stages that need a password on disk.
//!
//! The file is created owner-only (0600) before the stage starts. The
//! secret never reaches a log line: it stays in a [`SecretString`] until
//! the file is written and the store command line is not logged.

use crate::errors::CredentialError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::fs::{OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::process::Command;
use tracing::{debug, warn};

/// Upper bound for the external store command.
const STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Placeholder replaced by the secret in a store command.
pub const SECRET_PLACEHOLDER: &str = "{secret}";
/// Placeholder replaced by the credential path in a store command.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Reads a [`SecretString`] from a plain string field.
pub fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Compares `secret` against `candidate` in constant time.
#[must_use]
pub fn secret_matches(secret: &SecretString, candidate: &str) -> bool {
    bool::from(secret.expose_secret().as_bytes().ct_eq(candidate.as_bytes()))
}

/// What to do when the credential cannot be prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialFallback {
    /// The stage fails.
    #[default]
    Fail,
    /// The stage starts with its unauthenticated arguments instead.
    Unauthenticated,
}

/// A credential a stage needs before it starts.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSpec {
    /// Where the credential file is written.
    pub path: PathBuf,
    /// The secret to store.
    #[serde(deserialize_with = "deserialize_secret")]
    pub secret: SecretString,
    /// External command that writes the file, with `{secret}` and `{path}`
    /// placeholders. Empty means the secret is written verbatim.
    #[serde(default)]
    pub store_command: Vec<String>,
    /// Behaviour when preparation fails.
    #[serde(default)]
    pub fallback: CredentialFallback,
    /// Arguments used instead of the stage's own when falling back.
    #[serde(default)]
    pub unauthenticated_args: Option<Vec<String>>,
}

impl CredentialSpec {
    /// Creates a spec that writes `secret` verbatim to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, secret: SecretString) -> Self {
        Self {
            path: path.into(),
            secret,
            store_command: Vec::new(),
            fallback: CredentialFallback::Fail,
            unauthenticated_args: None,
        }
    }

    /// Sets the store command.
    #[must_use]
    pub fn with_store_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.store_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Opts into starting without the credential when preparation fails.
    #[must_use]
    pub fn with_unauthenticated_fallback(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fallback = CredentialFallback::Unauthenticated;
        self.unauthenticated_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the store program, if an external command is used.
    #[must_use]
    pub fn store_program(&self) -> Option<&str> {
        self.store_command.first().map(String::as_str)
    }
}

/// Writes the credential file and returns its path.
///
/// # Errors
///
/// Returns [`CredentialError`] if the file cannot be created or secured,
/// the store command fails, or the file ends up empty.
pub async fn prepare(stage: &str, spec: &CredentialSpec) -> Result<PathBuf, CredentialError> {
    let path = spec.path.clone();
    let io_err = |source| CredentialError::Io {
        path: path.clone(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .map_err(io_err)?;
    // An existing file keeps its old mode through open().
    secure(&path).map_err(io_err)?;

    if spec.store_command.is_empty() {
        file.write_all(spec.secret.expose_secret().as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    } else {
        drop(file);
        run_store_command(spec, &path).await?;
        secure(&path).map_err(io_err)?;
    }

    let len = std::fs::metadata(&path).map_err(io_err)?.len();
    if len == 0 {
        return Err(CredentialError::Empty { path });
    }

    debug!(stage = %stage, path = %path.display(), "Credential file prepared");
    Ok(path)
}

fn secure(path: &Path) -> std::io::Result<()> {
    std::fs::set_permissions(path, Permissions::from_mode(0o600))
}

async fn run_store_command(spec: &CredentialSpec, path: &Path) -> Result<(), CredentialError> {
    let path_str = path.to_string_lossy();
    let mut parts = spec.store_command.iter().map(|part| {
        part.replace(SECRET_PLACEHOLDER, spec.secret.expose_secret())
            .replace(PATH_PLACEHOLDER, &path_str)
    });
    let program = parts.next().unwrap_or_default();
    let display_program = spec.store_program().unwrap_or_default().to_string();

    let mut command = Command::new(&program);
    command
        .args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let status = match tokio::time::timeout(STORE_TIMEOUT, command.status()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(CredentialError::StoreFailed {
                program: display_program,
                status: e.to_string(),
            })
        }
        Err(_) => {
            warn!(program = %display_program, "Credential store command timed out");
            return Err(CredentialError::StoreFailed {
                program: display_program,
                status: format!("timeout after {}s", STORE_TIMEOUT.as_secs()),
            });
        }
    };

    if status.success() {
        Ok(())
    } else {
        Err(CredentialError::StoreFailed {
            program: display_program,
            status: status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_spec_debug_redacts_secret() {
        let spec = CredentialSpec::new("/tmp/p", SecretString::from("hunter2"));
        let debug = format!("{spec:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_secret_matches() {
        let secret = SecretString::from("pass");
        assert!(secret_matches(&secret, "pass"));
        assert!(!secret_matches(&secret, "pas"));
        assert!(!secret_matches(&secret, "passs"));
        assert!(!secret_matches(&secret, ""));
        assert!(secret_matches(&SecretString::from(""), ""));
    }

    #[tokio::test]
    async fn test_prepare_writes_owner_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds/vncpasswd");
        let spec = CredentialSpec::new(&path, SecretString::from("vncpass"));

        let written = prepare("framebuffer", &spec).await.unwrap();
        assert_eq!(written, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "vncpass");
        assert_eq!(mode_of(&path), 0o600);
    }

    #[tokio::test]
    async fn test_prepare_tightens_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        prepare("framebuffer", &CredentialSpec::new(&path, SecretString::from("new")))
            .await
            .unwrap();
        assert_eq!(mode_of(&path), 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_prepare_with_store_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        let spec = CredentialSpec::new(&path, SecretString::from("s3cret"))
            .with_store_command(["sh", "-c", "printf 'stored:%s' \"$0\" > \"$1\"", "{secret}", "{path}"]);

        prepare("framebuffer", &spec).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "stored:s3cret");
        assert_eq!(mode_of(&path), 0o600);
    }

    #[tokio::test]
    async fn test_prepare_store_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CredentialSpec::new(dir.path().join("passwd"), SecretString::from("x"))
            .with_store_command(["false"]);

        let err = prepare("framebuffer", &spec).await.unwrap_err();
        assert!(matches!(err, CredentialError::StoreFailed { ref program, .. } if program == "false"));
    }

    #[tokio::test]
    async fn test_prepare_detects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CredentialSpec::new(dir.path().join("passwd"), SecretString::from("x"))
            .with_store_command(["true"]);

        let err = prepare("framebuffer", &spec).await.unwrap_err();
        assert!(matches!(err, CredentialError::Empty { .. }));
    }

    #[test]
    fn test_spec_from_toml() {
        let spec: CredentialSpec = toml::from_str(
            r#"
            path = "/tmp/.vncpasswd"
            secret = "vncpass"
            store_command = ["x11vnc", "-storepasswd", "{secret}", "{path}"]
            fallback = "unauthenticated"
            unauthenticated_args = ["-nopw"]
            "#,
        )
        .unwrap();

        assert_eq!(spec.secret.expose_secret(), "vncpass");
        assert_eq!(spec.store_program(), Some("x11vnc"));
        assert_eq!(spec.fallback, CredentialFallback::Unauthenticated);
        assert_eq!(spec.unauthenticated_args, Some(vec!["-nopw".to_string()]));
    }
}
