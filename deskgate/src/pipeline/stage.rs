//! Runtime resolution of a [`StageSpec`] into something launchable.

use crate::core::{keys, StageOutput};
use crate::credential::{self, CredentialFallback};
use crate::errors::{StageError, TemplateError};
use crate::process::LaunchSpec;
use crate::readiness::{ReadinessPolicy, ReadinessProbe};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::template::TemplateScope;
use super::StageSpec;

/// Pipeline-wide fallbacks for per-stage timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefaults {
    /// Stop grace period.
    pub grace_period: Duration,
    /// Readiness deadline.
    pub deadline: Duration,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(1),
            deadline: Duration::from_secs(15),
        }
    }
}

/// A stage ready to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStage {
    /// What to spawn.
    pub launch: LaunchSpec,
    /// How to detect readiness.
    pub probe: ReadinessProbe,
    /// Values published once ready.
    pub output: StageOutput,
    /// Stop grace period.
    pub grace_period: Duration,
}

/// A stage spec bound to the pipeline it runs in.
#[derive(Debug, Clone)]
pub struct Stage {
    spec: Arc<StageSpec>,
}

impl Stage {
    /// Wraps a spec.
    #[must_use]
    pub fn new(spec: StageSpec) -> Self {
        Self {
            spec: Arc::new(spec),
        }
    }

    /// Returns the stage declaration.
    #[must_use]
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Returns the readiness policy.
    #[must_use]
    pub fn readiness_policy(&self) -> &ReadinessPolicy {
        &self.spec.readiness
    }

    /// Resolves the stage against upstream outputs, preparing its
    /// credential file if it declares one.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Template`] for unresolvable placeholders and
    /// [`StageError::Credential`] when the credential cannot be prepared
    /// and the fallback policy is `fail`.
    pub async fn resolve(
        &self,
        upstream: &BTreeMap<String, StageOutput>,
        defaults: StageDefaults,
    ) -> Result<ResolvedStage, StageError> {
        let mut output = self.render_outputs(upstream)?;
        let mut args_override = None;

        if let Some(cred) = &self.spec.credential {
            match credential::prepare(self.name(), cred).await {
                Ok(path) => output.insert(keys::CREDENTIAL_PATH, path.to_string_lossy()),
                Err(e) if cred.fallback == CredentialFallback::Unauthenticated => {
                    warn!(
                        stage = %self.name(),
                        error = %e,
                        "Credential preparation failed, starting WITHOUT authentication as configured"
                    );
                    args_override = cred.unauthenticated_args.as_deref();
                }
                Err(e) => return Err(e.into()),
            }
        }

        let launch = self.render_launch(upstream, &output, args_override)?;
        Ok(self.assemble(launch, output, defaults))
    }

    /// Resolves the stage without touching the filesystem.
    ///
    /// The credential path is assumed to be written. Used to print plans.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] for unresolvable placeholders.
    pub fn plan(
        &self,
        upstream: &BTreeMap<String, StageOutput>,
        defaults: StageDefaults,
    ) -> Result<ResolvedStage, TemplateError> {
        let mut output = self.render_outputs(upstream)?;
        if let Some(cred) = &self.spec.credential {
            output.insert(keys::CREDENTIAL_PATH, cred.path.to_string_lossy());
        }
        let launch = self.render_launch(upstream, &output, None)?;
        Ok(self.assemble(launch, output, defaults))
    }

    fn render_outputs(&self, upstream: &BTreeMap<String, StageOutput>) -> Result<StageOutput, TemplateError> {
        let scope = TemplateScope::new(&self.spec.name, &self.spec.dependencies, upstream);
        let mut output = StageOutput::new();
        for (key, template) in &self.spec.outputs {
            output.insert(key.clone(), scope.render(template)?);
        }
        Ok(output)
    }

    fn render_launch(
        &self,
        upstream: &BTreeMap<String, StageOutput>,
        own: &StageOutput,
        args_override: Option<&[String]>,
    ) -> Result<LaunchSpec, TemplateError> {
        let scope = TemplateScope::new(&self.spec.name, &self.spec.dependencies, upstream).with_own(own);

        let program = scope.render(self.spec.program())?;
        let args = args_override.unwrap_or_else(|| self.spec.command.get(1..).unwrap_or_default());
        let args = args
            .iter()
            .map(|a| scope.render(a))
            .collect::<Result<Vec<_>, _>>()?;

        let mut launch = LaunchSpec::new(program).with_args(args);
        for (key, template) in &self.spec.env {
            launch = launch.with_env(key.clone(), scope.render(template)?);
        }
        Ok(launch)
    }

    fn assemble(&self, launch: LaunchSpec, output: StageOutput, defaults: StageDefaults) -> ResolvedStage {
        ResolvedStage {
            launch,
            probe: ReadinessProbe::new(self.spec.readiness.clone(), self.spec.deadline(defaults.deadline)),
            output,
            grace_period: self.spec.grace_period(defaults.grace_period),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialSpec;
    use secrecy::SecretString;
    use pretty_assertions::assert_eq;

    fn framebuffer_outputs() -> BTreeMap<String, StageOutput> {
        let mut up = BTreeMap::new();
        up.insert(
            "framebuffer".to_string(),
            StageOutput::new().with_value("host", "127.0.0.1").with_value("port", "5901"),
        );
        up
    }

    #[tokio::test]
    async fn test_resolve_with_upstream_port() {
        let stage = Stage::new(
            StageSpec::new("bridge", "websockify")
                .with_args(["{self.port}", "{framebuffer.host}:{framebuffer.port}"])
                .with_dependency("framebuffer")
                .with_env("BRIDGE_TARGET", "{framebuffer.port}")
                .with_output("host", "127.0.0.1")
                .with_output("port", "6080")
                .with_readiness(ReadinessPolicy::socket("127.0.0.1", 6080)),
        );

        let resolved = stage
            .resolve(&framebuffer_outputs(), StageDefaults::default())
            .await
            .unwrap();

        assert_eq!(resolved.launch.program, "websockify");
        assert_eq!(resolved.launch.args, vec!["6080", "127.0.0.1:5901"]);
        assert_eq!(resolved.launch.env.get("BRIDGE_TARGET").map(String::as_str), Some("5901"));
        assert_eq!(resolved.output.port(), Some(6080));
        assert_eq!(resolved.probe.deadline(), Duration::from_secs(15));
        assert_eq!(resolved.grace_period, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_resolve_outputs_from_dependency() {
        let stage = Stage::new(
            StageSpec::new("proxy", "true")
                .with_dependency("framebuffer")
                .with_output("upstream", "{framebuffer.host}:{framebuffer.port}"),
        );

        let resolved = stage
            .resolve(&framebuffer_outputs(), StageDefaults::default())
            .await
            .unwrap();
        assert_eq!(resolved.output.get("upstream"), Some("127.0.0.1:5901"));
    }

    #[tokio::test]
    async fn test_credential_path_published() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        let stage = Stage::new(
            StageSpec::new("framebuffer", "x11vnc")
                .with_args(["-rfbauth", "{self.credential_path}"])
                .with_credential(CredentialSpec::new(&path, SecretString::from("vncpass"))),
        );

        let resolved = stage.resolve(&BTreeMap::new(), StageDefaults::default()).await.unwrap();
        assert_eq!(resolved.launch.args[1], path.to_string_lossy());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_credential_failure_is_fatal_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::new(
            StageSpec::new("framebuffer", "x11vnc").with_credential(
                CredentialSpec::new(dir.path().join("passwd"), SecretString::from("x")).with_store_command(["false"]),
            ),
        );

        let err = stage
            .resolve(&BTreeMap::new(), StageDefaults::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_info().code, "DESK-CREDENTIAL");
    }

    #[tokio::test]
    async fn test_credential_failure_unauthenticated_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::new(
            StageSpec::new("framebuffer", "x11vnc")
                .with_args(["-rfbauth", "{self.credential_path}", "-forever"])
                .with_credential(
                    CredentialSpec::new(dir.path().join("passwd"), SecretString::from("x"))
                        .with_store_command(["false"])
                        .with_unauthenticated_fallback(["-nopw", "-forever"]),
                ),
        );

        let resolved = stage.resolve(&BTreeMap::new(), StageDefaults::default()).await.unwrap();
        assert_eq!(resolved.launch.args, vec!["-nopw", "-forever"]);
        assert_eq!(resolved.output.get(keys::CREDENTIAL_PATH), None);
    }

    #[test]
    fn test_plan_does_not_write_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        let stage = Stage::new(
            StageSpec::new("framebuffer", "x11vnc")
                .with_args(["-rfbauth", "{self.credential_path}"])
                .with_credential(CredentialSpec::new(&path, SecretString::from("vncpass")))
                .with_deadline(Duration::from_secs(3)),
        );

        let planned = stage.plan(&BTreeMap::new(), StageDefaults::default()).unwrap();
        assert_eq!(planned.launch.args[1], path.to_string_lossy());
        assert_eq!(planned.probe.deadline(), Duration::from_secs(3));
        assert!(!path.exists());
    }
}
