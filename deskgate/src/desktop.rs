//! The built-in remote desktop pipeline.
//!
//! ```text
//! display (Xvfb) ──┬─> session (xfce) ─> framebuffer (x11vnc) ─> bridge (websockify)
//! audio (pulse) ───┘
//! ```
//!
//! The bridge's outputs define the stream endpoint the gate embeds.

use crate::config::{DesktopConfig, OrchestratorSettings};
use crate::credential::{CredentialFallback, CredentialSpec, PATH_PLACEHOLDER, SECRET_PLACEHOLDER};
use crate::errors::PipelineValidationError;
use crate::pipeline::{Pipeline, PipelineBuilder, RestartPolicy, StageSpec};
use crate::readiness::ReadinessPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Stage names of the desktop pipeline.
pub mod stages {
    /// Virtual X server.
    pub const DISPLAY: &str = "display";
    /// Audio server.
    pub const AUDIO: &str = "audio";
    /// Desktop session.
    pub const SESSION: &str = "session";
    /// Remote framebuffer server.
    pub const FRAMEBUFFER: &str = "framebuffer";
    /// Websocket bridge and web client.
    pub const BRIDGE: &str = "bridge";
}

/// Loopback address the framebuffer and bridge are probed on.
const LOOPBACK: &str = "127.0.0.1";

/// Used when the display has no socket to watch.
const DISPLAY_FALLBACK_DELAY: Duration = Duration::from_secs(1);
const AUDIO_DELAY: Duration = Duration::from_millis(700);
const SESSION_DELAY: Duration = Duration::from_secs(2);

/// Extracts the display number from an identifier such as `:1` or `:1.0`.
#[must_use]
pub fn display_number(display: &str) -> Option<u32> {
    let (_, rest) = display.rsplit_once(':')?;
    let number = rest.split('.').next()?;
    number.parse().ok()
}

/// The X11 socket the server creates for `display`.
#[must_use]
pub fn x11_socket(display: &str) -> Option<PathBuf> {
    display_number(display).map(|n| PathBuf::from(format!("/tmp/.X11-unix/X{n}")))
}

/// Builds the desktop stage set in start order.
#[must_use]
pub fn desktop_stages(desktop: &DesktopConfig, tuning: &OrchestratorSettings) -> Vec<StageSpec> {
    let probe_interval = tuning.probe_interval();
    let socket_probe = |port: u16| {
        ReadinessPolicy::socket(LOOPBACK, port)
            .with_interval(probe_interval)
            .with_max_attempts(tuning.probe_attempts)
    };

    let display_ready = match x11_socket(&desktop.display) {
        Some(socket) => ReadinessPolicy::file(socket)
            .fresh()
            .with_interval(probe_interval)
            .with_max_attempts(tuning.probe_attempts),
        None => ReadinessPolicy::fixed_delay(DISPLAY_FALLBACK_DELAY),
    };

    let mut specs = vec![StageSpec::new(stages::DISPLAY, "Xvfb")
        .with_args([
            desktop.display.as_str(),
            "-screen",
            "0",
            desktop.geometry.as_str(),
        ])
        .with_output("display", desktop.display.clone())
        .with_readiness(display_ready)];

    let mut session_deps = vec![stages::DISPLAY];
    if desktop.audio {
        specs.push(
            StageSpec::new(stages::AUDIO, "pulseaudio")
                .with_args(["--daemonize=no", "--exit-idle-time=-1"])
                .with_readiness(ReadinessPolicy::fixed_delay(AUDIO_DELAY))
                .with_restart(RestartPolicy::on_failure(2)),
        );
        session_deps.push(stages::AUDIO);
    }

    let mut session_command = desktop.session_command.iter();
    let session_program = session_command.next().map_or("startxfce4", String::as_str);
    specs.push(
        StageSpec::new(stages::SESSION, session_program)
            .with_args(session_command)
            .with_env("DISPLAY", "{display.display}")
            .with_dependencies(session_deps)
            .with_readiness(ReadinessPolicy::fixed_delay(SESSION_DELAY)),
    );

    specs.push(framebuffer(desktop, socket_probe(desktop.vnc_port)));

    let bridge_port = desktop.websockify_port.to_string();
    specs.push(
        StageSpec::new(stages::BRIDGE, "websockify")
            .with_args([
                "--web".to_string(),
                desktop.novnc_webroot.to_string_lossy().into_owned(),
                "{self.port}".to_string(),
                "{framebuffer.host}:{framebuffer.port}".to_string(),
            ])
            .with_dependency(stages::FRAMEBUFFER)
            .with_output("host", LOOPBACK)
            .with_output("port", bridge_port.clone())
            .with_output("path", format!("/vnc.html?port={bridge_port}"))
            .with_readiness(socket_probe(desktop.websockify_port)),
    );

    specs
}

fn framebuffer(desktop: &DesktopConfig, readiness: ReadinessPolicy) -> StageSpec {
    const COMMON: [&str; 3] = ["-forever", "-shared", "-noxdamage"];
    let base = ["-display", "{display.display}", "-rfbport", "{self.port}"];

    let authenticated = base
        .into_iter()
        .chain(["-rfbauth", "{self.credential_path}"])
        .chain(COMMON);

    let mut credential = CredentialSpec::new(&desktop.credential_path, desktop.vnc_password.clone())
        .with_store_command(["x11vnc", "-storepasswd", SECRET_PLACEHOLDER, PATH_PLACEHOLDER]);
    if desktop.credential_fallback == CredentialFallback::Unauthenticated {
        credential = credential.with_unauthenticated_fallback(base.into_iter().chain(COMMON));
    }

    StageSpec::new(stages::FRAMEBUFFER, "x11vnc")
        .with_args(authenticated)
        .with_dependencies([stages::DISPLAY, stages::SESSION])
        .with_output("host", LOOPBACK)
        .with_output("port", desktop.vnc_port.to_string())
        .with_credential(credential)
        .with_readiness(readiness)
        .with_restart(RestartPolicy::on_failure(3))
}

/// Builds the validated desktop pipeline, with the bridge as endpoint.
///
/// # Errors
///
/// Returns a validation error if the stage set is inconsistent.
pub fn desktop_pipeline(
    desktop: &DesktopConfig,
    tuning: &OrchestratorSettings,
) -> Result<Pipeline, PipelineValidationError> {
    PipelineBuilder::new("desktop")
        .stages(desktop_stages(desktop, tuning))
        .endpoint_stage(stages::BRIDGE)
        .build()
}
