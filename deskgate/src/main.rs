//! deskgate - password-gated remote desktop

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deskgate::cancellation::CancellationToken;
use deskgate::config::DeskgateConfig;
use deskgate::errors::DeskgateError;
use deskgate::gate::{self, GateState};
use deskgate::pipeline::{PipelineOrchestrator, PipelineView};
use deskgate::preflight;
use deskgate::telemetry::{self, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long the gate may take to drain after shutdown.
const GATE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "deskgate",
    version,
    about = "Password-gated remote desktop with a supervised process pipeline"
)]
struct Cli {
    /// Configuration file (defaults to ./deskgate.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the pipeline and serve the login page until SIGINT/SIGTERM
    Serve,
    /// Check that every stage executable is installed
    Check,
    /// Print the resolved start order and commands without spawning
    Plan,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init(cli.log_format) {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("deskgate failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = DeskgateConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Check => check(&config),
        Commands::Plan => plan(&config),
    }
}

async fn serve(config: DeskgateConfig) -> Result<ExitCode> {
    config.warn_insecure();
    let pipeline = config.pipeline()?;
    if let Err(e) = preflight::check(&pipeline) {
        error!(code = %e.error_info.code, hint = e.error_info.fix_hint.as_deref().unwrap_or(""), "{e}");
        return Ok(ExitCode::FAILURE);
    }

    let orchestrator = Arc::new(PipelineOrchestrator::new(pipeline, config.orchestrator_config()));
    let token = orchestrator.cancellation_token();
    let signals = spawn_signal_handler(Arc::clone(&token)).context("failed to install signal handlers")?;

    let listener = TcpListener::bind((config.gate.bind.as_str(), config.gate.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.gate.bind, config.gate.port))?;
    let gate_state = GateState::from_config(orchestrator.clone(), &config.gate);
    let gate_token = Arc::clone(&token);
    let gate = tokio::spawn(gate::serve(listener, gate_state, async move {
        gate_token.cancelled().await;
    }));

    let started = match orchestrator.start_all().await {
        Ok(()) => {
            info!(stages = orchestrator.pipeline().len(), "Desktop ready");
            let mut supervisor = tokio::spawn({
                let orchestrator = Arc::clone(&orchestrator);
                async move { orchestrator.supervise().await }
            });
            tokio::select! {
                () = token.cancelled() => {}
                _ = &mut supervisor => {}
            }
            true
        }
        Err(DeskgateError::Cancelled(reason)) => {
            info!(reason = %reason, "Startup interrupted");
            true
        }
        Err(e) => {
            error!(code = e.code().unwrap_or("DESK"), error = %e, "Pipeline failed to start");
            false
        }
    };

    let forced = orchestrator.stop_all().await;
    if !forced.is_empty() {
        warn!(count = forced.len(), "Some stages had to be killed");
    }
    signals.abort();
    match tokio::time::timeout(GATE_SHUTDOWN_TIMEOUT, gate).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Gate stopped with an error"),
        Ok(Err(e)) => warn!(error = %e, "Gate task panicked"),
        Err(_) => warn!("Gate did not shut down in time"),
    }

    let status = orchestrator.status();
    info!(state = %status.state, "Shutdown complete");
    if started && status.state != deskgate::core::PipelineState::Failed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn spawn_signal_handler(token: Arc<CancellationToken>) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            () = token.cancelled() => return,
        };
        info!(signal = name, "Received termination signal");
        token.cancel(format!("received {name}"));
    }))
}

fn check(config: &DeskgateConfig) -> Result<ExitCode> {
    let pipeline = config.pipeline()?;
    match preflight::check(&pipeline) {
        Ok(found) => {
            for exe in found {
                println!("ok       {:<12} {} ({})", exe.stage, exe.program, exe.path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            for (stage, program) in &e.missing {
                println!("missing  {stage:<12} {program}");
            }
            if let Some(hint) = &e.error_info.fix_hint {
                println!("\n{hint}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn plan(config: &DeskgateConfig) -> Result<ExitCode> {
    let pipeline = config.pipeline()?;
    let planned = pipeline.plan(config.orchestrator_config().defaults)?;

    println!("pipeline '{}' ({} stages)", pipeline.name(), planned.len());
    for (i, (name, resolved)) in planned.iter().enumerate() {
        println!("{:>2}. {name}", i + 1);
        println!("    command:   {}", resolved.launch.command_line());
        for (key, value) in &resolved.launch.env {
            println!("    env:       {key}={value}");
        }
        println!("    readiness: {}", resolved.probe.policy().describe());
        println!("    deadline:  {}ms", resolved.probe.deadline().as_millis());
        if let Some(cred) = pipeline.stage(name).and_then(|s| s.credential.as_ref()) {
            println!("    secret:    [REDACTED] written to {}", cred.path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
