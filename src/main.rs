//! Ollama Prepper - Main entry point

use anyhow::Result;
use clap::Parser;
use ollama_prepper::{ModelRef, PrepperConfig, ProvisionOptions, Provisioner};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;

/// Exit code after an interrupt, following shell convention
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "ollama-prepper")]
#[command(about = "Provision a local Ollama runtime from a model manifest", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override manifest path
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Only pull these models (family:id), repeatable
    #[arg(long, value_parser = parse_model_ref)]
    only: Vec<ModelRef>,

    /// Log planned pulls without touching the daemon
    #[arg(long)]
    dry_run: bool,

    /// Stop after provisioning instead of running the startup script
    #[arg(long)]
    no_handoff: bool,

    /// Write a JSON pull report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,
}

fn parse_model_ref(value: &str) -> Result<ModelRef, String> {
    ModelRef::parse(value).ok_or_else(|| format!("expected family:id, got '{}'", value))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Provisioning failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    tracing::info!("Starting Ollama Prepper");

    let mut config = PrepperConfig::load(cli.config)?;

    // CLI overrides
    if let Some(manifest) = cli.manifest {
        config.manifest_path = manifest;
    }

    config.validate()?;

    tracing::info!(
        manifest = %config.manifest_path.display(),
        daemon = %config.daemon.binary,
        host = %config.daemon.host,
        "Configuration loaded"
    );

    let options = ProvisionOptions {
        dry_run: cli.dry_run,
        no_handoff: cli.no_handoff,
        only: cli.only,
        report_path: cli.report,
    };
    let provisioner = Provisioner::new(config, options)?;

    // Dropping the provisioning future on a signal kills the daemon it owns
    let report = tokio::select! {
        result = provisioner.provision() => result?,
        _ = shutdown_signal() => {
            tracing::warn!("Interrupted, daemon stopped");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    let outcome = match provisioner.finish(report).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Handoff failed");
            return Ok(ExitCode::from(
                ollama_prepper::handoff::EXIT_COMMAND_NOT_FOUND as u8,
            ));
        }
    };

    Ok(ExitCode::from(outcome.exit_code.clamp(0, 255) as u8))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
