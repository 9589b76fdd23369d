//! Handoff to the primary application's startup script

use crate::config::HandoffConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::Command;
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};

/// Exit code reported when the handoff program cannot be started
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl From<&HandoffConfig> for HandoffSpec {
    fn from(config: &HandoffConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

/// Trait for running the startup script
#[async_trait]
pub trait HandoffRunner: Send + Sync {
    /// Run to completion and return its exit code
    async fn run(&self, spec: &HandoffSpec) -> Result<i32>;
}

/// Runs the script with inherited environment and stdio.
///
/// SIGTERM received while the script runs is forwarded to it, so the
/// prepper can sit in front of the application as a container entrypoint.
/// Ctrl+C from a terminal already reaches the script through the process group.
pub struct SystemHandoff;

#[async_trait]
impl HandoffRunner for SystemHandoff {
    async fn run(&self, spec: &HandoffSpec) -> Result<i32> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // Listen before spawning so no signal falls between the two
        #[cfg(unix)]
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to install SIGTERM handler, signals will not be forwarded"
                );
                None
            }
        };

        tracing::info!(
            program = %spec.program,
            args = ?spec.args,
            "Handing off to startup script"
        );

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to run handoff program '{}'", spec.program))?;

        #[cfg(unix)]
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = recv_signal(&mut terminate) => {
                    forward_signal(&child, nix::sys::signal::Signal::SIGTERM);
                }
            }
        };

        #[cfg(not(unix))]
        let status = child.wait().await;

        let status = status.context("Failed to wait for handoff program")?;
        let code = exit_code(status);
        tracing::info!(exit_code = code, "Startup script finished");
        Ok(code)
    }
}

#[cfg(unix)]
async fn recv_signal(stream: &mut Option<Signal>) -> Option<()> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn forward_signal(child: &tokio::process::Child, sig: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    tracing::info!(pid = pid, signal = %sig, "Forwarding signal to startup script");
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        tracing::warn!(pid = pid, error = %e, "Failed to forward signal");
    }
}

/// Map an exit status to a shell-style exit code
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
