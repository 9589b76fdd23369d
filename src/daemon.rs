//! Model-serving daemon process lifecycle

use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Everything needed to spawn the daemon
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub host: String,
    pub env: BTreeMap<String, String>,
    pub log_dir: PathBuf,
}

impl DaemonSpec {
    /// `<binary> serve` bound to the configured host
    pub fn serve(config: &DaemonConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            args: vec!["serve".to_string()],
            host: config.host.clone(),
            env: config.env.clone(),
            log_dir: config.log_dir.clone(),
        }
    }
}

/// Opaque handle to a spawned daemon, retained from spawn time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHandle {
    pub(crate) id: String,
}

/// Trait for managing the daemon process lifecycle
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Spawn the daemon in the background
    async fn spawn(&self, spec: &DaemonSpec) -> Result<DaemonHandle>;

    /// Stop gracefully, escalating to SIGKILL after `grace`.
    /// Stopping a daemon that already exited is a no-op.
    async fn stop(&self, handle: DaemonHandle, grace: Duration) -> Result<()>;

    /// Check whether the process is still alive
    async fn is_running(&self, handle: &DaemonHandle) -> bool;

    async fn pid(&self, handle: &DaemonHandle) -> Option<u32>;

    /// Best-effort synchronous kill, used when a guard is dropped without shutdown
    fn kill_now(&self, handle: &DaemonHandle);
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production launcher using tokio::process
pub struct SystemDaemonLauncher {
    processes: Arc<RwLock<HashMap<String, Child>>>,
}

impl SystemDaemonLauncher {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for SystemDaemonLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the daemon log, falling back to the temp dir when `log_dir` is unusable
fn open_log_file(log_dir: &Path) -> Result<(std::fs::File, PathBuf)> {
    let log_dir = if let Err(e) = std::fs::create_dir_all(log_dir) {
        let fallback = std::env::temp_dir().join("ollama-prepper/logs");
        tracing::warn!(
            error = %e,
            attempted_dir = %log_dir.display(),
            fallback = %fallback.display(),
            "Failed to create log directory, falling back"
        );
        std::fs::create_dir_all(&fallback).context("Failed to create fallback log directory")?;
        fallback
    } else {
        log_dir.to_path_buf()
    };

    let log_path = log_dir.join("ollama-serve.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
    Ok((file, log_path))
}

#[async_trait]
impl DaemonLauncher for SystemDaemonLauncher {
    async fn spawn(&self, spec: &DaemonSpec) -> Result<DaemonHandle> {
        let (log_file, log_path) = open_log_file(&spec.log_dir)?;
        let stdout_file = log_file
            .try_clone()
            .context("Failed to clone log file for stdout")?;

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .env("OLLAMA_HOST", &spec.host)
            .envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .stdout(stdout_file)
            .stderr(log_file)
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn daemon '{}'", spec.binary))?;

        let pid = child.id().context("Failed to get PID")?;
        let handle_id = format!("daemon_{}", pid);

        tracing::info!(
            binary = %spec.binary,
            host = %spec.host,
            pid = pid,
            log = %log_path.display(),
            "Daemon spawned"
        );

        self.processes.write().await.insert(handle_id.clone(), child);

        Ok(DaemonHandle { id: handle_id })
    }

    async fn stop(&self, handle: DaemonHandle, grace: Duration) -> Result<()> {
        let mut processes = self.processes.write().await;

        let Some(mut child) = processes.remove(&handle.id) else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!(status = %status, "Daemon already exited");
            return Ok(());
        }

        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;

                let pid = Pid::from_raw(pid as i32);
                let _ = kill(pid, Signal::SIGTERM);

                tokio::select! {
                    _ = child.wait() => {
                        tracing::info!("Daemon stopped gracefully");
                    }
                    _ = tokio::time::sleep(grace) => {
                        tracing::warn!(
                            grace_secs = grace.as_secs(),
                            "Graceful shutdown timeout, sending SIGKILL"
                        );
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = pid;
                let _ = child.kill().await;
            }
        }

        Ok(())
    }

    async fn is_running(&self, handle: &DaemonHandle) -> bool {
        let mut processes = self.processes.write().await;
        match processes.get_mut(&handle.id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn pid(&self, handle: &DaemonHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.id())
    }

    fn kill_now(&self, handle: &DaemonHandle) {
        // Dropping the child triggers kill_on_drop
        if let Ok(mut processes) = self.processes.try_write() {
            processes.remove(&handle.id);
            return;
        }

        // Table is busy; finish the removal once the lock frees up
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(handle = %handle.id, "Daemon table busy, deferring kill");
                let processes = self.processes.clone();
                let id = handle.id.clone();
                runtime.spawn(async move {
                    processes.write().await.remove(&id);
                });
            }
            Err(_) => {
                tracing::error!(
                    handle = %handle.id,
                    "Daemon table busy and no runtime available, daemon may outlive the prepper"
                );
            }
        }
    }
}

// ============================================================================
// Scoped ownership
// ============================================================================

/// Owns a running daemon until `shutdown` is called.
///
/// Dropping the guard without `shutdown` kills the daemon immediately, so
/// every exit path after a successful spawn releases the process.
pub struct DaemonGuard {
    launcher: Arc<dyn DaemonLauncher>,
    handle: Option<DaemonHandle>,
    grace: Duration,
}

impl DaemonGuard {
    /// Spawn the daemon and take ownership of it
    pub async fn start(
        launcher: Arc<dyn DaemonLauncher>,
        spec: &DaemonSpec,
        grace: Duration,
    ) -> Result<Self> {
        let handle = launcher.spawn(spec).await?;
        Ok(Self {
            launcher,
            handle: Some(handle),
            grace,
        })
    }

    pub async fn is_running(&self) -> bool {
        match &self.handle {
            Some(handle) => self.launcher.is_running(handle).await,
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        match &self.handle {
            Some(handle) => self.launcher.pid(handle).await,
            None => None,
        }
    }

    /// Stop the daemon and release ownership
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            self.launcher.stop(handle, self.grace).await?;
            tracing::info!("Daemon shut down");
        }
        Ok(())
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::warn!("Daemon guard dropped without shutdown, killing daemon");
            self.launcher.kill_now(&handle);
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
