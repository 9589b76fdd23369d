//! Model pull loop
//!
//! Every pull is independent. Failures are recorded in the [`PullReport`]
//! and never stop the remaining pulls.

use crate::config::{DaemonConfig, PullConfig};
use crate::error::PullError;
use crate::manifest::ModelRef;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Trait for pulling a single model into the daemon's store
#[async_trait]
pub trait ModelPuller: Send + Sync {
    async fn pull(&self, model: &ModelRef) -> Result<(), PullError>;
}

/// Runs `<binary> pull family:id` against the spawned daemon
pub struct CliPuller {
    binary: String,
    host: String,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl CliPuller {
    pub fn new(daemon: &DaemonConfig, pull: &PullConfig) -> Self {
        Self {
            binary: daemon.binary.clone(),
            host: daemon.host.clone(),
            env: daemon.env.clone(),
            timeout: pull.timeout(),
        }
    }
}

#[async_trait]
impl ModelPuller for CliPuller {
    async fn pull(&self, model: &ModelRef) -> Result<(), PullError> {
        let mut child = Command::new(&self.binary)
            .arg("pull")
            .arg(model.to_string())
            .env("OLLAMA_HOST", &self.host)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(PullError::Spawn)?;

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(PullError::Timeout(limit));
                }
            },
            None => child.wait().await,
        }
        .map_err(PullError::Spawn)?;

        if !status.success() {
            return Err(PullError::ExitStatus(status.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullStatus {
    Succeeded,
    Failed,
}

/// Result of one pull
#[derive(Debug, Clone, Serialize)]
pub struct PullOutcome {
    pub model: ModelRef,
    pub status: PullStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated results of a pull batch
#[derive(Debug, Clone, Serialize)]
pub struct PullReport {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub outcomes: Vec<PullOutcome>,
}

impl PullReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == PullStatus::Succeeded)
            .count()
    }

    /// Models whose pull failed, in pull order
    pub fn failed(&self) -> Vec<&ModelRef> {
        self.outcomes
            .iter()
            .filter(|o| o.status == PullStatus::Failed)
            .map(|o| &o.model)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == PullStatus::Succeeded)
    }

    pub fn log_summary(&self) {
        let failed: Vec<String> = self.failed().iter().map(|m| m.to_string()).collect();
        if failed.is_empty() {
            tracing::info!(total = self.total(), "All models pulled");
        } else {
            tracing::warn!(
                total = self.total(),
                succeeded = self.succeeded(),
                failed = ?failed,
                "Some models failed to pull"
            );
        }
    }
}

/// Pull every model in order, recording each outcome
pub async fn pull_all(
    puller: &dyn ModelPuller,
    models: impl IntoIterator<Item = ModelRef>,
) -> PullReport {
    let started_at = chrono::Utc::now();
    let mut outcomes = Vec::new();

    for model in models {
        tracing::info!(model = %model, "Pulling model");
        let started = Instant::now();
        let result = puller.pull(&model).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => {
                tracing::info!(model = %model, duration_ms = duration_ms, "Model pulled");
                PullOutcome {
                    model,
                    status: PullStatus::Succeeded,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Model pull failed");
                PullOutcome {
                    model,
                    status: PullStatus::Failed,
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    PullReport {
        started_at,
        finished_at: chrono::Utc::now(),
        outcomes,
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use mocks::MockPuller;
    use std::sync::{Arc, Mutex};

    fn refs(names: &[&str]) -> Vec<ModelRef> {
        names.iter().filter_map(|n| ModelRef::parse(n)).collect()
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_batch() {
        let puller = MockPuller::new(Arc::new(Mutex::new(Vec::new()))).failing_on("llama:70b");

        let report = pull_all(&puller, refs(&["llama:8b", "llama:70b", "phi:mini"])).await;

        assert_eq!(puller.pulled(), vec!["llama:8b", "llama:70b", "phi:mini"]);
        assert_eq!(report.total(), 3);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), vec![&ModelRef::new("llama", "70b")]);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let puller = MockPuller::new(Arc::new(Mutex::new(Vec::new())));
        let report = pull_all(&puller, Vec::new()).await;
        assert_eq!(report.total(), 0);
        assert!(report.is_success());
        assert!(puller.pulled().is_empty());
    }

    #[tokio::test]
    async fn test_report_serializes_qualified_names() {
        let puller = MockPuller::new(Arc::new(Mutex::new(Vec::new()))).failing_on("phi:mini");
        let report = pull_all(&puller, refs(&["phi:mini"])).await;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["model"], "phi:mini");
        assert_eq!(json["outcomes"][0]["status"], "failed");
        assert!(json["outcomes"][0]["error"].is_string());
        assert!(json["started_at"].is_string());
    }

    #[tokio::test]
    async fn test_cli_puller_missing_binary() {
        let daemon = DaemonConfig {
            binary: "/nonexistent/ollama".to_string(),
            ..Default::default()
        };
        let puller = CliPuller::new(&daemon, &PullConfig::default());
        let err = puller.pull(&ModelRef::new("llama", "8b")).await.unwrap_err();
        assert!(matches!(err, PullError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_puller_exit_status() {
        let daemon = DaemonConfig {
            binary: "false".to_string(),
            ..Default::default()
        };
        let puller = CliPuller::new(&daemon, &PullConfig::default());
        let err = puller.pull(&ModelRef::new("llama", "8b")).await.unwrap_err();
        assert!(matches!(err, PullError::ExitStatus(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_puller_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-ollama");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let daemon = DaemonConfig {
            binary: script.to_string_lossy().to_string(),
            ..Default::default()
        };
        let pull = PullConfig {
            timeout_secs: Some(1),
            ..Default::default()
        };
        let puller = CliPuller::new(&daemon, &pull);
        let err = puller.pull(&ModelRef::new("llama", "8b")).await.unwrap_err();
        assert!(matches!(err, PullError::Timeout(_)));
    }
}
