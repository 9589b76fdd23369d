//! Daemon readiness probing

use crate::config::{DaemonConfig, ReadinessConfig};
use crate::daemon::DaemonGuard;
use crate::error::ReadinessError;
use async_trait::async_trait;
use tokio::time::{Duration, Instant, sleep};

/// Trait for checking whether the daemon accepts requests
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> anyhow::Result<()>;
}

/// Probes `GET /api/version` on the daemon's HTTP endpoint
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpReadinessProbe {
    pub fn new(daemon: &DaemonConfig, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/version", daemon.daemon_base_url()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn check(&self) -> anyhow::Result<()> {
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Readiness check returned status: {}", response.status());
        }

        Ok(())
    }
}

/// Exponential backoff bounded by a hard deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Poll `probe` until it succeeds, the deadline passes, or the daemon dies.
///
/// The first check runs immediately. Returns the number of attempts made.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    policy: &ReadinessPolicy,
    daemon: Option<&DaemonGuard>,
) -> Result<u32, ReadinessError> {
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut backoff = policy.initial_backoff;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match probe.check().await {
            Ok(()) => {
                tracing::info!(
                    attempts = attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Daemon is ready"
                );
                return Ok(attempts);
            }
            Err(e) => {
                tracing::debug!(attempt = attempts, error = %e, "Daemon not ready yet");
            }
        }

        if let Some(daemon) = daemon
            && !daemon.is_running().await
        {
            return Err(ReadinessError::DaemonExited);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReadinessError::Timeout {
                attempts,
                elapsed: now - started,
            });
        }

        sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(policy.max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::mocks::MockDaemonLauncher;
    use crate::daemon::DaemonSpec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Succeeds once `ready_after` checks have failed
    struct CountingProbe {
        calls: AtomicU32,
        ready_after: Option<u32>,
    }

    impl CountingProbe {
        fn ready_after(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_after: Some(n),
            }
        }

        fn never() -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_after: None,
            }
        }
    }

    #[async_trait]
    impl ReadinessProbe for CountingProbe {
        async fn check(&self) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.ready_after {
                Some(n) if call >= n => Ok(()),
                _ => anyhow::bail!("connection refused"),
            }
        }
    }

    fn policy() -> ReadinessPolicy {
        ReadinessPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately_does_not_sleep() {
        let probe = CountingProbe::ready_after(0);
        let started = Instant::now();

        let attempts = wait_until_ready(&probe, &policy(), None).await.unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles() {
        let probe = CountingProbe::ready_after(3);
        let started = Instant::now();

        let attempts = wait_until_ready(&probe, &policy(), None).await.unwrap();

        assert_eq!(attempts, 4);
        // 100 + 200 + 400
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_hard_bound() {
        let probe = CountingProbe::never();
        let started = Instant::now();

        let err = wait_until_ready(&probe, &policy(), None).await.unwrap_err();

        match err {
            ReadinessError::Timeout { attempts, elapsed } => {
                assert!(attempts > 1);
                assert_eq!(elapsed, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_exit_is_reported() {
        let launcher = Arc::new(MockDaemonLauncher::new());
        let guard = DaemonGuard::start(
            launcher.clone(),
            &DaemonSpec::serve(&DaemonConfig::default()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        launcher.crash_all();

        let probe = CountingProbe::never();
        let err = wait_until_ready(&probe, &policy(), Some(&guard))
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::DaemonExited));
        guard.shutdown().await.unwrap();
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReadinessPolicy::from(&ReadinessConfig::default());
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(2));
        assert_eq!(policy.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_http_probe_url() {
        let probe =
            HttpReadinessProbe::new(&DaemonConfig::default(), Duration::from_secs(1)).unwrap();
        assert_eq!(probe.url(), "http://127.0.0.1:11434/api/version");
    }

    #[tokio::test]
    async fn test_http_probe_fails_without_server() {
        let daemon = DaemonConfig {
            host: "127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let probe = HttpReadinessProbe::new(&daemon, Duration::from_millis(500)).unwrap();
        assert!(probe.check().await.is_err());
    }
}
