//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main prepper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrepperConfig {
    pub manifest_path: PathBuf,
    pub config_source: PathBuf,
    pub config_dest: PathBuf,
    pub skip_config_sync: bool,
    pub daemon: DaemonConfig,
    pub readiness: ReadinessConfig,
    pub pull: PullConfig,
    pub handoff: HandoffConfig,
}

impl Default for PrepperConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            config_source: default_config_source(),
            config_dest: default_config_dest(),
            skip_config_sync: false,
            daemon: DaemonConfig::default(),
            readiness: ReadinessConfig::default(),
            pull: PullConfig::default(),
            handoff: HandoffConfig::default(),
        }
    }
}

impl PrepperConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(manifest) = std::env::var("PREPPER_MANIFEST") {
            config.manifest_path = PathBuf::from(manifest);
        }
        if let Ok(source) = std::env::var("PREPPER_CONFIG_SOURCE") {
            config.config_source = PathBuf::from(source);
        }
        if let Ok(dest) = std::env::var("PREPPER_CONFIG_DEST") {
            config.config_dest = PathBuf::from(dest);
        }
        if let Ok(binary) = std::env::var("PREPPER_DAEMON_BINARY") {
            config.daemon.binary = binary;
        }
        if let Ok(log_dir) = std::env::var("PREPPER_LOG_DIR") {
            config.daemon.log_dir = PathBuf::from(log_dir);
        }
        if let Ok(timeout) = std::env::var("PREPPER_READY_TIMEOUT") {
            config.readiness.timeout_secs = timeout
                .parse()
                .context("Invalid PREPPER_READY_TIMEOUT value")?;
        }
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            config.daemon.host = host;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.daemon.binary.trim().is_empty() {
            anyhow::bail!("Daemon binary cannot be empty");
        }
        if self.daemon.host.trim().is_empty() {
            anyhow::bail!("Daemon host cannot be empty");
        }
        if self.handoff.program.trim().is_empty() {
            anyhow::bail!("Handoff program cannot be empty");
        }

        let readiness = &self.readiness;
        if readiness.initial_backoff_ms == 0 || readiness.max_backoff_ms == 0 {
            anyhow::bail!("Readiness backoff must be > 0");
        }
        if readiness.initial_backoff_ms > readiness.max_backoff_ms {
            anyhow::bail!(
                "Readiness initial backoff ({}ms) exceeds max backoff ({}ms)",
                readiness.initial_backoff_ms,
                readiness.max_backoff_ms
            );
        }
        if readiness.timeout_secs == 0 {
            anyhow::bail!("Readiness timeout must be > 0");
        }
        if self.pull.timeout_secs == Some(0) {
            anyhow::bail!("Pull timeout must be > 0 when set");
        }

        Ok(())
    }
}

/// How the model-serving daemon is launched and reached
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub binary: String,
    /// Address the daemon listens on, exported to it as `OLLAMA_HOST`
    pub host: String,
    pub log_dir: PathBuf,
    pub stop_grace_secs: u64,
    /// Extra environment for `serve` and `pull`
    pub env: BTreeMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: "ollama".to_string(),
            host: "127.0.0.1:11434".to_string(),
            log_dir: PathBuf::from("/var/log/ollama-prepper"),
            stop_grace_secs: 10,
            env: BTreeMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Base URL of the daemon's HTTP endpoint
    ///
    /// Mirrors how Ollama reads `OLLAMA_HOST`: a bare host gets port 11434,
    /// an explicit `http://` or `https://` scheme gets 80 or 443. Wildcard and
    /// empty hosts are reached through loopback.
    pub fn daemon_base_url(&self) -> String {
        let raw = self.host.trim();
        let (scheme, rest, default_port) = match raw.split_once("://") {
            Some(("http", rest)) => ("http", rest, 80),
            Some(("https", rest)) => ("https", rest, 443),
            Some((scheme, rest)) => (scheme, rest, DEFAULT_OLLAMA_PORT),
            None => ("http", raw, DEFAULT_OLLAMA_PORT),
        };
        let authority = rest.split('/').next().unwrap_or("");
        let (host, port) = split_host_port(authority);

        let host = match host {
            "" | "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            other => other,
        };
        let port = port.unwrap_or(default_port);

        if host.contains(':') {
            format!("{}://[{}]:{}", scheme, host, port)
        } else {
            format!("{}://{}:{}", scheme, host, port)
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Bounded readiness polling
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            timeout_secs: 30,
            request_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PullConfig {
    /// Upper bound for a single pull; unbounded when unset
    pub timeout_secs: Option<u64>,
    /// Skip the handoff and exit non-zero when any pull fails
    pub fail_on_error: bool,
}

impl PullConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Startup script run after provisioning
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HandoffConfig {
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            args: vec!["start.sh".to_string()],
            working_dir: None,
        }
    }
}

const DEFAULT_OLLAMA_PORT: u16 = 11434;

/// Split `host:port`, `[v6]:port`, `[v6]` or a bare host
fn split_host_port(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[')
        && let Some((host, tail)) = rest.split_once(']')
    {
        return (host, tail.strip_prefix(':').and_then(|p| p.parse().ok()));
    }

    match authority.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        _ => (authority, None),
    }
}

// Default functions
fn default_manifest_path() -> PathBuf {
    PathBuf::from("/tmp/models.yaml")
}
fn default_config_source() -> PathBuf {
    PathBuf::from("/tmp/.ollama")
}
fn default_config_dest() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".ollama"))
        .unwrap_or_else(|| PathBuf::from("/root/.ollama"))
}
