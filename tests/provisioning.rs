//! End-to-end provisioning runs against a scripted stand-in daemon
//!
//! The fake `ollama` script appends every call to an events file, so the
//! tests can assert the exact order of serve / pull / stop / handoff using the
//! real process launcher, pull runner and handoff.

#![cfg(unix)]

use async_trait::async_trait;
use ollama_prepper::config::PrepperConfig;
use ollama_prepper::daemon::SystemDaemonLauncher;
use ollama_prepper::handoff::SystemHandoff;
use ollama_prepper::health::ReadinessProbe;
use ollama_prepper::pull::CliPuller;
use ollama_prepper::{Components, ModelRef, ProvisionOptions, Provisioner};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const FAKE_OLLAMA: &str = r#"#!/bin/sh
case "$1" in
  serve)
    trap 'echo stopped >> "$PREPPER_TEST_STATE/events"; exit 0' TERM
    echo serve >> "$PREPPER_TEST_STATE/events"
    echo $$ > "$PREPPER_TEST_STATE/serve.pid"
    touch "$PREPPER_TEST_STATE/ready"
    while true; do sleep 0.1; done
    ;;
  pull)
    echo "pull $2" >> "$PREPPER_TEST_STATE/events"
    case "$2" in
      *broken*) exit 1 ;;
      *slow*) exec sleep 30 ;;
    esac
    ;;
esac
"#;

/// Ready once the fake daemon has touched its marker file
struct MarkerProbe {
    marker: PathBuf,
}

#[async_trait]
impl ReadinessProbe for MarkerProbe {
    async fn check(&self) -> anyhow::Result<()> {
        if self.marker.exists() {
            Ok(())
        } else {
            anyhow::bail!("marker {:?} missing", self.marker)
        }
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let binary = dir.path().join("ollama");
        std::fs::write(&binary, FAKE_OLLAMA).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let events = dir.path().join("events");
        std::fs::write(
            dir.path().join("start.sh"),
            format!("echo handoff >> {:?}\nexit 3\n", events),
        )
        .unwrap();

        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write_manifest(&self, content: &str) {
        std::fs::write(self.path("models.yaml"), content).unwrap();
    }

    fn config(&self) -> PrepperConfig {
        let mut config = PrepperConfig {
            manifest_path: self.path("models.yaml"),
            config_source: self.path("defaults/.ollama"),
            config_dest: self.path("home/.ollama"),
            ..Default::default()
        };
        config.daemon.binary = self.path("ollama").to_string_lossy().to_string();
        config.daemon.log_dir = self.path("logs");
        config.daemon.stop_grace_secs = 5;
        config.daemon.env.insert(
            "PREPPER_TEST_STATE".to_string(),
            self.dir.path().to_string_lossy().to_string(),
        );
        config.readiness.timeout_secs = 5;
        config.readiness.initial_backoff_ms = 20;
        config.readiness.max_backoff_ms = 200;
        config.handoff.program = "sh".to_string();
        config.handoff.args = vec!["start.sh".to_string()];
        config.handoff.working_dir = Some(self.dir.path().to_path_buf());
        config
    }

    fn provisioner(
        &self,
        config: PrepperConfig,
        options: ProvisionOptions,
        marker: &Path,
    ) -> Provisioner {
        let components = Components {
            launcher: Arc::new(SystemDaemonLauncher::new()),
            probe: Arc::new(MarkerProbe {
                marker: marker.to_path_buf(),
            }),
            puller: Arc::new(CliPuller::new(&config.daemon, &config.pull)),
            handoff: Arc::new(SystemHandoff),
        };
        Provisioner::new_with_components(config, options, components)
    }

    fn events(&self) -> Vec<String> {
        std::fs::read_to_string(self.path("events"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[tokio::test]
async fn test_full_run_with_failed_pull() {
    let fx = Fixture::new();
    fx.write_manifest(
        r#"
llama3.1:
  8b:
  70b:
phi3:
  mini: {quant: q4}
custom:
  broken:
"#,
    );
    let options = ProvisionOptions {
        report_path: Some(fx.path("report.json")),
        ..Default::default()
    };
    let provisioner = fx.provisioner(fx.config(), options, &fx.path("ready"));

    let outcome = provisioner.run().await.unwrap();

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(
        fx.events(),
        vec![
            "serve",
            "pull llama3.1:8b",
            "pull llama3.1:70b",
            "pull phi3:mini",
            "pull custom:broken",
            "stopped",
            "handoff",
        ]
    );

    let report = outcome.report.unwrap();
    assert_eq!(report.failed(), vec![&ModelRef::new("custom", "broken")]);
    assert!(fx.path("report.json").exists());
    assert!(fx.path("logs/ollama-serve.log").exists());
}

#[tokio::test]
async fn test_missing_manifest_never_starts_daemon() {
    let fx = Fixture::new();
    let provisioner = fx.provisioner(
        fx.config(),
        ProvisionOptions::default(),
        &fx.path("ready"),
    );

    let err = provisioner.run().await.unwrap_err();

    assert!(format!("{:#}", err).contains("manifest"));
    assert!(fx.events().is_empty());
}

#[tokio::test]
async fn test_readiness_timeout_stops_daemon() {
    let fx = Fixture::new();
    fx.write_manifest("llama3.1:\n  8b:\n");
    let mut config = fx.config();
    config.readiness.timeout_secs = 1;
    let provisioner = fx.provisioner(
        config,
        ProvisionOptions::default(),
        &fx.path("never-ready"),
    );

    assert!(provisioner.run().await.is_err());

    assert_eq!(fx.events(), vec!["serve", "stopped"]);
}

#[tokio::test]
async fn test_config_sync_before_serve() {
    let fx = Fixture::new();
    fx.write_manifest("{}\n");
    std::fs::create_dir_all(fx.path("defaults/.ollama")).unwrap();
    std::fs::write(fx.path("defaults/.ollama/id_ed25519"), "key").unwrap();
    let options = ProvisionOptions {
        no_handoff: true,
        ..Default::default()
    };
    let provisioner = fx.provisioner(fx.config(), options, &fx.path("ready"));

    let outcome = provisioner.run().await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(
        std::fs::read_to_string(fx.path("home/.ollama/id_ed25519")).unwrap(),
        "key"
    );
    assert_eq!(fx.events(), vec!["serve", "stopped"]);
}

/// Running and not a zombie
fn alive(pid: i32) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        return stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z");
    }
    if Path::new("/proc/self").exists() {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_interrupted_pull_kills_daemon() {
    let fx = Fixture::new();
    fx.write_manifest("llama3.1:\n  8b:\n  slow:\nphi3:\n  mini:\n");
    let provisioner = fx.provisioner(
        fx.config(),
        ProvisionOptions::default(),
        &fx.path("ready"),
    );

    // Interrupt once the slow pull is in flight, as the signal branch in main does
    let interrupted = tokio::select! {
        _ = provisioner.provision() => false,
        reached = wait_for(|| fx.events().iter().any(|e| e == "pull llama3.1:slow")) => reached,
    };
    assert!(interrupted, "pull loop never reached the slow model");

    let pid: i32 = std::fs::read_to_string(fx.path("serve.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_for(|| !alive(pid)).await,
        "daemon {} survived the interrupted run",
        pid
    );
    assert!(!fx.events().contains(&"pull phi3:mini".to_string()));
}
