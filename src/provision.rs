//! The provisioning sequence
//!
//! sync config → load manifest → start daemon → wait ready → pull models →
//! stop daemon → hand off.
//!
//! The manifest is read before the daemon starts, so a bad manifest aborts
//! without leaving a daemon behind. Once started, the daemon is owned by a
//! [`DaemonGuard`] and released on every path.

use crate::config::PrepperConfig;
use crate::daemon::{DaemonGuard, DaemonLauncher, DaemonSpec, SystemDaemonLauncher};
use crate::handoff::{HandoffRunner, HandoffSpec, SystemHandoff};
use crate::health::{HttpReadinessProbe, ReadinessPolicy, ReadinessProbe, wait_until_ready};
use crate::manifest::{Manifest, ModelRef};
use crate::pull::{CliPuller, ModelPuller, PullReport, pull_all};
use crate::report::write_report;
use crate::sync::sync_tree;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Per-run switches, usually from the command line
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    /// Log the pulls that would be issued and stop
    pub dry_run: bool,
    pub no_handoff: bool,
    /// Restrict pulls to these models (must also be in the manifest)
    pub only: Vec<ModelRef>,
    pub report_path: Option<PathBuf>,
}

/// Injectable collaborators
pub struct Components {
    pub launcher: Arc<dyn DaemonLauncher>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub puller: Arc<dyn ModelPuller>,
    pub handoff: Arc<dyn HandoffRunner>,
}

impl Components {
    /// Production components built from config
    pub fn system(config: &PrepperConfig) -> Result<Self> {
        let probe = HttpReadinessProbe::new(
            &config.daemon,
            Duration::from_millis(config.readiness.request_timeout_ms),
        )
        .context("Failed to build readiness probe")?;

        Ok(Self {
            launcher: Arc::new(SystemDaemonLauncher::new()),
            probe: Arc::new(probe),
            puller: Arc::new(CliPuller::new(&config.daemon, &config.pull)),
            handoff: Arc::new(SystemHandoff),
        })
    }
}

/// Final result of a run
#[derive(Debug)]
pub struct Outcome {
    pub exit_code: i32,
    /// `None` for dry runs
    pub report: Option<PullReport>,
}

pub struct Provisioner {
    config: PrepperConfig,
    options: ProvisionOptions,
    components: Components,
}

impl Provisioner {
    /// Create a provisioner with custom components
    pub fn new_with_components(
        config: PrepperConfig,
        options: ProvisionOptions,
        components: Components,
    ) -> Self {
        Self {
            config,
            options,
            components,
        }
    }

    /// Create a provisioner with the system daemon, probe, puller and handoff
    pub fn new(config: PrepperConfig, options: ProvisionOptions) -> Result<Self> {
        let components = Components::system(&config)?;
        Ok(Self::new_with_components(config, options, components))
    }

    /// Run the full sequence and return the process exit code
    pub async fn run(&self) -> Result<Outcome> {
        let report = self.provision().await?;
        self.finish(report).await
    }

    /// Everything up to and including daemon stop.
    ///
    /// Returns `None` on a dry run.
    pub async fn provision(&self) -> Result<Option<PullReport>> {
        if self.options.dry_run {
            let models = self.load_models()?;
            for model in &models {
                tracing::info!(model = %model, "Would pull model");
            }
            tracing::info!(count = models.len(), "Dry run complete");
            return Ok(None);
        }

        self.sync_config().await;

        let models = self.load_models()?;

        let spec = DaemonSpec::serve(&self.config.daemon);
        let daemon = DaemonGuard::start(
            self.components.launcher.clone(),
            &spec,
            self.config.daemon.stop_grace(),
        )
        .await?;

        let policy = ReadinessPolicy::from(&self.config.readiness);
        let probe = self.components.probe.as_ref();
        if let Err(e) = wait_until_ready(probe, &policy, Some(&daemon)).await {
            if let Err(stop_err) = daemon.shutdown().await {
                tracing::warn!(error = %stop_err, "Failed to stop daemon after readiness failure");
            }
            return Err(e).context("Daemon did not become ready");
        }

        let report = pull_all(self.components.puller.as_ref(), models).await;
        report.log_summary();

        if let Some(path) = &self.options.report_path
            && let Err(e) = write_report(path, &report).await
        {
            tracing::warn!(error = %e, path = %path.display(), "Failed to write pull report");
        }

        if let Err(e) = daemon.shutdown().await {
            tracing::warn!(error = %e, "Failed to stop daemon");
        }

        Ok(Some(report))
    }

    /// Apply strict mode and run the handoff
    pub async fn finish(&self, report: Option<PullReport>) -> Result<Outcome> {
        let Some(report) = report else {
            return Ok(Outcome {
                exit_code: 0,
                report: None,
            });
        };

        if self.config.pull.fail_on_error && !report.is_success() {
            tracing::error!(
                failed = report.failed().len(),
                "Pull failures with fail_on_error set, skipping handoff"
            );
            return Ok(Outcome {
                exit_code: 1,
                report: Some(report),
            });
        }

        if self.options.no_handoff {
            tracing::info!("Handoff disabled");
            return Ok(Outcome {
                exit_code: 0,
                report: Some(report),
            });
        }

        let spec = HandoffSpec::from(&self.config.handoff);
        let exit_code = self.components.handoff.run(&spec).await?;

        Ok(Outcome {
            exit_code,
            report: Some(report),
        })
    }

    /// Failures are logged and never abort the run
    async fn sync_config(&self) {
        if self.config.skip_config_sync {
            tracing::debug!("Config sync disabled");
            return;
        }

        let source = self.config.config_source.clone();
        let dest = self.config.config_dest.clone();
        let result = tokio::task::spawn_blocking(move || sync_tree(&source, &dest)).await;

        match result {
            Ok(Ok(stats)) => tracing::info!(
                source = %self.config.config_source.display(),
                dest = %self.config.config_dest.display(),
                copied = stats.files_copied,
                skipped = stats.files_skipped,
                dirs = stats.dirs_created,
                links = stats.links_created,
                "Config synced"
            ),
            Ok(Err(e)) => tracing::warn!(error = %e, "Config sync failed, continuing"),
            Err(e) => tracing::warn!(error = %e, "Config sync task failed, continuing"),
        }
    }

    fn load_models(&self) -> Result<Vec<ModelRef>> {
        let path = &self.config.manifest_path;
        let manifest = Manifest::load(path)
            .with_context(|| format!("Failed to load model manifest {:?}", path))?;

        tracing::info!(
            path = %path.display(),
            families = manifest.families().count(),
            models = manifest.len(),
            "Manifest loaded"
        );

        Ok(select_models(&manifest, &self.options.only))
    }
}

/// Manifest models, narrowed to `only` when it is non-empty
pub fn select_models(manifest: &Manifest, only: &[ModelRef]) -> Vec<ModelRef> {
    if only.is_empty() {
        return manifest.models().collect();
    }

    for model in only {
        if !manifest.contains(model) {
            tracing::warn!(model = %model, "Requested model is not in the manifest, ignoring");
        }
    }

    manifest.models().filter(|m| only.contains(m)).collect()
}
