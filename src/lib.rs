//! Ollama Prepper - local model runtime provisioning
//!
//! Syncs default daemon configuration, starts the model-serving daemon, pulls
//! every model listed in a YAML manifest, stops the daemon and hands off to
//! the primary application's startup script.

pub mod config;
pub mod daemon;
pub mod error;
pub mod handoff;
pub mod health;
pub mod manifest;
pub mod provision;
pub mod pull;
pub mod report;
pub mod sync;

pub use config::PrepperConfig;
pub use daemon::{DaemonGuard, DaemonLauncher, SystemDaemonLauncher};
pub use error::{ManifestError, PullError, ReadinessError, SyncError};
pub use manifest::{Manifest, ModelRef};
pub use provision::{Components, Outcome, ProvisionOptions, Provisioner};
pub use pull::{PullReport, PullStatus};
