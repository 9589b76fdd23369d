//! Error types for the provisioning steps

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Manifest loading errors
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("manifest top level must be a mapping of model families (got {0})")]
    NotAMapping(&'static str),

    #[error("model family '{family}' must map model ids (got {found})")]
    InvalidFamily { family: String, found: &'static str },

    #[error("unsupported manifest key (got {0})")]
    InvalidKey(&'static str),
}

/// Configuration tree sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync source {0:?} does not exist")]
    SourceMissing(PathBuf),

    #[error("failed to walk {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to copy {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| SyncError::Io { path, source }
    }
}

/// Daemon readiness errors
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("daemon not ready after {attempts} attempts ({elapsed:?})")]
    Timeout { attempts: u32, elapsed: Duration },

    #[error("daemon exited before becoming ready")]
    DaemonExited,
}

/// Single model pull errors
#[derive(Debug, Error)]
pub enum PullError {
    #[error("failed to run pull command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("pull exited with {0}")]
    ExitStatus(String),

    #[error("pull timed out after {0:?}")]
    Timeout(Duration),
}
