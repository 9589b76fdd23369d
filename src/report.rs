//! Pull report persistence

use crate::pull::PullReport;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Write the report as pretty JSON, atomically (temp file, then rename)
pub async fn write_report(path: &Path, report: &PullReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("Failed to serialize report")?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Cannot create report directory: {:?}", parent))?;
    }

    let temp_file = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_file)
        .await
        .context("Failed to create temp report file")?;
    file.write_all(content.as_bytes())
        .await
        .context("Failed to write report file")?;
    file.sync_all().await.context("Failed to sync report file")?;

    fs::rename(&temp_file, path)
        .await
        .context("Failed to rename temp report file")?;

    tracing::info!(path = %path.display(), "Pull report written");
    Ok(())
}
