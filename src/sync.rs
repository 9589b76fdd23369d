//! Default configuration sync into the daemon's home directory
//!
//! Recursive copy that keeps permission bits and modification times. Files
//! whose size and mtime already match the destination are left alone.

use crate::error::SyncError;
use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Counters for a finished sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub files_copied: usize,
    pub files_skipped: usize,
    pub dirs_created: usize,
    pub links_created: usize,
}

/// Copy `source` into `destination`, creating `destination` if needed
pub fn sync_tree(source: &Path, destination: &Path) -> Result<SyncStats, SyncError> {
    if !source.exists() {
        return Err(SyncError::SourceMissing(source.to_path_buf()));
    }

    let mut stats = SyncStats::default();
    // Directory modes and times are applied last: copying into a directory
    // bumps its mtime, and a read-only mode would block the copy
    let mut dir_attrs: Vec<(PathBuf, fs::Permissions, FileTime)> = Vec::new();

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|source_err| SyncError::Walk {
            path: source.to_path_buf(),
            source: source_err,
        })?;

        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = destination.join(relative);
        let metadata = entry
            .path()
            .symlink_metadata()
            .map_err(SyncError::io(entry.path()))?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            if !target.is_dir() {
                fs::create_dir_all(&target).map_err(SyncError::io(&target))?;
                stats.dirs_created += 1;
            }
            ensure_writable(&target)?;
            dir_attrs.push((
                target,
                metadata.permissions(),
                FileTime::from_last_modification_time(&metadata),
            ));
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            stats.links_created += 1;
        } else if is_up_to_date(&metadata, &target) {
            stats.files_skipped += 1;
        } else {
            copy_file(entry.path(), &target, &metadata)?;
            stats.files_copied += 1;
        }
    }

    for (dir, permissions, mtime) in dir_attrs.into_iter().rev() {
        fs::set_permissions(&dir, permissions).map_err(SyncError::io(&dir))?;
        filetime::set_file_mtime(&dir, mtime).map_err(SyncError::io(&dir))?;
    }

    Ok(stats)
}

/// Give the owner write access to a target directory left read-only by a previous sync
#[cfg(unix)]
fn ensure_writable(dir: &Path) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(dir).map_err(SyncError::io(dir))?.permissions();
    if permissions.mode() & 0o700 != 0o700 {
        permissions.set_mode(permissions.mode() | 0o700);
        fs::set_permissions(dir, permissions).map_err(SyncError::io(dir))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_writable(dir: &Path) -> Result<(), SyncError> {
    let mut permissions = fs::metadata(dir).map_err(SyncError::io(dir))?.permissions();
    if permissions.readonly() {
        permissions.set_readonly(false);
        fs::set_permissions(dir, permissions).map_err(SyncError::io(dir))?;
    }
    Ok(())
}

fn is_up_to_date(source_meta: &fs::Metadata, target: &Path) -> bool {
    let Ok(target_meta) = target.symlink_metadata() else {
        return false;
    };
    target_meta.is_file()
        && target_meta.len() == source_meta.len()
        && FileTime::from_last_modification_time(&target_meta)
            == FileTime::from_last_modification_time(source_meta)
}

fn copy_file(source: &Path, target: &Path, metadata: &fs::Metadata) -> Result<(), SyncError> {
    // A stale symlink or read-only file at the target would break fs::copy
    if let Ok(existing) = target.symlink_metadata()
        && (existing.file_type().is_symlink() || existing.permissions().readonly())
    {
        fs::remove_file(target).map_err(SyncError::io(target))?;
    }

    fs::copy(source, target).map_err(SyncError::io(target))?;
    fs::set_permissions(target, metadata.permissions()).map_err(SyncError::io(target))?;
    filetime::set_file_times(
        target,
        FileTime::from_last_access_time(metadata),
        FileTime::from_last_modification_time(metadata),
    )
    .map_err(SyncError::io(target))?;
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> Result<(), SyncError> {
    let link = fs::read_link(source).map_err(SyncError::io(source))?;
    if target.symlink_metadata().is_ok() {
        fs::remove_file(target).map_err(SyncError::io(target))?;
    }
    std::os::unix::fs::symlink(&link, target).map_err(SyncError::io(target))
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> Result<(), SyncError> {
    let metadata = fs::metadata(source).map_err(SyncError::io(source))?;
    copy_file(source, target, &metadata)
}
