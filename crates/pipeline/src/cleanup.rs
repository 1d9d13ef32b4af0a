//! Emptying the video work directory between runs.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Base directory not found: {0}")]
    BaseMissing(PathBuf),

    #[error("Temp root is outside base directory: {0}")]
    OutsideBase(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// What [`clean_temp`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub root: PathBuf,
    pub created: bool,
    pub removed: usize,
}

/// Join `relative` onto an already canonical `base`, resolving `.` and `..`
/// without touching the filesystem.
fn resolve_under(base: &Path, relative: &Path) -> PathBuf {
    let mut resolved = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::Prefix(_) => {
                resolved = PathBuf::from(component.as_os_str());
            }
        }
    }
    resolved
}

/// Empty `base/subdir`, creating it when it does not exist yet.
///
/// # Arguments
/// * `base` - Existing directory the temp root must stay inside
/// * `subdir` - Temp root relative to `base`
///
/// # Returns
/// * `Err(CleanupError::OutsideBase)` if `subdir` resolves outside `base`,
///   including through a symlink
pub fn clean_temp(base: &Path, subdir: &Path) -> Result<CleanupOutcome, CleanupError> {
    let base = base
        .canonicalize()
        .ok()
        .filter(|b| b.is_dir())
        .ok_or_else(|| CleanupError::BaseMissing(base.to_path_buf()))?;

    let mut root = resolve_under(&base, subdir);
    if !root.starts_with(&base) || root == base {
        return Err(CleanupError::OutsideBase(root));
    }

    if !root.exists() {
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Created temp root");
        return Ok(CleanupOutcome { root, created: true, removed: 0 });
    }

    root = root.canonicalize()?;
    if !root.starts_with(&base) || root == base {
        return Err(CleanupError::OutsideBase(root));
    }

    let mut removed = 0;
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        debug!(path = %path.display(), "Removed temp entry");
        removed += 1;
    }

    if removed == 0 {
        info!(root = %root.display(), "Temp root already empty");
    } else {
        info!(root = %root.display(), removed, "Temp root cleaned");
    }
    Ok(CleanupOutcome { root, created: false, removed })
}
