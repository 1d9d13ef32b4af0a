//! Discovery module for turning user-supplied paths into enhancement jobs.
//!
//! Accepts a mix of files and directories, walks directories recursively and
//! keeps only files whose extension belongs to the requested media kind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Image file extensions accepted for enhancement (case-insensitive matching).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// Video file extensions accepted for frame extraction (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "m4v", "webm"];

/// Kind of media a discovery pass is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => IMAGE_EXTENSIONS,
            MediaKind::Video => VIDEO_EXTENSIONS,
        }
    }

    /// Checks if a file has an extension of this kind (case-insensitive).
    pub fn matches(self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext_lower = ext.to_lowercase();
                self.extensions().contains(&ext_lower.as_str())
            })
            .unwrap_or(false)
    }
}

/// Expands `paths` into the list of media files to process.
///
/// - Files are kept when their extension matches `kind`
/// - Directories are walked recursively; directories named `output_dir_name`
///   are not descended into so that a rerun never picks up its own outputs
/// - Missing paths and non-matching files are skipped silently
/// - Duplicates (by canonical path) are dropped, first occurrence wins
///
/// # Arguments
/// * `paths` - Files and/or directories supplied by the user
/// * `kind` - Which extension allow-list to apply
/// * `output_dir_name` - Name of the output directory to exclude from walks
pub fn discover(paths: &[PathBuf], kind: MediaKind, output_dir_name: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    let mut push = |path: &Path| {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if seen.insert(key) {
            found.push(path.to_path_buf());
        }
    };

    for root in paths {
        if root.is_file() {
            if kind.matches(root) {
                push(root);
            }
            continue;
        }

        if !root.is_dir() {
            continue;
        }

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                // Allow the root itself even if it happens to carry the output name
                !(entry.depth() > 0
                    && entry.file_type().is_dir()
                    && entry.file_name().to_str() == Some(output_dir_name))
            });

        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && kind.matches(entry.path()) {
                push(entry.path());
            }
        }
    }

    found
}
