//! Extracted frame sets and their on-disk metadata record.
//!
//! A frame set lives in `<work_dir>/<content hash>/` and consists of
//! `frame_%08d.png` files plus a `meta.json` record describing the source.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name of the metadata record inside a frame directory
pub const METADATA_FILE: &str = "meta.json";

/// Prefix of extracted frame files
pub const FRAME_PREFIX: &str = "frame_";

/// Extension of extracted frame files
pub const FRAME_EXTENSION: &str = "png";

/// Error type for frame set operations
#[derive(Debug, Error)]
pub enum FrameSetError {
    /// The directory has no metadata record
    #[error("Frame metadata missing: {0}")]
    MetadataMissing(PathBuf),

    /// The metadata record could not be parsed
    #[error("Invalid frame metadata in {path}: {reason}")]
    InvalidMetadata { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Persisted description of an extracted frame set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameSetMetadata {
    pub source_video: PathBuf,
    pub fps: f64,
    pub total_frames: u64,
    #[serde(default)]
    pub content_hash: String,
}

/// An extracted frame set, ready for enhancement
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSet {
    pub directory: PathBuf,
    pub content_hash: String,
    pub source_video_path: PathBuf,
    pub fps: f64,
    pub frame_count: u64,
    /// Frame files in frame order
    pub frame_files: Vec<PathBuf>,
}

impl FrameSet {
    /// Load a frame set from its directory
    ///
    /// # Returns
    /// * `Err(FrameSetError::MetadataMissing)` if `meta.json` does not exist
    pub fn load(directory: &Path) -> Result<Self, FrameSetError> {
        let meta = read_metadata(directory)?;
        let frame_files = list_frames(directory)?;
        let content_hash = if meta.content_hash.is_empty() {
            directory
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            meta.content_hash
        };

        Ok(Self {
            directory: directory.to_path_buf(),
            content_hash,
            source_video_path: meta.source_video,
            fps: meta.fps,
            frame_count: meta.total_frames,
            frame_files,
        })
    }

    /// File stems of the frames, in frame order
    pub fn frame_stems(&self) -> Vec<String> {
        self.frame_files
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect()
    }
}

/// Compute the content hash of a file.
///
/// SHA-256 over the resolved path, the size in bytes and the modification
/// time in whole seconds (all as decimal strings, fed in that order),
/// rendered as lowercase hex. Contents are not read.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let resolved = path.canonicalize()?;
    let metadata = fs::metadata(&resolved)?;
    let mtime_secs = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(resolved.to_string_lossy().as_bytes());
    hasher.update(metadata.len().to_string().as_bytes());
    hasher.update(mtime_secs.to_string().as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `meta.json` into `directory`
pub fn write_metadata(directory: &Path, meta: &FrameSetMetadata) -> Result<(), FrameSetError> {
    let path = directory.join(METADATA_FILE);
    let json = serde_json::to_string_pretty(meta).map_err(|e| FrameSetError::InvalidMetadata {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    fs::write(path, json)?;
    Ok(())
}

/// Read `meta.json` from `directory`
pub fn read_metadata(directory: &Path) -> Result<FrameSetMetadata, FrameSetError> {
    let path = directory.join(METADATA_FILE);
    let mut file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(FrameSetError::MetadataMissing(directory.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    serde_json::from_str(&content).map_err(|e| FrameSetError::InvalidMetadata {
        path,
        reason: e.to_string(),
    })
}

/// List `frame_*.png` files in `directory`, sorted by name
pub fn list_frames(directory: &Path) -> io::Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = fs::read_dir(directory)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_frame_file(p))
        .collect();
    frames.sort();
    Ok(frames)
}

fn is_frame_file(path: &Path) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(FRAME_PREFIX))
        .unwrap_or(false);
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(FRAME_EXTENSION))
        .unwrap_or(false);
    name_ok && ext_ok
}
