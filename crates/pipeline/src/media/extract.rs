//! Frame extraction from source videos.
//!
//! Every frame is written as `frame_%08d.png` into a directory named after
//! the video's content hash, so re-extracting an unchanged video lands in
//! the same place.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use super::probe::{probe_video, ProbeError};
use super::tool::{check_tool_available, run_tool, ToolError};
use crate::config::ToolsConfig;
use crate::frameset::{
    content_hash, list_frames, write_metadata, FrameSet, FrameSetError, FrameSetMetadata,
};
use crate::progress::{CancelFlag, ProgressReporter};

/// Error type for frame extraction
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    FrameSet(#[from] FrameSetError),

    /// The hash directory resolves outside the output root
    #[error("Refusing to remove directory outside output root: {0}")]
    OutsideRoot(PathBuf),

    /// Probe produced a frame count that cannot be extracted
    #[error("Invalid total frame count: {0}")]
    InvalidFrameCount(i64),

    /// ffmpeg exited successfully but wrote nothing
    #[error("No frames were extracted into {0}")]
    NoFrames(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ExtractError::Tool(ToolError::Cancelled)
                | ExtractError::Probe(ProbeError::Tool(ToolError::Cancelled))
        )
    }
}

/// Build the ffmpeg frame extraction command
///
/// # Arguments
/// * `ffmpeg` - Path to the ffmpeg executable
/// * `video` - Source video
/// * `out_dir` - Directory receiving `frame_%08d.png`
pub fn build_extract_command(ffmpeg: &Path, video: &Path, out_dir: &Path) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-hide_banner", "-nostats", "-progress", "pipe:1", "-i"])
        .arg(video)
        .args(["-vsync", "0"])
        .arg(out_dir.join("frame_%08d.png"));
    cmd
}

/// Extracts the frames of a video into a content-addressed directory
#[derive(Debug, Clone)]
pub struct FrameExtractor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FrameExtractor {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(tools.ffmpeg_path.clone(), tools.ffprobe_path.clone())
    }

    /// Extract every frame of `video` into `output_root/<content hash>/`.
    ///
    /// An existing directory for the same hash is removed first. The metadata
    /// record is written before ffmpeg starts so an interrupted extraction can
    /// still be identified.
    ///
    /// # Returns
    /// * `Ok(FrameSet)` with the extracted frames in order
    /// * `Err(ExtractError)` on missing tools, probe failures, cancellation or an empty result
    pub async fn extract(
        &self,
        video: &Path,
        output_root: &Path,
        cancel: &CancelFlag,
        progress: &ProgressReporter,
    ) -> Result<FrameSet, ExtractError> {
        check_tool_available(&self.ffmpeg, "-version").await?;
        check_tool_available(&self.ffprobe, "-version").await?;

        let hash = content_hash(video)?;
        fs::create_dir_all(output_root)?;
        let out_dir = output_root.join(&hash);

        if out_dir.exists() {
            let root_resolved = output_root.canonicalize()?;
            let dir_resolved = out_dir.canonicalize()?;
            if !dir_resolved.starts_with(&root_resolved) || dir_resolved == root_resolved {
                return Err(ExtractError::OutsideRoot(dir_resolved));
            }
            info!(dir = %out_dir.display(), "Removing previous extraction");
            fs::remove_dir_all(&dir_resolved)?;
        }
        fs::create_dir(&out_dir)?;

        let probe = probe_video(&self.ffprobe, video, cancel).await?;
        let total_frames = probe.total_frames();
        if total_frames <= 0 {
            return Err(ExtractError::InvalidFrameCount(total_frames));
        }
        let total_frames = total_frames as u64;

        let source_video = video.canonicalize()?;
        let meta = FrameSetMetadata {
            source_video: source_video.clone(),
            fps: probe.fps,
            total_frames,
            content_hash: hash.clone(),
        };
        write_metadata(&out_dir, &meta)?;

        info!(
            video = %video.display(),
            fps = probe.fps,
            total_frames,
            "Extracting frames"
        );
        progress.progress(format!("Extracting frames 0/{}", total_frames), 0.0);

        let cmd = build_extract_command(&self.ffmpeg, video, &out_dir);
        run_tool(cmd, cancel, |key, value| match key {
            "frame" => {
                if let Ok(frame) = value.parse::<u64>() {
                    let percent = frame as f64 / total_frames as f64 * 100.0;
                    progress.progress(
                        format!("Extracting frames {}/{}", frame.min(total_frames), total_frames),
                        percent,
                    );
                }
            }
            "progress" if value == "end" => {
                progress.progress(format!("Extracted {} frames", total_frames), 100.0);
            }
            _ => {}
        })
        .await?;

        let frame_files = list_frames(&out_dir)?;
        if frame_files.is_empty() {
            return Err(ExtractError::NoFrames(out_dir));
        }
        if frame_files.len() as u64 != total_frames {
            warn!(
                expected = total_frames,
                actual = frame_files.len(),
                "Extracted frame count differs from probe estimate"
            );
        }

        Ok(FrameSet {
            directory: out_dir,
            content_hash: hash,
            source_video_path: source_video,
            fps: probe.fps,
            frame_count: total_frames,
            frame_files,
        })
    }
}
