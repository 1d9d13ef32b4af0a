//! Reassembly of enhanced frames into a video.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use super::tool::{run_tool, ToolError};
use crate::progress::CancelFlag;

/// Error type for merge operations
#[derive(Debug, Error)]
pub enum MergeError {
    /// Nothing to merge
    #[error("No frames to merge")]
    NoFrames,

    /// The image sequence mixes file formats
    #[error("Enhanced frames mix formats: {first} and {other}")]
    MixedFormats { first: String, other: String },

    /// ffmpeg failed or is missing
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to merge one video
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    /// Enhanced frames in playback order
    pub frames: Vec<PathBuf>,
    /// Video the frames were extracted from (audio source and output name)
    pub source_video: PathBuf,
    pub fps: f64,
    /// Drop the source audio track
    pub mute_audio: bool,
    /// Per-video working directory, removed after a successful merge
    pub work_dir: PathBuf,
}

/// Turns an ordered list of enhanced frames into a video file
#[async_trait]
pub trait FrameMerger: Send + Sync {
    async fn merge(
        &self,
        request: MergeRequest,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, MergeError>;
}

/// Render a frame rate for ffmpeg, without a fraction when it is whole
pub fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as i64)
    } else {
        format!("{}", fps)
    }
}

/// Build the ffmpeg command that encodes the image sequence
///
/// # Arguments
/// * `ffmpeg` - Path to the ffmpeg executable
/// * `pattern` - `frame_%08d.<ext>` pattern inside the scratch directory
/// * `fps` - Recorded frame rate of the source
/// * `audio_source` - Video whose audio is muxed in, or `None` when muted
/// * `output` - Final video path
pub fn build_merge_command(
    ffmpeg: &Path,
    pattern: &Path,
    fps: f64,
    audio_source: Option<&Path>,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-hide_banner", "-y", "-framerate"])
        .arg(format_fps(fps))
        .arg("-i")
        .arg(pattern);

    if let Some(source) = audio_source {
        cmd.arg("-i")
            .arg(source)
            .args(["-map", "0:v:0", "-map", "1:a:0?", "-c:a", "aac", "-shortest"]);
    }

    cmd.args(["-c:v", "libx264", "-pix_fmt", "yuv420p"]).arg(output);
    cmd
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Merger backed by the ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegMerger {
    ffmpeg: PathBuf,
    output_dir_name: String,
}

impl FfmpegMerger {
    pub fn new(ffmpeg: PathBuf, output_dir_name: impl Into<String>) -> Self {
        Self {
            ffmpeg,
            output_dir_name: output_dir_name.into(),
        }
    }

    /// `<source dir>/<output dir>/<source file name>`
    pub fn output_path(&self, source_video: &Path) -> PathBuf {
        let parent = source_video.parent().unwrap_or_else(|| Path::new("."));
        let name = source_video
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "output.mp4".into());
        parent.join(&self.output_dir_name).join(name)
    }

    async fn encode(
        &self,
        request: &MergeRequest,
        scratch: &Path,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, MergeError> {
        let first_ext = extension_of(&request.frames[0]);
        for (idx, frame) in request.frames.iter().enumerate() {
            let ext = extension_of(frame);
            if ext != first_ext {
                return Err(MergeError::MixedFormats {
                    first: first_ext,
                    other: ext,
                });
            }
            fs::copy(frame, scratch.join(format!("frame_{:08}.{}", idx + 1, ext)))?;
        }

        let output = self.output_path(&request.source_video);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }

        let pattern = scratch.join(format!("frame_%08d.{}", first_ext));
        let audio = (!request.mute_audio).then_some(request.source_video.as_path());
        let cmd = build_merge_command(&self.ffmpeg, &pattern, request.fps, audio, &output);
        run_tool(cmd, cancel, |_, _| {}).await?;

        Ok(output)
    }
}

#[async_trait]
impl FrameMerger for FfmpegMerger {
    async fn merge(
        &self,
        request: MergeRequest,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, MergeError> {
        if request.frames.is_empty() {
            return Err(MergeError::NoFrames);
        }

        let scratch = request
            .work_dir
            .join(&self.output_dir_name)
            .join(format!("merge_{}", Local::now().format("%Y%m%d_%H%M%S")));
        fs::create_dir_all(&scratch)?;

        let result = self.encode(&request, &scratch, cancel).await;

        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!(dir = %scratch.display(), "Failed to remove merge scratch directory: {}", e);
        }

        let output = result?;
        info!(output = %output.display(), frames = request.frames.len(), "Merged video");

        if let Err(e) = fs::remove_dir_all(&request.work_dir) {
            warn!(dir = %request.work_dir.display(), "Failed to remove work directory: {}", e);
        }

        Ok(output)
    }
}
