//! Resumable enhancement of an extracted frame set.
//!
//! Frames that already have an enhanced counterpart are never resubmitted.
//! The remaining frames are retried until none are missing. After the first
//! pass, every further pass must strictly shrink the missing set. Only a
//! complete set is merged.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::batch::{BatchCoordinator, Job, RunStatistics};
use crate::frameset::{FrameSet, FrameSetError};
use crate::media::merge::{FrameMerger, MergeError, MergeRequest};
use crate::media::tool::ToolError;
use crate::progress::ProgressReporter;
use crate::resume::EnhancedFrameMap;

/// Error type for the upscale operation
#[derive(Debug, Error)]
pub enum UpscaleError {
    /// The frame directory has no metadata record
    #[error("Frame metadata missing in {0}")]
    MetadataMissing(PathBuf),

    /// Two consecutive passes left the same number of frames missing
    #[error(
        "Unable to enhance all frames; still missing {}: {}",
        .missing.len(),
        .missing.join(", ")
    )]
    ConvergenceFailure { missing: Vec<String> },

    #[error("Upscale cancelled")]
    Cancelled,

    /// The frame directory holds no frames
    #[error("No frames found in {0}")]
    NoFrames(PathBuf),

    #[error("Invalid frame set: {0}")]
    FrameSet(FrameSetError),

    #[error("Merge failed: {0}")]
    Merge(MergeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameSetError> for UpscaleError {
    fn from(e: FrameSetError) -> Self {
        match e {
            FrameSetError::MetadataMissing(dir) => UpscaleError::MetadataMissing(dir),
            FrameSetError::Io(io) => UpscaleError::Io(io),
            other => UpscaleError::FrameSet(other),
        }
    }
}

impl From<MergeError> for UpscaleError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Tool(ToolError::Cancelled) => UpscaleError::Cancelled,
            other => UpscaleError::Merge(other),
        }
    }
}

/// Result of a completed upscale
#[derive(Debug, Clone)]
pub struct UpscaleOutcome {
    /// Newest enhanced file of every frame, in frame order
    pub enhanced_frames: Vec<PathBuf>,
    /// The merged video
    pub video: PathBuf,
    /// Statistics of every batch pass that was needed (empty when nothing was missing)
    pub passes: Vec<RunStatistics>,
}

/// Drives a frame set to completion and merges it
pub struct UpscaleCoordinator {
    batch: BatchCoordinator,
    merger: Arc<dyn FrameMerger>,
    reporter: ProgressReporter,
    concurrency: usize,
    output_dir_name: String,
    mute_audio: bool,
}

impl UpscaleCoordinator {
    pub fn new(
        batch: BatchCoordinator,
        merger: Arc<dyn FrameMerger>,
        reporter: ProgressReporter,
        concurrency: usize,
        output_dir_name: impl Into<String>,
        mute_audio: bool,
    ) -> Self {
        Self {
            batch,
            merger,
            reporter,
            concurrency,
            output_dir_name: output_dir_name.into(),
            mute_audio,
        }
    }

    /// Enhance every frame of `frame_directory` and merge the result.
    ///
    /// # Returns
    /// * `Ok(UpscaleOutcome)` once all frames are enhanced and merged
    /// * `Err(UpscaleError::MetadataMissing)` if the frame set has no `meta.json`
    /// * `Err(UpscaleError::ConvergenceFailure)` naming the frames that could not be enhanced
    /// * `Err(UpscaleError::Cancelled)` if the run was cancelled
    pub async fn upscale(&self, frame_directory: &Path) -> Result<UpscaleOutcome, UpscaleError> {
        let cancel = self.batch.cancel_flag().clone();
        let frame_set = FrameSet::load(frame_directory)?;
        if frame_set.frame_files.is_empty() {
            return Err(UpscaleError::NoFrames(frame_directory.to_path_buf()));
        }

        let output_dir = frame_directory.join(&self.output_dir_name);
        fs::create_dir_all(&output_dir)?;

        let stems = frame_set.frame_stems();
        let frames_by_stem: HashMap<&str, (usize, &PathBuf)> = stems
            .iter()
            .zip(frame_set.frame_files.iter())
            .enumerate()
            .map(|(index, (stem, path))| (stem.as_str(), (index, path)))
            .collect();

        let mut map = EnhancedFrameMap::build(&output_dir)?;
        let mut missing: Vec<String> = map.missing(&stems).into_iter().map(String::from).collect();
        let mut passes = Vec::new();
        let mut last_count: Option<usize> = None;

        if missing.is_empty() {
            info!(dir = %frame_directory.display(), "All frames already enhanced");
        } else {
            info!(
                dir = %frame_directory.display(),
                total = stems.len(),
                missing = missing.len(),
                "Enhancing frames"
            );
        }

        while !missing.is_empty() {
            if cancel.is_cancelled() {
                return Err(UpscaleError::Cancelled);
            }

            self.reporter.progress(
                format!(
                    "Enhancing {} of {} frames (pass {})",
                    missing.len(),
                    stems.len(),
                    passes.len() + 1
                ),
                (stems.len() - missing.len()) as f64 / stems.len() as f64 * 100.0,
            );

            let jobs: Vec<Job> = missing
                .iter()
                .filter_map(|stem| frames_by_stem.get(stem.as_str()))
                .map(|(index, path)| Job::new((*path).clone(), *index))
                .collect();
            let stats = self.batch.run(jobs, self.concurrency).await;
            passes.push(stats);

            if cancel.is_cancelled() {
                return Err(UpscaleError::Cancelled);
            }

            map = EnhancedFrameMap::build(&output_dir)?;
            let still_missing: Vec<String> =
                map.missing(&stems).into_iter().map(String::from).collect();

            if last_count.is_some_and(|last| still_missing.len() >= last) {
                error!(
                    dir = %frame_directory.display(),
                    missing = still_missing.len(),
                    "No progress on missing frames after retry"
                );
                return Err(UpscaleError::ConvergenceFailure {
                    missing: still_missing,
                });
            }
            last_count = Some(still_missing.len());
            missing = still_missing;
        }

        let mut enhanced_frames = Vec::with_capacity(stems.len());
        let mut absent = Vec::new();
        for stem in &stems {
            match map.get(stem) {
                Some(path) if path.exists() => enhanced_frames.push(path.to_path_buf()),
                _ => absent.push(stem.clone()),
            }
        }
        if !absent.is_empty() {
            return Err(UpscaleError::ConvergenceFailure { missing: absent });
        }

        self.reporter.progress("Merging enhanced frames", 100.0);
        let video = self
            .merger
            .merge(
                MergeRequest {
                    frames: enhanced_frames.clone(),
                    source_video: frame_set.source_video_path.clone(),
                    fps: frame_set.fps,
                    mute_audio: self.mute_audio,
                    work_dir: frame_directory.to_path_buf(),
                },
                &cancel,
            )
            .await?;

        info!(video = %video.display(), frames = enhanced_frames.len(), "Upscale complete");
        Ok(UpscaleOutcome {
            enhanced_frames,
            video,
            passes,
        })
    }
}
