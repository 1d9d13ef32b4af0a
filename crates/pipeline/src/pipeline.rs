//! Pipeline entry points used by the CLI
//!
//! A [`Pipeline`] owns the configuration, the cancel flag and the progress
//! reporter, and builds a fresh coordinator per run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::batch::{BatchCoordinator, BatchSettings, Job, RunStatistics};
use crate::cleanup::{clean_temp, CleanupError, CleanupOutcome};
use crate::config::Config;
use crate::discovery::{discover, MediaKind};
use crate::download::ResultDownloader;
use crate::media::{ExtractError, FfmpegMerger, FrameExtractor, FrameMerger};
use crate::progress::{CancelFlag, ProgressReporter};
use crate::session::{SessionFactory, SessionOptions};
use crate::startup::{run_startup_checks, Requirements, StartupError};
use crate::upscale::{UpscaleCoordinator, UpscaleError, UpscaleOutcome};
use crate::webdriver::{WebDriverFactory, WebDriverSettings};

/// Error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No {0} found in the given paths")]
    NoInputs(&'static str),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Frame extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Upscale failed: {0}")]
    Upscale(#[from] UpscaleError),

    #[error("Temp cleanup failed: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Pipeline task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::Cancelled => true,
            PipelineError::Upscale(UpscaleError::Cancelled) => true,
            PipelineError::Extract(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// What a background run should do
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    Images { paths: Vec<PathBuf> },
    Videos { paths: Vec<PathBuf>, mute_audio: bool },
    Resume { frame_dir: PathBuf, mute_audio: bool },
}

/// Result of one video of a video run
#[derive(Debug)]
pub struct VideoReport {
    pub source: PathBuf,
    pub result: Result<UpscaleOutcome, PipelineError>,
}

/// Result of a background run
#[derive(Debug)]
pub enum PipelineReport {
    Images(RunStatistics),
    Videos(Vec<VideoReport>),
    Resume(UpscaleOutcome),
}

/// Ties discovery, sessions, extraction, upscaling and merging together
pub struct Pipeline {
    config: Config,
    factory: Arc<dyn SessionFactory>,
    merger: Arc<dyn FrameMerger>,
    reporter: ProgressReporter,
    cancel: CancelFlag,
}

impl Pipeline {
    /// Build a pipeline talking to the configured WebDriver and ffmpeg
    pub fn new(config: Config, reporter: ProgressReporter, cancel: CancelFlag) -> Self {
        let factory = Arc::new(WebDriverFactory::new(WebDriverSettings::from(&config.session)));
        let merger = Arc::new(FfmpegMerger::new(
            config.tools.ffmpeg_path.clone(),
            config.output.dir_name.clone(),
        ));
        Self::with_parts(config, factory, merger, reporter, cancel)
    }

    /// Build a pipeline around an explicit session factory and merger
    pub fn with_parts(
        config: Config,
        factory: Arc<dyn SessionFactory>,
        merger: Arc<dyn FrameMerger>,
        reporter: ProgressReporter,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            factory,
            merger,
            reporter,
            cancel,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn concurrency(&self) -> usize {
        self.config.batch.concurrency as usize
    }

    fn batch_coordinator(&self) -> BatchCoordinator {
        let session = &self.config.session;
        let settings = BatchSettings {
            poll_interval: Duration::from_millis(session.poll_interval_ms),
            session_options: SessionOptions {
                headless: session.headless.as_option(),
                private_mode: session.private_mode.as_option(),
            },
            output_dir_name: self.config.output.dir_name.clone(),
        };
        let downloader = ResultDownloader::new(
            self.config.tools.ffmpeg_path.clone(),
            self.config.output.format,
        );
        BatchCoordinator::new(
            self.factory.clone(),
            downloader,
            settings,
            self.reporter.clone(),
            self.cancel.clone(),
        )
    }

    fn upscale_coordinator(&self, mute_audio: bool) -> UpscaleCoordinator {
        UpscaleCoordinator::new(
            self.batch_coordinator(),
            self.merger.clone(),
            self.reporter.clone(),
            self.concurrency(),
            self.config.output.dir_name.clone(),
            mute_audio,
        )
    }

    /// Run the preflight checks needed by `requirements`
    pub async fn check(&self, requirements: Requirements) -> Result<(), PipelineError> {
        run_startup_checks(&self.config, requirements).await?;
        Ok(())
    }

    /// Enhance every image found under `paths`
    pub async fn run_images(&self, paths: &[PathBuf]) -> Result<RunStatistics, PipelineError> {
        let files = discover(paths, MediaKind::Image, &self.config.output.dir_name);
        if files.is_empty() {
            return Err(PipelineError::NoInputs("images"));
        }
        info!(count = files.len(), "Discovered images");

        let stats = self
            .batch_coordinator()
            .run(Job::from_paths(files), self.concurrency())
            .await;
        if self.cancel.is_cancelled() {
            warn!(
                succeeded = stats.total_succeeded,
                failed = stats.total_failed,
                "Image run cancelled"
            );
        }
        Ok(stats)
    }

    /// Extract, enhance and merge every video found under `paths`.
    ///
    /// A failing video is reported and the next one is started; cancellation
    /// stops the run after the current video.
    pub async fn run_videos(
        &self,
        paths: &[PathBuf],
        mute_audio: bool,
    ) -> Result<Vec<VideoReport>, PipelineError> {
        let videos = discover(paths, MediaKind::Video, &self.config.output.dir_name);
        if videos.is_empty() {
            return Err(PipelineError::NoInputs("videos"));
        }
        info!(count = videos.len(), "Discovered videos");

        let extractor = FrameExtractor::from_config(&self.config.tools);
        let upscaler = self.upscale_coordinator(mute_audio);
        let mut reports = Vec::with_capacity(videos.len());

        for video in videos {
            if self.cancel.is_cancelled() {
                reports.push(VideoReport {
                    source: video,
                    result: Err(PipelineError::Cancelled),
                });
                continue;
            }

            info!(video = %video.display(), "Processing video");
            let result = self.process_video(&extractor, &upscaler, &video).await;
            match &result {
                Ok(outcome) => info!(
                    video = %video.display(),
                    output = %outcome.video.display(),
                    "Video done"
                ),
                Err(e) => error!(video = %video.display(), error = %e, "Video failed"),
            }
            reports.push(VideoReport {
                source: video,
                result,
            });
        }
        Ok(reports)
    }

    async fn process_video(
        &self,
        extractor: &FrameExtractor,
        upscaler: &UpscaleCoordinator,
        video: &Path,
    ) -> Result<UpscaleOutcome, PipelineError> {
        let frame_set = extractor
            .extract(video, &self.config.video.work_dir, &self.cancel, &self.reporter)
            .await?;
        let outcome = upscaler.upscale(&frame_set.directory).await?;
        Ok(outcome)
    }

    /// Resume enhancing an already extracted frame set
    pub async fn resume(
        &self,
        frame_dir: &Path,
        mute_audio: bool,
    ) -> Result<UpscaleOutcome, PipelineError> {
        let outcome = self.upscale_coordinator(mute_audio).upscale(frame_dir).await?;
        Ok(outcome)
    }

    /// Empty the video work directory below `base`
    pub fn clean_work_dir(&self, base: &Path) -> Result<CleanupOutcome, PipelineError> {
        Ok(clean_temp(base, &self.config.video.work_dir)?)
    }

    /// Run `command` as the single background worker of this run
    pub fn spawn(
        self,
        command: PipelineCommand,
    ) -> JoinHandle<Result<PipelineReport, PipelineError>> {
        tokio::spawn(async move { self.execute(command).await })
    }

    async fn execute(&self, command: PipelineCommand) -> Result<PipelineReport, PipelineError> {
        match command {
            PipelineCommand::Images { paths } => {
                self.run_images(&paths).await.map(PipelineReport::Images)
            }
            PipelineCommand::Videos { paths, mute_audio } => self
                .run_videos(&paths, mute_audio)
                .await
                .map(PipelineReport::Videos),
            PipelineCommand::Resume {
                frame_dir,
                mute_audio,
            } => self.resume(&frame_dir, mute_audio).await.map(PipelineReport::Resume),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frameset::{write_metadata, FrameSetMetadata};
    use crate::testing::{RecordingMerger, Script, ScriptedFactory};
    use std::fs;
    use tempfile::TempDir;

    fn test_config(work_dir: &Path) -> Config {
        let mut config = Config::default();
        config.session.poll_interval_ms = 0;
        config.batch.concurrency = 2;
        config.video.work_dir = work_dir.to_path_buf();
        config
    }

    fn pipeline(
        config: Config,
        script: Script,
    ) -> (Pipeline, ScriptedFactory, RecordingMerger) {
        let factory = ScriptedFactory::new(script);
        let merger = RecordingMerger::default();
        let pipeline = Pipeline::with_parts(
            config,
            Arc::new(factory.clone()),
            Arc::new(merger.clone()),
            ProgressReporter::disabled(),
            CancelFlag::new(),
        );
        (pipeline, factory, merger)
    }

    fn write_frame_set(dir: &Path, frames: usize) {
        fs::create_dir_all(dir).unwrap();
        for i in 1..=frames {
            fs::write(dir.join(format!("frame_{:08}.png", i)), b"frame").unwrap();
        }
        write_metadata(
            dir,
            &FrameSetMetadata {
                source_video: dir.join("clip.mp4"),
                fps: 24.0,
                total_frames: frames as u64,
                content_hash: "abc".to_string(),
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_images_skips_previous_outputs() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.png"), b"a").unwrap();
        fs::write(temp.path().join("b.jpg"), b"b").unwrap();
        fs::write(temp.path().join("notes.txt"), b"n").unwrap();
        fs::create_dir(temp.path().join("UPSCALE")).unwrap();
        fs::write(temp.path().join("UPSCALE/old_upscaled.png"), b"o").unwrap();

        let (pipeline, factory, _) = pipeline(test_config(temp.path()), Script::default());
        let stats = pipeline.run_images(&[temp.path().to_path_buf()]).await.unwrap();

        assert_eq!(stats.total(), 2);
        assert_eq!(stats.total_succeeded, 2);
        assert_eq!(factory.state().opened, 2);
        assert_eq!(
            stats.distinct_output_directories,
            vec![temp.path().join("UPSCALE")]
        );
    }

    #[tokio::test]
    async fn test_run_images_without_inputs() {
        let temp = TempDir::new().unwrap();
        let (pipeline, factory, _) = pipeline(test_config(temp.path()), Script::default());

        let err = pipeline.run_images(&[temp.path().to_path_buf()]).await.unwrap_err();

        assert!(matches!(err, PipelineError::NoInputs("images")));
        assert_eq!(factory.state().open_calls, 0);
    }

    #[tokio::test]
    async fn test_session_options_follow_config() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.png"), b"a").unwrap();
        let mut config = test_config(temp.path());
        config.session.headless = crate::config::TriState::Off;
        config.session.private_mode = crate::config::TriState::Unspecified;

        let (pipeline, factory, _) = pipeline(config, Script::default());
        pipeline.run_images(&[temp.path().to_path_buf()]).await.unwrap();

        assert_eq!(
            factory.state().last_options,
            Some(SessionOptions {
                headless: Some(false),
                private_mode: None,
            })
        );
    }

    #[tokio::test]
    async fn test_spawned_resume_merges_frame_set() {
        let temp = TempDir::new().unwrap();
        let frame_dir = temp.path().join("abc");
        write_frame_set(&frame_dir, 4);

        let (pipeline, _, merger) = pipeline(test_config(temp.path()), Script::default());
        let report = pipeline
            .spawn(PipelineCommand::Resume {
                frame_dir: frame_dir.clone(),
                mute_audio: true,
            })
            .await
            .unwrap()
            .unwrap();

        match report {
            PipelineReport::Resume(outcome) => assert_eq!(outcome.enhanced_frames.len(), 4),
            other => panic!("unexpected report: {:?}", other),
        }
        let requests = merger.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].mute_audio);
        assert_eq!(requests[0].fps, 24.0);
    }

    #[tokio::test]
    async fn test_resume_without_metadata() {
        let temp = TempDir::new().unwrap();
        let (pipeline, _, _) = pipeline(test_config(temp.path()), Script::default());

        let err = pipeline.resume(temp.path(), false).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Upscale(UpscaleError::MetadataMissing(_))
        ));
    }

    #[test]
    fn test_clean_work_dir_uses_config() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        config.video.work_dir = PathBuf::from("temp");
        let (pipeline, _, _) = pipeline(config, Script::default());

        let outcome = pipeline.clean_work_dir(temp.path()).unwrap();
        assert!(outcome.created);
        assert!(temp.path().join("temp").is_dir());
    }

    #[test]
    fn test_cancelled_errors_are_recognised() {
        assert!(PipelineError::Cancelled.is_cancelled());
        assert!(PipelineError::Upscale(UpscaleError::Cancelled).is_cancelled());
        assert!(!PipelineError::NoInputs("videos").is_cancelled());
    }

    #[cfg(unix)]
    mod video {
        use super::*;
        use crate::testing::{fake_ffprobe, write_script};

        const FAKE_FFMPEG: &str = r#"
if [ "$1" = "-version" ]; then echo "ffmpeg version 7.0"; exit 0; fi
for last; do :; done
dir=$(dirname "$last")
for i in 1 2 3; do
  printf 'x' > "$dir/frame_0000000$i.png"
  echo "frame=$i"
done
echo "progress=end"
"#;

        #[tokio::test]
        async fn test_run_videos_extracts_enhances_and_merges() {
            let temp = TempDir::new().unwrap();
            let bin = temp.path().join("bin");
            fs::create_dir(&bin).unwrap();
            let media = temp.path().join("media");
            fs::create_dir(&media).unwrap();
            fs::write(media.join("clip.mp4"), b"video bytes").unwrap();

            let mut config = test_config(&temp.path().join("work"));
            config.tools.ffmpeg_path = write_script(&bin, "ffmpeg", FAKE_FFMPEG);
            config.tools.ffprobe_path = write_script(&bin, "ffprobe", &fake_ffprobe("10/1", "0.3"));

            let (pipeline, factory, merger) = pipeline(config, Script::default());
            let reports = pipeline.run_videos(&[media.clone()], false).await.unwrap();

            assert_eq!(reports.len(), 1);
            let outcome = reports[0].result.as_ref().unwrap();
            assert_eq!(outcome.enhanced_frames.len(), 3);
            assert_eq!(factory.state().submissions.len(), 3);

            let requests = merger.requests();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].fps, 10.0);
            assert_eq!(requests[0].source_video, media.join("clip.mp4").canonicalize().unwrap());
        }

        #[tokio::test]
        async fn test_failed_video_does_not_stop_the_run() {
            let temp = TempDir::new().unwrap();
            let bin = temp.path().join("bin");
            fs::create_dir(&bin).unwrap();
            let media = temp.path().join("media");
            fs::create_dir(&media).unwrap();
            fs::write(media.join("a.mp4"), b"first").unwrap();
            fs::write(media.join("b.mp4"), b"second").unwrap();

            let mut config = test_config(&temp.path().join("work"));
            config.tools.ffmpeg_path = write_script(&bin, "ffmpeg", FAKE_FFMPEG);
            config.tools.ffprobe_path = write_script(&bin, "ffprobe", &fake_ffprobe("10/1", "0"));

            let (pipeline, factory, merger) = pipeline(config, Script::default());
            let reports = pipeline.run_videos(&[media], false).await.unwrap();

            assert_eq!(reports.len(), 2);
            for report in &reports {
                assert!(matches!(
                    report.result,
                    Err(PipelineError::Extract(ExtractError::Probe(_)))
                ));
            }
            assert_eq!(factory.state().open_calls, 0);
            assert!(merger.requests().is_empty());
        }
    }
}
