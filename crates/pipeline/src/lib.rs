//! frame-enhance
//!
//! Batch enhancement of images, and of videos through their extracted frames,
//! by driving a remote enhancement page in browser sessions.

pub mod batch;
pub mod cleanup;
pub mod discovery;
pub mod download;
pub mod frameset;
pub mod media;
pub mod pipeline;
pub mod progress;
pub mod resume;
pub mod session;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod upscale;
pub mod webdriver;

#[cfg(test)]
mod testing;

pub use frame_enhance_config as config;
pub use frame_enhance_config::Config;

pub use batch::{
    clamp_concurrency, output_dir_for, BatchCoordinator, BatchSettings, Job, JobFailure, JobResult,
    RunStatistics, MAX_CONCURRENCY,
};
pub use cleanup::{clean_temp, CleanupError, CleanupOutcome};
pub use discovery::{discover, MediaKind};
pub use download::{DownloadError, DownloadOutcome, ResultDownloader};
pub use frameset::{content_hash, FrameSet, FrameSetError};
pub use pipeline::{Pipeline, PipelineCommand, PipelineError, PipelineReport, VideoReport};
pub use progress::{CancelFlag, ProgressEvent, ProgressReporter};
pub use resume::EnhancedFrameMap;
pub use session::{RemoteSession, SessionError, SessionFactory, SessionOptions};
pub use startup::{
    check_tools, check_webdriver_available, parse_ffmpeg_version, run_startup_checks,
    Requirements, StartupError,
};
pub use status::{
    apply_event, new_shared_status, spawn_status_forwarder, SharedStatus, StatusSnapshot,
};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use upscale::{UpscaleCoordinator, UpscaleError, UpscaleOutcome};
pub use webdriver::{WebDriverFactory, WebDriverSettings};
