//! Batch coordinator driving remote enhancement sessions.
//!
//! Jobs are processed in chunks of up to `concurrency` sessions. Every chunk
//! goes through the same phases, all polled from the single task running the
//! batch:
//!
//! 1. setup: open one session per job, sequentially
//! 2. ready barrier: sweep `is_ready` until every open session is ready
//! 3. submit: hand each job's file to its session
//! 4. result wait: sweep `poll_result`, downloading each result as it appears
//!
//! Every job ends with exactly one [`JobResult`], including jobs that were
//! never started because the run was cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::download::{DownloadError, ResultDownloader};
use crate::progress::{
    batch_percent, staged_percent, wait_stage_local, CancelFlag, ProgressModel, ProgressReporter,
    Stage,
};
use crate::session::{RemoteSession, SessionError, SessionFactory, SessionOptions};

/// Upper bound on simultaneous sessions
pub const MAX_CONCURRENCY: usize = 20;

/// Clamp a requested concurrency into `[1, MAX_CONCURRENCY]`
pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, MAX_CONCURRENCY)
}

/// One unit of work: one image or one extracted frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub source_path: PathBuf,
    pub index: usize,
}

impl Job {
    pub fn new(source_path: PathBuf, index: usize) -> Self {
        Self { source_path, index }
    }

    /// Build jobs for `paths`, indexed in order
    pub fn from_paths<I: IntoIterator<Item = PathBuf>>(paths: I) -> Vec<Job> {
        paths
            .into_iter()
            .enumerate()
            .map(|(index, source_path)| Job { source_path, index })
            .collect()
    }

    fn display_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source_path.display().to_string())
    }
}

/// Why a job did not produce an output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    #[error("Session could not be opened: {0}")]
    SessionOpenFailed(String),

    #[error("Upload element not found: {0}")]
    UploadElementNotFound(String),

    #[error("Submitting the file failed: {0}")]
    SubmitFailed(String),

    #[error("Download failed with HTTP status {0}")]
    DownloadStatus(u16),

    #[error("Download failed: {0}")]
    DownloadIo(String),

    #[error("Waiting for the result failed: {0}")]
    ResultWaitError(String),

    #[error("Aborted")]
    Aborted,
}

/// Outcome of one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub source_path: PathBuf,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub failure: Option<JobFailure>,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration: Duration,
}

impl JobResult {
    fn succeeded(
        source_path: PathBuf,
        output_path: PathBuf,
        started: (DateTime<Local>, Instant),
    ) -> Self {
        Self {
            source_path,
            success: true,
            output_path: Some(output_path),
            error: None,
            failure: None,
            start_time: started.0,
            end_time: Local::now(),
            duration: started.1.elapsed(),
        }
    }

    fn failed(
        source_path: PathBuf,
        failure: JobFailure,
        started: (DateTime<Local>, Instant),
    ) -> Self {
        Self {
            source_path,
            success: false,
            output_path: None,
            error: Some(failure.to_string()),
            failure: Some(failure),
            start_time: started.0,
            end_time: Local::now(),
            duration: started.1.elapsed(),
        }
    }
}

/// Aggregate outcome of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatistics {
    pub run_id: String,
    pub total_succeeded: usize,
    pub total_failed: usize,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    /// One result per job, in job order
    pub results: Vec<JobResult>,
    /// Output directories that received at least one result
    pub distinct_output_directories: Vec<PathBuf>,
}

impl RunStatistics {
    pub fn total(&self) -> usize {
        self.results.len()
    }
}

/// State of a run, owned by the task executing it
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    start_time: DateTime<Local>,
    total: usize,
    finished: usize,
    succeeded: usize,
    failed: usize,
    results: Vec<JobResult>,
    output_dirs: Vec<PathBuf>,
}

impl RunContext {
    pub fn new(total: usize) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            start_time: Local::now(),
            total,
            finished: 0,
            succeeded: 0,
            failed: 0,
            results: Vec::with_capacity(total),
            output_dirs: Vec::new(),
        }
    }

    fn append(&mut self, result: JobResult) {
        if result.success {
            self.succeeded += 1;
            if let Some(dir) = result.output_path.as_ref().and_then(|p| p.parent()) {
                if !self.output_dirs.iter().any(|d| d == dir) {
                    self.output_dirs.push(dir.to_path_buf());
                }
            }
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    pub fn finish(self) -> RunStatistics {
        RunStatistics {
            run_id: self.run_id,
            total_succeeded: self.succeeded,
            total_failed: self.failed,
            start_time: self.start_time,
            end_time: Local::now(),
            results: self.results,
            distinct_output_directories: self.output_dirs,
        }
    }
}

/// A job bound to at most one live session for the duration of a chunk
struct Slot {
    job: Job,
    /// Position of the job in the run, for staged progress
    position: usize,
    session: Option<Box<dyn RemoteSession>>,
    ready: bool,
    submitted_at: Option<Instant>,
    result: Option<JobResult>,
    started: (DateTime<Local>, Instant),
}

impl Slot {
    fn new(job: Job, position: usize) -> Self {
        Self {
            job,
            position,
            session: None,
            ready: false,
            submitted_at: None,
            result: None,
            started: (Local::now(), Instant::now()),
        }
    }

    fn awaiting_ready(&self) -> bool {
        self.session.is_some() && !self.ready && self.result.is_none()
    }

    fn awaiting_result(&self) -> bool {
        self.session.is_some() && self.submitted_at.is_some() && self.result.is_none()
    }

    /// Close the session if one is still held. Safe to call repeatedly.
    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Tunables of a batch run that do not change between runs
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub poll_interval: Duration,
    pub session_options: SessionOptions,
    /// Name of the output directory created next to each input
    pub output_dir_name: String,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            session_options: SessionOptions::default(),
            output_dir_name: "UPSCALE".to_string(),
        }
    }
}

/// Output directory for a job's result: `<input dir>/<output dir name>`
pub fn output_dir_for(source: &Path, output_dir_name: &str) -> PathBuf {
    source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(output_dir_name)
}

/// Runs jobs through remote sessions in chunks
pub struct BatchCoordinator {
    factory: Arc<dyn SessionFactory>,
    downloader: ResultDownloader,
    settings: BatchSettings,
    reporter: ProgressReporter,
    cancel: CancelFlag,
}

impl BatchCoordinator {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        downloader: ResultDownloader,
        settings: BatchSettings,
        reporter: ProgressReporter,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            factory,
            downloader,
            settings,
            reporter,
            cancel,
        }
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Process `jobs` with up to `concurrency` simultaneous sessions.
    ///
    /// # Arguments
    /// * `jobs` - Jobs in the order their results should be reported
    /// * `concurrency` - Requested session count, clamped to `[1, 20]`
    ///
    /// # Returns
    /// Statistics holding exactly one result per job, in job order
    pub async fn run(&self, jobs: Vec<Job>, concurrency: usize) -> RunStatistics {
        let concurrency = clamp_concurrency(concurrency);
        let model = ProgressModel::for_concurrency(concurrency);
        let mut ctx = RunContext::new(jobs.len());

        info!(
            run_id = %ctx.run_id,
            total = jobs.len(),
            concurrency,
            "Starting batch"
        );
        self.reporter.run_started(ctx.run_id.clone(), jobs.len());

        let mut cancelled = false;
        for (chunk_no, chunk) in jobs.chunks(concurrency).enumerate() {
            let first_position = chunk_no * concurrency;
            if cancelled || self.cancel.is_cancelled() {
                cancelled = true;
                for job in chunk {
                    let started = (Local::now(), Instant::now());
                    ctx.append(JobResult::failed(
                        job.source_path.clone(),
                        JobFailure::Aborted,
                        started,
                    ));
                    ctx.finished += 1;
                    self.reporter.job_finished(job.source_path.clone(), false);
                }
                continue;
            }

            debug!(chunk = chunk_no, size = chunk.len(), "Starting chunk");
            let slots: Vec<Slot> = chunk
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, job)| Slot::new(job, first_position + i))
                .collect();
            cancelled = self.run_chunk(slots, &mut ctx, model).await;
        }

        let message = if cancelled {
            format!(
                "Cancelled: {} succeeded, {} failed",
                ctx.succeeded, ctx.failed
            )
        } else {
            format!(
                "Completed: {} succeeded, {} failed",
                ctx.succeeded, ctx.failed
            )
        };
        info!(
            run_id = %ctx.run_id,
            succeeded = ctx.succeeded,
            failed = ctx.failed,
            "{}",
            message
        );
        self.reporter.progress(message, 100.0);

        ctx.finish()
    }

    /// Drive one chunk through all phases. Returns `true` if cancelled.
    async fn run_chunk(
        &self,
        mut slots: Vec<Slot>,
        ctx: &mut RunContext,
        model: ProgressModel,
    ) -> bool {
        // Setup
        for i in 0..slots.len() {
            if self.cancel.is_cancelled() {
                return self.abort_chunk(slots, ctx).await;
            }
            let slot = &mut slots[i];
            slot.started = (Local::now(), Instant::now());
            self.reporter.job_started(slot.job.source_path.clone());
            self.staged(model, ctx, slot, Stage::Setup, 0.0, "Opening session for");

            match self.factory.open(&self.settings.session_options).await {
                Ok(session) => {
                    debug!(path = %slot.job.source_path.display(), "Session opened");
                    slot.session = Some(session);
                }
                Err(e) => {
                    warn!(
                        path = %slot.job.source_path.display(),
                        "Failed to open session: {}",
                        e
                    );
                    let failure = JobFailure::SessionOpenFailed(e.to_string());
                    self.finish_slot(slot, ctx, model, Err(failure)).await;
                }
            }
        }

        // Ready barrier: no timeout, only cancellation ends it
        loop {
            if self.cancel.is_cancelled() {
                return self.abort_chunk(slots, ctx).await;
            }
            for slot in slots.iter_mut().filter(|s| s.awaiting_ready()) {
                let Some(session) = slot.session.as_mut() else {
                    continue;
                };
                match session.is_ready().await {
                    Ok(true) => {
                        slot.ready = true;
                        self.staged(model, ctx, slot, Stage::Setup, 100.0, "Page ready for");
                    }
                    Ok(false) => {}
                    Err(e) => debug!(
                        path = %slot.job.source_path.display(),
                        "Readiness check failed: {}",
                        e
                    ),
                }
            }
            if !slots.iter().any(|s| s.awaiting_ready()) {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        // Submit
        for i in 0..slots.len() {
            if self.cancel.is_cancelled() {
                return self.abort_chunk(slots, ctx).await;
            }
            let slot = &mut slots[i];
            if !slot.ready || slot.result.is_some() || slot.session.is_none() {
                continue;
            }
            self.staged(model, ctx, slot, Stage::Upload, 0.0, "Uploading");
            let path = slot.job.source_path.clone();
            let Some(session) = slot.session.as_mut() else {
                continue;
            };
            match session.submit(&path).await {
                Ok(()) => {
                    slot.submitted_at = Some(Instant::now());
                    self.staged(model, ctx, slot, Stage::Wait, 0.0, "Waiting for result of");
                }
                Err(SessionError::ElementNotFound(detail)) => {
                    warn!(path = %path.display(), "Upload element not found");
                    let failure = JobFailure::UploadElementNotFound(detail);
                    self.finish_slot(slot, ctx, model, Err(failure)).await;
                }
                Err(e) => {
                    warn!(path = %path.display(), "Submit failed: {}", e);
                    let failure = JobFailure::SubmitFailed(e.to_string());
                    self.finish_slot(slot, ctx, model, Err(failure)).await;
                }
            }
        }

        // Result wait
        while slots.iter().any(|s| s.awaiting_result()) {
            if self.cancel.is_cancelled() {
                return self.abort_chunk(slots, ctx).await;
            }
            for slot in slots.iter_mut().filter(|s| s.awaiting_result()) {
                let Some(session) = slot.session.as_mut() else {
                    continue;
                };
                match session.poll_result().await {
                    Ok(Some(url)) => {
                        let outcome = self.retrieve(model, ctx, slot, &url).await;
                        self.finish_slot(slot, ctx, model, outcome).await;
                    }
                    Ok(None) => {
                        let waited = slot.submitted_at.map(|t| t.elapsed()).unwrap_or_default();
                        let local = wait_stage_local(waited);
                        self.staged(model, ctx, slot, Stage::Wait, local, "Waiting for result of");
                    }
                    Err(e) => {
                        warn!(
                            path = %slot.job.source_path.display(),
                            "Result wait failed: {}",
                            e
                        );
                        let failure = JobFailure::ResultWaitError(e.to_string());
                        self.finish_slot(slot, ctx, model, Err(failure)).await;
                    }
                }
            }
            if slots.iter().any(|s| s.awaiting_result()) {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }

        self.collect_chunk(slots, ctx).await;
        false
    }

    /// Download a result for `slot`
    async fn retrieve(
        &self,
        model: ProgressModel,
        ctx: &RunContext,
        slot: &mut Slot,
        url: &str,
    ) -> Result<PathBuf, JobFailure> {
        self.staged(model, ctx, slot, Stage::Download, 0.0, "Downloading result of");
        let source = &slot.job.source_path;
        let dest_dir = output_dir_for(source, &self.settings.output_dir_name);
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| slot.job.display_name());

        match self.downloader.download(url, &dest_dir, &stem, &self.cancel).await {
            Ok(outcome) => {
                if let Some(warning) = &outcome.warning {
                    let percent = self.current_percent(model, ctx, slot);
                    self.reporter.progress(warning.clone(), percent);
                }
                self.staged(model, ctx, slot, Stage::Save, 100.0, "Saved result of");
                Ok(outcome.path)
            }
            Err(DownloadError::Cancelled) => Err(JobFailure::Aborted),
            Err(DownloadError::Status(code)) => {
                warn!(path = %source.display(), status = code, "Result download rejected");
                Err(JobFailure::DownloadStatus(code))
            }
            Err(e) => {
                warn!(path = %source.display(), "Result download failed: {}", e);
                Err(JobFailure::DownloadIo(e.to_string()))
            }
        }
    }

    /// Store the slot's result, report it and release its session
    async fn finish_slot(
        &self,
        slot: &mut Slot,
        ctx: &mut RunContext,
        model: ProgressModel,
        outcome: Result<PathBuf, JobFailure>,
    ) {
        let source = slot.job.source_path.clone();
        let result = match outcome {
            Ok(output) => JobResult::succeeded(source.clone(), output, slot.started),
            Err(failure) => JobResult::failed(source.clone(), failure, slot.started),
        };
        let success = result.success;
        slot.result = Some(result);
        slot.close().await;

        ctx.finished += 1;
        self.reporter.job_finished(source, success);
        if model == ProgressModel::Batch {
            self.reporter.progress(
                format!("Processed {}/{}", ctx.finished, ctx.total),
                batch_percent(ctx.finished, ctx.total),
            );
        }
    }

    /// Close every session of the chunk and mark unfinished jobs aborted
    async fn abort_chunk(&self, mut slots: Vec<Slot>, ctx: &mut RunContext) -> bool {
        info!(run_id = %ctx.run_id, "Cancellation requested; closing sessions");
        for slot in slots.iter_mut() {
            slot.close().await;
            if slot.result.is_none() {
                slot.result = Some(JobResult::failed(
                    slot.job.source_path.clone(),
                    JobFailure::Aborted,
                    slot.started,
                ));
                ctx.finished += 1;
                self.reporter.job_finished(slot.job.source_path.clone(), false);
            }
        }
        self.collect_chunk(slots, ctx).await;
        true
    }

    /// Append the chunk's results to the run, in job order
    async fn collect_chunk(&self, slots: Vec<Slot>, ctx: &mut RunContext) {
        for mut slot in slots {
            slot.close().await;
            let result = match slot.result.take() {
                Some(result) => result,
                None => JobResult::failed(
                    slot.job.source_path.clone(),
                    JobFailure::Aborted,
                    slot.started,
                ),
            };
            ctx.append(result);
        }
    }

    fn current_percent(&self, model: ProgressModel, ctx: &RunContext, slot: &Slot) -> f64 {
        match model {
            ProgressModel::Batch => batch_percent(ctx.finished, ctx.total),
            ProgressModel::Staged => {
                staged_percent(slot.position, ctx.total, Stage::Download, 100.0)
            }
        }
    }

    /// Emit a staged progress message (only used when running one session at a time)
    fn staged(
        &self,
        model: ProgressModel,
        ctx: &RunContext,
        slot: &Slot,
        stage: Stage,
        local: f64,
        verb: &str,
    ) {
        if model != ProgressModel::Staged {
            return;
        }
        self.reporter.progress(
            format!(
                "{} {} ({}/{})",
                verb,
                slot.job.display_name(),
                slot.position + 1,
                ctx.total
            ),
            staged_percent(slot.position, ctx.total, stage, local),
        );
    }
}
