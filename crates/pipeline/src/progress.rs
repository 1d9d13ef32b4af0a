//! Progress reporting and cooperative cancellation.
//!
//! The orchestrator is the only producer of [`ProgressEvent`]s; observers
//! (CLI output, the status snapshot) consume them from an unbounded channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Nominal time the remote service needs for one result
pub const NOMINAL_WAIT: Duration = Duration::from_secs(60);

/// Observable progress of a run
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RunStarted { run_id: String, total: usize },
    Progress { message: String, percent: f64 },
    JobStarted { path: PathBuf },
    JobFinished { path: PathBuf, success: bool },
}

/// Sending half handed to the orchestrator
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver observers read from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Observer gone means nobody is listening; the run goes on
            let _ = tx.send(event);
        }
    }

    pub fn progress(&self, message: impl Into<String>, percent: f64) {
        self.send(ProgressEvent::Progress {
            message: message.into(),
            percent: percent.clamp(0.0, 100.0),
        });
    }

    pub fn run_started(&self, run_id: impl Into<String>, total: usize) {
        self.send(ProgressEvent::RunStarted {
            run_id: run_id.into(),
            total,
        });
    }

    pub fn job_started(&self, path: PathBuf) {
        self.send(ProgressEvent::JobStarted { path });
    }

    pub fn job_finished(&self, path: PathBuf, success: bool) {
        self.send(ProgressEvent::JobFinished { path, success });
    }
}

/// Cloneable cancellation flag checked at every loop head
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stages of a single job in the staged progress model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Upload,
    Wait,
    Download,
    Save,
}

impl Stage {
    /// Share of one job's progress taken by this stage (sums to 100)
    pub fn weight(self) -> f64 {
        match self {
            Stage::Setup => 5.0,
            Stage::Upload => 10.0,
            Stage::Wait => 65.0,
            Stage::Download => 15.0,
            Stage::Save => 5.0,
        }
    }

    /// Sum of the weights of all stages before this one
    pub fn offset(self) -> f64 {
        match self {
            Stage::Setup => 0.0,
            Stage::Upload => 5.0,
            Stage::Wait => 15.0,
            Stage::Download => 80.0,
            Stage::Save => 95.0,
        }
    }
}

/// How overall progress is computed for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressModel {
    /// Fraction of finished jobs
    Batch,
    /// Per-stage progress of a single job at a time
    Staged,
}

impl ProgressModel {
    /// Staged reporting only makes sense when jobs run one at a time
    pub fn for_concurrency(concurrency: usize) -> Self {
        if concurrency <= 1 {
            ProgressModel::Staged
        } else {
            ProgressModel::Batch
        }
    }
}

/// Batch model: finished jobs over total, in percent
pub fn batch_percent(finished: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (finished as f64 / total as f64 * 100.0).min(100.0)
}

/// Staged model: overall percent for job `index` of `total` at `stage`, `local` percent in.
pub fn staged_percent(index: usize, total: usize, stage: Stage, local: f64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let local = local.clamp(0.0, 100.0);
    let within_job = (stage.offset() + stage.weight() * local / 100.0) / 100.0;
    ((index as f64 + within_job) / total as f64 * 100.0).min(100.0)
}

/// Local percent of the wait stage after `elapsed`, against the nominal wait
pub fn wait_stage_local(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() / NOMINAL_WAIT.as_secs_f64() * 100.0).min(100.0)
}
