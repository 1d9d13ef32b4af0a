//! Status snapshot of the current run
//!
//! The snapshot is fed from the progress channel by a forwarder task, so the
//! orchestrator itself never touches the lock.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::progress::ProgressEvent;

/// Point-in-time view of a run, served as JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub run_id: Option<String>,
    pub timestamp_unix_ms: i64,
    pub message: String,
    pub percent: f64,
    pub current_file: Option<String>,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Shared status state read by the HTTP server
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

/// Fold one progress event into the snapshot
pub fn apply_event(snapshot: &mut StatusSnapshot, event: &ProgressEvent) {
    match event {
        ProgressEvent::RunStarted { run_id, total } => {
            snapshot.run_id = Some(run_id.clone());
            snapshot.total = *total as u64;
            snapshot.completed = 0;
            snapshot.failed = 0;
            snapshot.percent = 0.0;
            snapshot.current_file = None;
        }
        ProgressEvent::Progress { message, percent } => {
            snapshot.message = message.clone();
            snapshot.percent = *percent;
        }
        ProgressEvent::JobStarted { path } => {
            snapshot.current_file = Some(path.display().to_string());
        }
        ProgressEvent::JobFinished { success, .. } => {
            if *success {
                snapshot.completed += 1;
            } else {
                snapshot.failed += 1;
            }
        }
    }
    snapshot.timestamp_unix_ms = chrono::Utc::now().timestamp_millis();
}

/// Drain `rx` into `status`, handing every event to `observer` afterwards.
///
/// The task ends when every reporter has been dropped.
pub fn spawn_status_forwarder<F>(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    status: SharedStatus,
    mut observer: F,
) -> JoinHandle<()>
where
    F: FnMut(&ProgressEvent) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            {
                let mut snapshot = status.write().await;
                apply_event(&mut snapshot, &event);
            }
            observer(&event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressReporter;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[test]
    fn test_apply_event_counts_jobs() {
        let mut snapshot = StatusSnapshot::default();
        apply_event(
            &mut snapshot,
            &ProgressEvent::RunStarted { run_id: "run-1".to_string(), total: 3 },
        );
        apply_event(&mut snapshot, &ProgressEvent::JobStarted { path: PathBuf::from("/in/a.png") });
        apply_event(
            &mut snapshot,
            &ProgressEvent::JobFinished { path: PathBuf::from("/in/a.png"), success: true },
        );
        apply_event(
            &mut snapshot,
            &ProgressEvent::JobFinished { path: PathBuf::from("/in/b.png"), success: false },
        );
        apply_event(
            &mut snapshot,
            &ProgressEvent::Progress { message: "2/3".to_string(), percent: 66.0 },
        );

        assert_eq!(snapshot.run_id.as_deref(), Some("run-1"));
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.current_file.as_deref(), Some("/in/a.png"));
        assert_eq!(snapshot.message, "2/3");
        assert_eq!(snapshot.percent, 66.0);
        assert!(snapshot.timestamp_unix_ms > 0);
    }

    #[test]
    fn test_new_run_resets_counters() {
        let mut snapshot = StatusSnapshot {
            completed: 5,
            failed: 2,
            total: 7,
            ..Default::default()
        };
        apply_event(
            &mut snapshot,
            &ProgressEvent::RunStarted { run_id: "pass-2".to_string(), total: 2 },
        );
        assert_eq!((snapshot.completed, snapshot.failed, snapshot.total), (0, 0, 2));
    }

    #[tokio::test]
    async fn test_forwarder_updates_status_and_observer() {
        let (reporter, rx) = ProgressReporter::channel();
        let status = new_shared_status();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_by_observer = seen.clone();

        let handle = spawn_status_forwarder(rx, status.clone(), move |event| {
            seen_by_observer.lock().unwrap().push(event.clone());
        });

        reporter.run_started("run-x", 1);
        reporter.job_started(PathBuf::from("/in/a.png"));
        reporter.job_finished(PathBuf::from("/in/a.png"), true);
        drop(reporter);
        handle.await.unwrap();

        let snapshot = status.read().await.clone();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.total, 1);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    // **Feature: frame-enhance, Property: StatusSnapshot serialization round-trip**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_status_snapshot_round_trip(
            timestamp in any::<i64>(),
            percent in 0.0f64..100.0,
            completed in any::<u64>(),
            failed in any::<u64>(),
            total in any::<u64>(),
            message in "[a-zA-Z0-9 /%]{0,40}",
            has_file in any::<bool>(),
        ) {
            let snapshot = StatusSnapshot {
                run_id: Some("0b7e7d1c-run".to_string()),
                timestamp_unix_ms: timestamp,
                message,
                percent,
                current_file: has_file.then(|| "/media/frames/frame_00000001.png".to_string()),
                completed,
                failed,
                total,
            };

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let deserialized: StatusSnapshot = serde_json::from_str(&json)
                .expect("deserialization should succeed");

            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
