//! Deterministic doubles for sessions, merging and external tools.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::Url;

use crate::batch::Job;
use crate::media::merge::{FrameMerger, MergeError, MergeRequest};
use crate::progress::CancelFlag;
use crate::session::{RemoteSession, SessionError, SessionFactory, SessionOptions};

/// Behaviour of a [`ScriptedFactory`] and its sessions
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Zero-based open calls that fail
    pub fail_open_at: HashSet<usize>,
    /// `is_ready` answers false this many times per session
    pub ready_after_polls: usize,
    /// `poll_result` answers `None` this many times per session
    pub result_after_polls: usize,
    /// Files whose submission fails
    pub submit_fail: HashSet<PathBuf>,
    /// Files for which the upload element is reported missing
    pub missing_element: HashSet<PathBuf>,
    /// Files whose result wait always errors
    pub always_fail: HashSet<PathBuf>,
    /// Files whose result wait errors on the first attempt only
    pub fail_once: HashSet<PathBuf>,
    /// Result URL to hand out instead of a `file://` URL of the submitted file
    pub result_url: Option<String>,
    /// Set the flag when the n-th (one-based) submission happens
    pub cancel_on_submit: Option<(usize, CancelFlag)>,
}

/// Counters observed by tests
#[derive(Debug, Clone, Default)]
pub struct ScriptState {
    pub open_calls: usize,
    pub opened: usize,
    pub closed: usize,
    pub double_closes: usize,
    pub live: usize,
    pub max_live: usize,
    pub submissions: Vec<PathBuf>,
    pub last_options: Option<SessionOptions>,
    attempts: HashMap<PathBuf, usize>,
}

/// Session factory whose sessions follow a [`Script`]
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    script: Arc<Script>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn state(&self) -> ScriptState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn RemoteSession>, SessionError> {
        let mut state = self.lock();
        let call = state.open_calls;
        state.open_calls += 1;
        state.last_options = Some(*options);
        if self.script.fail_open_at.contains(&call) {
            return Err(SessionError::Open(format!("scripted open failure #{}", call)));
        }
        state.opened += 1;
        state.live += 1;
        state.max_live = state.max_live.max(state.live);

        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            state: self.state.clone(),
            ready_polls: 0,
            result_polls: 0,
            submitted: None,
            fails: false,
            closed: false,
        }))
    }
}

struct ScriptedSession {
    script: Arc<Script>,
    state: Arc<Mutex<ScriptState>>,
    ready_polls: usize,
    result_polls: usize,
    submitted: Option<PathBuf>,
    fails: bool,
    closed: bool,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn is_ready(&mut self) -> Result<bool, SessionError> {
        self.ready_polls += 1;
        Ok(self.ready_polls > self.script.ready_after_polls)
    }

    async fn submit(&mut self, file: &Path) -> Result<(), SessionError> {
        let file = file.to_path_buf();
        let mut state = self.state.lock().unwrap();
        state.submissions.push(file.clone());
        let attempt = {
            let entry = state.attempts.entry(file.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if let Some((n, flag)) = &self.script.cancel_on_submit {
            if state.submissions.len() == *n {
                flag.cancel();
            }
        }

        if self.script.missing_element.contains(&file) {
            return Err(SessionError::ElementNotFound("input[type='file']".to_string()));
        }
        if self.script.submit_fail.contains(&file) {
            return Err(SessionError::Submit(format!(
                "scripted submit failure for {}",
                file.display()
            )));
        }
        self.fails = self.script.always_fail.contains(&file)
            || (self.script.fail_once.contains(&file) && attempt == 1);
        self.submitted = Some(file);
        Ok(())
    }

    async fn poll_result(&mut self) -> Result<Option<String>, SessionError> {
        let Some(file) = &self.submitted else {
            return Ok(None);
        };
        if self.fails {
            return Err(SessionError::Protocol("scripted result failure".to_string()));
        }
        self.result_polls += 1;
        if self.result_polls <= self.script.result_after_polls {
            return Ok(None);
        }
        if let Some(url) = &self.script.result_url {
            return Ok(Some(url.clone()));
        }
        let url = Url::from_file_path(file)
            .map_err(|_| SessionError::Protocol(format!("not absolute: {}", file.display())))?;
        Ok(Some(url.to_string()))
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if self.closed {
            state.double_closes += 1;
            return;
        }
        self.closed = true;
        state.closed += 1;
        state.live = state.live.saturating_sub(1);
    }
}

/// Merger that records requests instead of encoding
#[derive(Debug, Clone, Default)]
pub struct RecordingMerger {
    pub requests: Arc<Mutex<Vec<MergeRequest>>>,
    pub fail: bool,
}

impl RecordingMerger {
    pub fn requests(&self) -> Vec<MergeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FrameMerger for RecordingMerger {
    async fn merge(
        &self,
        request: MergeRequest,
        _cancel: &CancelFlag,
    ) -> Result<PathBuf, MergeError> {
        let output = request.work_dir.join("merged.mp4");
        self.requests.lock().unwrap().push(request);
        if self.fail {
            return Err(MergeError::NoFrames);
        }
        Ok(output)
    }
}

/// Create `count` small PNG inputs in `dir` and return jobs for them
pub fn image_jobs(dir: &Path, count: usize) -> Vec<Job> {
    let paths = (0..count).map(|i| {
        let path = dir.join(format!("image_{:03}.png", i));
        fs::write(&path, [0x89, b'P', b'N', b'G', i as u8]).unwrap();
        path
    });
    Job::from_paths(paths.collect::<Vec<_>>())
}

/// Write an executable `/bin/sh` script
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Body of a fake ffprobe reporting the given frame rate and duration
pub fn fake_ffprobe(frame_rate: &str, duration: &str) -> String {
    format!(
        "if [ \"$1\" = \"-version\" ]; then echo 'ffprobe version 7.0'; exit 0; fi\n\
         echo r_frame_rate={}\necho duration={}\n",
        frame_rate, duration
    )
}
