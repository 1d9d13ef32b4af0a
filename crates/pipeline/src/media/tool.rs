//! Subprocess runner for the media tools.
//!
//! Reads the `key=value` progress stream from stdout, keeps the tail of
//! stderr for error messages and kills the child when the run is cancelled.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::progress::CancelFlag;

/// How often a running tool checks the cancel flag
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Number of stderr lines kept for error reporting
const STDERR_TAIL_LINES: usize = 20;

/// Error type for media tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    /// The executable could not be started
    #[error("{tool} not available: {detail}")]
    Missing { tool: String, detail: String },

    /// The tool ran and exited unsuccessfully
    #[error("{tool} failed: {detail}")]
    Failed { tool: String, detail: String },

    /// IO error talking to the process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled and the process killed
    #[error("Operation cancelled")]
    Cancelled,
}

/// Captured output of a finished tool run
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr_tail: String,
}

fn tool_name(cmd: &Command) -> String {
    Path::new(cmd.as_std().get_program())
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| cmd.as_std().get_program().to_string_lossy().to_string())
}

async fn read_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// Run a tool to completion.
///
/// Every stdout line of the form `key=value` is handed to `on_progress`.
/// The cancel flag is checked between lines and while waiting for exit.
///
/// # Arguments
/// * `cmd` - Fully built command (program and arguments)
/// * `cancel` - Cancellation flag; when set the child is killed
/// * `on_progress` - Callback receiving `(key, value)` pairs
///
/// # Returns
/// * `Ok(ToolOutput)` when the tool exits with status 0
/// * `Err(ToolError::Missing)` if the program cannot be spawned
/// * `Err(ToolError::Failed)` on non-zero exit, with the stderr tail
/// * `Err(ToolError::Cancelled)` if the cancel flag was observed
pub async fn run_tool<F>(
    mut cmd: Command,
    cancel: &CancelFlag,
    mut on_progress: F,
) -> Result<ToolOutput, ToolError>
where
    F: FnMut(&str, &str),
{
    let tool = tool_name(&cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => ToolError::Missing {
            tool: tool.clone(),
            detail: e.to_string(),
        },
        _ => ToolError::Io(e),
    })?;
    debug!(tool = %tool, "Tool started");

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));
    let mut stdout_text = String::new();

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            if cancel.is_cancelled() {
                let _ = child.kill().await;
                return Err(ToolError::Cancelled);
            }
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some((key, value)) = line.split_once('=') {
                            on_progress(key.trim(), value.trim());
                        }
                        stdout_text.push_str(&line);
                        stdout_text.push('\n');
                    }
                    None => break,
                },
                _ = tokio::time::sleep(CANCEL_POLL) => {}
            }
        }
    }

    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill().await;
            return Err(ToolError::Cancelled);
        }
        tokio::select! {
            status = child.wait() => break status?,
            _ = tokio::time::sleep(CANCEL_POLL) => {}
        }
    };

    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        let detail = if stderr_tail.trim().is_empty() {
            format!("exited with {}", status)
        } else {
            stderr_tail.clone()
        };
        return Err(ToolError::Failed { tool, detail });
    }

    Ok(ToolOutput {
        stdout: stdout_text,
        stderr_tail,
    })
}

/// Check that a tool can be executed, returning its version output
///
/// Runs `<program> <version_arg>` and requires a zero exit status.
pub async fn check_tool_available(program: &Path, version_arg: &str) -> Result<String, ToolError> {
    let tool = program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.display().to_string());

    let output = Command::new(program)
        .arg(version_arg)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ToolError::Missing {
            tool: tool.clone(),
            detail: format!(
                "{} {} failed; is it installed and in PATH? Error: {}",
                tool, version_arg, e
            ),
        })?;

    if !output.status.success() {
        return Err(ToolError::Missing {
            tool: tool.clone(),
            detail: format!("{} {} exited with {}", tool, version_arg, output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
