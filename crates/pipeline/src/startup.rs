//! Preflight checks run before any session is opened:
//! - ffmpeg / ffprobe can be executed
//! - the WebDriver endpoint answers and reports ready

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, ToolsConfig};
use crate::media::{check_tool_available, ToolError};

const WEBDRIVER_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Required tool not available: {0}")]
    ToolUnavailable(#[from] ToolError),

    #[error("WebDriver not available at {url}: {reason}")]
    WebDriverUnavailable { url: String, reason: String },
}

/// Which external dependencies a command needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub ffmpeg: bool,
    pub ffprobe: bool,
    pub webdriver: bool,
}

impl Requirements {
    pub const ALL: Requirements = Requirements {
        ffmpeg: true,
        ffprobe: true,
        webdriver: true,
    };

    /// Image batches convert downloads with ffmpeg but never probe
    pub const IMAGES: Requirements = Requirements {
        ffmpeg: true,
        ffprobe: false,
        webdriver: true,
    };
}

/// Parse the FFmpeg version string and extract the major version
///
/// Handles both "ffmpeg version 7.1 ..." and n-prefixed builds
/// ("ffmpeg version n7.1-..."). Used for logging only.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    version_part
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Verify that the configured ffmpeg and/or ffprobe can be executed
pub async fn check_tools(
    tools: &ToolsConfig,
    requirements: Requirements,
) -> Result<(), StartupError> {
    if requirements.ffmpeg {
        let output = check_tool_available(&tools.ffmpeg_path, "-version").await?;
        match parse_ffmpeg_version(&output) {
            Some(major) => info!(major, "ffmpeg available"),
            None => warn!("ffmpeg available, but its version could not be parsed"),
        }
    }
    if requirements.ffprobe {
        check_tool_available(&tools.ffprobe_path, "-version").await?;
        info!("ffprobe available");
    }
    Ok(())
}

/// Ask the WebDriver endpoint for `/status` and require `value.ready`
pub async fn check_webdriver_available(url: &str) -> Result<(), StartupError> {
    let base = url.trim_end_matches('/');
    let unavailable = |reason: String| StartupError::WebDriverUnavailable {
        url: base.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(WEBDRIVER_STATUS_TIMEOUT)
        .build()
        .map_err(|e| unavailable(e.to_string()))?;

    let response = client
        .get(format!("{}/status", base))
        .send()
        .await
        .map_err(|e| unavailable(format!("is the driver running? {}", e)))?;

    if !response.status().is_success() {
        return Err(unavailable(format!("status endpoint returned {}", response.status())));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| unavailable(format!("invalid status response: {}", e)))?;

    match body.pointer("/value/ready").and_then(Value::as_bool) {
        Some(true) => {
            info!(url = base, "WebDriver ready");
            Ok(())
        }
        Some(false) => {
            let message = body
                .pointer("/value/message")
                .and_then(Value::as_str)
                .unwrap_or("driver reports not ready");
            Err(unavailable(message.to_string()))
        }
        None => Err(unavailable("status response has no value.ready".to_string())),
    }
}

/// Run the checks `requirements` asks for, tools first
pub async fn run_startup_checks(
    cfg: &Config,
    requirements: Requirements,
) -> Result<(), StartupError> {
    check_tools(&cfg.tools, requirements).await?;
    if requirements.webdriver {
        check_webdriver_available(&cfg.session.webdriver_url).await?;
    }
    Ok(())
}
