//! Result retrieval.
//!
//! Fetches an enhanced image from the URL a session produced, stores it under
//! a timestamped name in the output directory, converts it to the requested
//! format when needed and records which input it came from.

use std::path::{Path, PathBuf};

use chrono::Local;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::OutputFormat;
use crate::media::tool::{run_tool, ToolError};
use crate::progress::CancelFlag;

/// Suffix of the origin sidecar written next to every output
pub const ORIGIN_SUFFIX: &str = ".origin.json";

/// Error type for downloads
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The server answered with something other than 200
    #[error("Download failed with HTTP status {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid result URL: {0}")]
    InvalidUrl(String),

    /// Cancelled while converting the result
    #[error("Download cancelled")]
    Cancelled,
}

/// A stored result
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    /// Set when the requested format could not be produced
    pub warning: Option<String>,
}

/// Contents of an origin sidecar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginRecord {
    pub source_stem: String,
}

/// Path of the origin sidecar for an output file
pub fn origin_sidecar_path(output: &Path) -> PathBuf {
    let mut path = output.as_os_str().to_owned();
    path.push(ORIGIN_SUFFIX);
    PathBuf::from(path)
}

/// Base name (without extension) for a new output of `stem`.
///
/// `{stem}_upscaled_{YYYYmmdd_HHMMSS}_{millis}`
pub fn output_base_name(stem: &str) -> String {
    let now = Local::now();
    format!(
        "{}_upscaled_{}_{:03}",
        stem,
        now.format("%Y%m%d_%H%M%S"),
        now.timestamp_subsec_millis().min(999)
    )
}

/// Normalised image extension guessed from a URL path
fn extension_from_url(url: &Url) -> Option<&'static str> {
    let last = url.path_segments()?.last()?;
    let ext = Path::new(last).extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpg"),
        "webp" => Some("webp"),
        _ => None,
    }
}

/// Image extension sniffed from the leading bytes of a file
pub fn sniff_extension(header: &[u8]) -> Option<&'static str> {
    if header.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("png")
    } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}

/// Downloads results into output directories
#[derive(Debug, Clone)]
pub struct ResultDownloader {
    client: Client,
    ffmpeg: PathBuf,
    format: OutputFormat,
}

impl ResultDownloader {
    pub fn new(ffmpeg: PathBuf, format: OutputFormat) -> Self {
        Self {
            client: Client::new(),
            ffmpeg,
            format,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Download `url` into `dest_dir` as an output of `stem`.
    ///
    /// # Arguments
    /// * `url` - `http(s)://` or `file://` location of the result
    /// * `dest_dir` - Output directory, created if missing
    /// * `stem` - Stem of the input file the result belongs to
    /// * `cancel` - Checked while a format conversion is running
    ///
    /// # Returns
    /// * `Ok(DownloadOutcome)` with the stored path and an optional conversion warning
    /// * `Err(DownloadError::Status)` for any non-200 response
    /// * `Err(DownloadError::Cancelled)` if cancelled during conversion
    pub async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        stem: &str,
        cancel: &CancelFlag,
    ) -> Result<DownloadOutcome, DownloadError> {
        let parsed =
            Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
        fs::create_dir_all(dest_dir).await?;

        let base = output_base_name(stem);
        let partial = dest_dir.join(format!(".{}.part", base));

        if let Err(e) = self.fetch(&parsed, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }

        let source_ext = match extension_from_url(&parsed) {
            Some(ext) => ext,
            None => {
                let mut header = [0u8; 12];
                let mut file = fs::File::open(&partial).await?;
                let read = file.read(&mut header).await?;
                sniff_extension(&header[..read]).unwrap_or("png")
            }
        };
        let target_ext = self.format.extension();

        let mut warning = None;
        let output = if source_ext == target_ext {
            let output = dest_dir.join(format!("{}.{}", base, target_ext));
            fs::rename(&partial, &output).await?;
            output
        } else {
            let source = dest_dir.join(format!(".{}.src.{}", base, source_ext));
            fs::rename(&partial, &source).await?;
            let converted = dest_dir.join(format!("{}.{}", base, target_ext));
            match self.convert(&source, &converted, cancel).await {
                Ok(()) => {
                    let _ = fs::remove_file(&source).await;
                    converted
                }
                Err(ToolError::Cancelled) => {
                    let _ = fs::remove_file(&converted).await;
                    let _ = fs::remove_file(&source).await;
                    return Err(DownloadError::Cancelled);
                }
                Err(reason) => {
                    let _ = fs::remove_file(&converted).await;
                    let fallback = dest_dir.join(format!("{}.{}", base, source_ext));
                    fs::rename(&source, &fallback).await?;
                    let message = format!(
                        "Could not convert result to {}; kept {}: {}",
                        target_ext, source_ext, reason
                    );
                    warn!(path = %fallback.display(), "{}", message);
                    warning = Some(message);
                    fallback
                }
            }
        };

        let record = OriginRecord {
            source_stem: stem.to_string(),
        };
        let json = serde_json::to_vec(&record)
            .map_err(|e| DownloadError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        fs::write(origin_sidecar_path(&output), json).await?;

        debug!(url = %url, path = %output.display(), "Result stored");
        Ok(DownloadOutcome { path: output, warning })
    }

    async fn fetch(&self, url: &Url, dest: &Path) -> Result<(), DownloadError> {
        match url.scheme() {
            "file" => {
                let source = url
                    .to_file_path()
                    .map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
                fs::copy(&source, dest).await?;
                Ok(())
            }
            "http" | "https" => {
                let mut response = self.client.get(url.clone()).send().await?;
                if response.status() != StatusCode::OK {
                    return Err(DownloadError::Status(response.status().as_u16()));
                }
                let mut file = fs::File::create(dest).await?;
                while let Some(chunk) = response.chunk().await? {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                Ok(())
            }
            other => Err(DownloadError::InvalidUrl(format!("unsupported scheme '{}'", other))),
        }
    }

    async fn convert(
        &self,
        source: &Path,
        dest: &Path,
        cancel: &CancelFlag,
    ) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(source)
            .arg(dest);
        run_tool(cmd, cancel, |_, _| {}).await.map(|_| ())
    }
}
