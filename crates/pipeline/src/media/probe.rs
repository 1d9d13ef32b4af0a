//! Probe module for reading the duration and frame rate of a video.

use std::path::Path;

use thiserror::Error;
use tokio::process::Command;

use super::tool::{run_tool, ToolError};
use crate::progress::CancelFlag;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run or failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The probe output lacked a usable value.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),
}

/// Timing information of the first video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    /// Duration in seconds.
    pub duration_secs: f64,
    /// Frames per second.
    pub fps: f64,
}

impl VideoProbe {
    /// Expected number of frames, `round(duration * fps)`.
    pub fn total_frames(&self) -> i64 {
        (self.duration_secs * self.fps).round() as i64
    }
}

/// Parse a frame rate such as `30000/1001`, `25/1` or `29.97`.
///
/// Returns `None` for zero denominators and non-positive rates.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let value = value.trim();
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Parse `key=value` ffprobe output into a [`VideoProbe`].
///
/// The first parseable `duration` wins, so a stream duration takes precedence
/// over the container duration printed after it.
pub fn parse_probe_output(output: &str) -> Result<VideoProbe, ProbeError> {
    let mut duration = None;
    let mut fps = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "duration" if duration.is_none() => {
                duration = value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|d| d.is_finite() && *d > 0.0);
            }
            "r_frame_rate" if fps.is_none() => fps = parse_frame_rate(value),
            _ => {}
        }
    }

    let duration_secs =
        duration.ok_or_else(|| ProbeError::ParseError("missing or invalid duration".to_string()))?;
    let fps =
        fps.ok_or_else(|| ProbeError::ParseError("missing or invalid r_frame_rate".to_string()))?;

    Ok(VideoProbe { duration_secs, fps })
}

/// Build the ffprobe command used by [`probe_video`]
pub fn build_probe_command(ffprobe: &Path, video: &Path) -> Command {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=r_frame_rate,duration:format=duration",
        "-of",
        "default=noprint_wrappers=1",
    ])
    .arg(video);
    cmd
}

/// Probe a video with ffprobe
pub async fn probe_video(
    ffprobe: &Path,
    video: &Path,
    cancel: &CancelFlag,
) -> Result<VideoProbe, ProbeError> {
    let output = run_tool(build_probe_command(ffprobe, video), cancel, |_, _| {}).await?;
    parse_probe_output(&output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_frame_rate_forms() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("29.97"), Some(29.97));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.970_029_97).abs() < 1e-6);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
        assert_eq!(parse_frame_rate("-5"), None);
    }

    #[test]
    fn test_parse_probe_output_stream_duration_first() {
        let output = "r_frame_rate=30/1\nduration=10.000000\nduration=10.050000\n";
        let probe = parse_probe_output(output).unwrap();
        assert_eq!(probe.fps, 30.0);
        assert_eq!(probe.duration_secs, 10.0);
        assert_eq!(probe.total_frames(), 300);
    }

    #[test]
    fn test_parse_probe_output_falls_back_to_format_duration() {
        let output = "r_frame_rate=24/1\nduration=N/A\nduration=2.5\n";
        let probe = parse_probe_output(output).unwrap();
        assert_eq!(probe.total_frames(), 60);
    }

    #[test]
    fn test_parse_probe_output_rejects_missing_values() {
        assert!(matches!(
            parse_probe_output("r_frame_rate=30/1\n"),
            Err(ProbeError::ParseError(_))
        ));
        assert!(matches!(
            parse_probe_output("duration=3.0\nr_frame_rate=0/0\n"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[test]
    fn test_build_probe_command_args() {
        let cmd = build_probe_command(Path::new("ffprobe"), Path::new("/v/in.mp4"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .filter_map(|a| a.to_str().map(String::from))
            .collect();
        assert!(args.windows(2).any(|p| p[0] == "-select_streams" && p[1] == "v:0"));
        assert_eq!(args.last().map(String::as_str), Some("/v/in.mp4"));
    }

    proptest! {
        #[test]
        fn prop_total_frames_is_rounded_product(
            frames in 1u32..100_000,
            fps_num in 1u32..120,
        ) {
            let fps = fps_num as f64;
            let duration = frames as f64 / fps;
            let output = format!("r_frame_rate={}/1\nduration={}\n", fps_num, duration);
            let probe = parse_probe_output(&output).unwrap();
            prop_assert_eq!(probe.total_frames(), frames as i64);
        }
    }
}
