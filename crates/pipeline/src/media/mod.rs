//! Media tool integration
//!
//! Wraps the external `ffprobe`/`ffmpeg` binaries used for probing, frame
//! extraction, format conversion and merging.

pub mod extract;
pub mod merge;
pub mod probe;
pub mod tool;

pub use extract::{ExtractError, FrameExtractor};
pub use merge::{build_merge_command, FfmpegMerger, FrameMerger, MergeError, MergeRequest};
pub use probe::{parse_frame_rate, parse_probe_output, probe_video, ProbeError, VideoProbe};
pub use tool::{check_tool_available, run_tool, ToolError, ToolOutput};
