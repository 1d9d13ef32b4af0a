//! Mapping of enhanced outputs back to the frames they came from.
//!
//! The map is rebuilt from the output directory on every pass and never
//! persisted. Origin sidecars are authoritative; outputs without one fall
//! back to stripping the suffixes this pipeline (and earlier versions of it)
//! append to output names.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::discovery::MediaKind;
use crate::download::{origin_sidecar_path, OriginRecord};

/// Newest enhanced output per original frame stem
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnhancedFrameMap {
    entries: BTreeMap<String, PathBuf>,
}

/// If `s` ends with `_<digits>`, split it into the part before and the digits
fn split_trailing_digits(s: &str) -> Option<(&str, &str)> {
    let pos = s.rfind('_')?;
    let digits = &s[pos + 1..];
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some((&s[..pos], digits))
    } else {
        None
    }
}

/// Recover the original stem from an output stem without a sidecar.
///
/// Recognised, in order:
/// - `<stem>_upscaled[_<digits>...]`
/// - `<stem>_YYYYmmdd_HHMMSS`
/// - `<stem>_<6+ digits>`, only when `<stem>` itself ends in a numbered
///   component, so a bare `frame_00000001` maps to itself
pub fn strip_output_suffix(stem: &str) -> &str {
    if let Some(pos) = stem.rfind("_upscaled") {
        let rest = &stem[pos + "_upscaled".len()..];
        if rest.chars().all(|c| c == '_' || c.is_ascii_digit()) {
            return &stem[..pos];
        }
    }

    if let Some((before_time, time)) = split_trailing_digits(stem) {
        if time.len() == 6 {
            if let Some((before_date, date)) = split_trailing_digits(before_time) {
                if date.len() == 8 {
                    return before_date;
                }
            }
        }
        if time.len() >= 6 && split_trailing_digits(before_time).is_some() {
            return before_time;
        }
    }

    stem
}

fn read_origin(output: &Path) -> Option<String> {
    let content = fs::read_to_string(origin_sidecar_path(output)).ok()?;
    let record: OriginRecord = serde_json::from_str(&content).ok()?;
    Some(record.source_stem)
}

impl EnhancedFrameMap {
    /// Scan `output_dir` and map every enhanced image to its original stem.
    ///
    /// A missing directory yields an empty map. When several outputs map to
    /// the same stem the newest by modification time wins.
    pub fn build(output_dir: &Path) -> io::Result<Self> {
        let mut newest: BTreeMap<String, (SystemTime, PathBuf)> = BTreeMap::new();

        let entries = match fs::read_dir(output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || !MediaKind::Image.matches(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = read_origin(&path).unwrap_or_else(|| strip_output_suffix(stem).to_string());
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);

            let replace = match newest.get(&key) {
                Some((current_time, current_path)) => {
                    (modified, &path) > (*current_time, current_path)
                }
                None => true,
            };
            if replace {
                newest.insert(key, (modified, path));
            }
        }

        debug!(dir = %output_dir.display(), count = newest.len(), "Built enhanced frame map");
        Ok(Self {
            entries: newest.into_iter().map(|(k, (_, p))| (k, p)).collect(),
        })
    }

    pub fn get(&self, stem: &str) -> Option<&Path> {
        self.entries.get(stem).map(PathBuf::as_path)
    }

    pub fn contains(&self, stem: &str) -> bool {
        self.entries.contains_key(stem)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stems from `stems` without an enhanced output, in the given order
    pub fn missing<'a>(&self, stems: &'a [String]) -> Vec<&'a str> {
        stems
            .iter()
            .filter(|s| !self.contains(s))
            .map(String::as_str)
            .collect()
    }
}
