//! Output path planning for downloaded episodes.
//!
//! Each episode gets its own directory under the manager's temp dir:
//! `episode_003/003_Some Title.mp4`. Titles are sanitized so the layout is
//! safe on Windows, Linux, and macOS.

use std::path::{Path, PathBuf};

use crate::metadata::VideoMetadata;

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const DEFAULT_EXTENSION: &str = "mp4";

/// Sanitize a string for use in filenames on all platforms.
///
/// Control characters and Windows-invalid characters become underscores
/// (consecutive runs collapse to one), leading/trailing spaces and dots are
/// trimmed, Windows reserved names are prefixed, and an empty result becomes
/// "unnamed".
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let upper = trimmed.to_uppercase();
    let stem = upper.split('.').next().unwrap_or(&upper);
    if WINDOWS_RESERVED_NAMES.contains(&stem) {
        return format!("_{trimmed}");
    }

    trimmed.to_string()
}

/// Extension from the final URL path segment, if it has one.
fn extension_from_url(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Plan the deterministic output path for one episode.
///
/// Directory: `<base>/episode_NNN`. Filename: `NNN_<sanitized title>` when a
/// title is known, `episode_NNN` otherwise. Extension: metadata format, then
/// URL suffix, then "mp4".
pub fn plan_output_path(
    base: &Path,
    episode_number: u32,
    url: &str,
    metadata: Option<&VideoMetadata>,
) -> PathBuf {
    let episode_dir = base.join(format!("episode_{episode_number:03}"));

    let filename = match metadata.and_then(|m| m.title.as_deref()) {
        Some(title) => format!("{:03}_{}", episode_number, sanitize_filename(title)),
        None => format!("episode_{episode_number:03}"),
    };

    let extension = metadata
        .and_then(|m| m.format.clone())
        .or_else(|| extension_from_url(url))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    episode_dir.join(format!("{filename}.{extension}"))
}
