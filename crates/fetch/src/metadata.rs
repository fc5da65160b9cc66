//! Video metadata result objects.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Metadata for one video, as probed or produced by a strategy.
///
/// `episode_number` is unique within a batch and equals the input-order
/// index offset by the requested start episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub url: String,
    pub episode_number: u32,
    pub title: Option<String>,
    /// Duration in seconds, when the source reports one.
    pub duration: Option<f64>,
    pub filesize: Option<u64>,
    /// Container/extension hint, e.g. "mp4".
    pub format: Option<String>,
    pub downloaded_path: Option<PathBuf>,
}

impl VideoMetadata {
    pub fn new(url: impl Into<String>, episode_number: u32) -> Self {
        Self {
            url: url.into(),
            episode_number,
            title: None,
            duration: None,
            filesize: None,
            format: None,
            downloaded_path: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}
