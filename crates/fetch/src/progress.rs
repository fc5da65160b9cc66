//! Ephemeral per-download progress state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Download status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting for a concurrency slot.
    Queued,
    /// Transfer in flight.
    Downloading,
    /// Transfer finished successfully.
    Completed,
    /// Transfer failed after the strategy exhausted its retries.
    Failed,
    /// Transfer was cancelled; a partial file may remain on disk.
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress snapshot for one download, keyed by its download id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub url: String,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second over the last sampling window.
    pub speed: f64,
    /// Estimated seconds remaining; None when the total size is unknown.
    pub eta: Option<f64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadProgress {
    pub fn queued(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: DownloadStatus::Queued,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: 0.0,
            eta: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Percentage complete, or None while the total size is unknown.
    pub fn progress_percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }

    /// Wall-clock duration of the transfer so far.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }
}

/// Deterministic, content-derived download identifier.
///
/// The same (url, episode_number) pair always maps to the same id, so
/// progress entries survive retries of the same logical download.
pub fn download_id(url: &str, episode_number: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(episode_number.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}
