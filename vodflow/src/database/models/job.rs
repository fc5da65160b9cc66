//! Job model and its enums.
//!
//! Field names and enum values are the wire contract shared with stage
//! tasks; they serialize exactly as the persisted/job-API shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for the scheduler to admit the job.
    Pending,
    /// Download stage in progress.
    Downloading,
    /// Transcode stage in progress.
    Processing,
    /// Merge stage in progress.
    Merging,
    /// All stages finished successfully.
    Completed,
    /// A stage failed; see the job's error list.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "processing" => Some(Self::Processing),
            "merging" => Some(Self::Merging),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Downloading | Self::Processing | Self::Merging
        )
    }
}

/// Job priority tiers; declaration order matches scheduling precedence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    /// Numeric weight persisted for this tier.
    pub fn weight(&self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Urgent => 10,
        }
    }

    pub fn from_weight(weight: i32) -> Option<Self> {
        match weight {
            1 => Some(Self::Low),
            5 => Some(Self::Normal),
            8 => Some(Self::High),
            10 => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Requested output quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoQuality {
    #[serde(rename = "original")]
    Original,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    P2160,
}

impl VideoQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::P2160 => "2160p",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(Self::Original),
            "720p" => Some(Self::P720),
            "1080p" => Some(Self::P1080),
            "2160p" => Some(Self::P2160),
            _ => None,
        }
    }
}

/// A persisted video processing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub season_name: String,
    pub video_urls: Vec<String>,
    pub video_quality: VideoQuality,
    pub compression_level: i32,
    pub use_gpu: bool,
    pub use_hardware_accel: bool,
    pub current_stage: Option<String>,
    pub progress_percentage: i32,
    pub errors: Vec<String>,
    pub retry_count: i32,
    pub task_id: Option<String>,
    pub notification_webhook: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Default x264 CRF; a job requesting a different level implies a transcode.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 23;

impl Job {
    pub fn new(season_name: impl Into<String>, video_urls: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            season_name: season_name.into(),
            video_urls,
            video_quality: VideoQuality::Original,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            use_gpu: false,
            use_hardware_accel: false,
            current_stage: None,
            progress_percentage: 0,
            errors: Vec::new(),
            retry_count: 0,
            task_id: None,
            notification_webhook: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quality(mut self, quality: VideoQuality) -> Self {
        self.video_quality = quality;
        self
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.notification_webhook = Some(url.into());
        self
    }

    /// Wall-clock duration in seconds, once both timestamps exist.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_seconds()),
            _ => None,
        }
    }
}
