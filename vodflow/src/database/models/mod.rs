//! Database models.

pub mod job;

pub use job::{DEFAULT_COMPRESSION_LEVEL, Job, JobPriority, JobStatus, VideoQuality};
