//! fetch-engine: concurrent, multi-strategy video download engine.
//!
//! A [`DownloadManager`] bounds in-flight transfers with one counting
//! semaphore and dispatches each URL to the first matching
//! [`DownloadStrategy`] in registration order, falling back to the last
//! registered strategy (the generic HTTP fetcher). Strategies retry
//! transient failures internally with exponential backoff and jitter;
//! batch downloads isolate per-URL failures.

pub mod config;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod path;
pub mod progress;
pub mod retry;
pub mod strategies;
pub mod strategy;

pub use config::{DownloadOptions, FetchConfig};
pub use error::DownloadError;
pub use manager::{
    CallbackId, DownloadManager, DownloadManagerConfig, DownloadStatistics, ProgressObserver,
};
pub use metadata::VideoMetadata;
pub use path::{plan_output_path, sanitize_filename};
pub use progress::{DownloadProgress, DownloadStatus, download_id};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use strategies::{HttpStrategy, PlatformSpec, PlatformStrategy};
pub use strategy::{DownloadRequest, DownloadStrategy, ProgressFn, StrategyRegistry};
