//! The download strategy contract and the ordered strategy registry.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DownloadOptions;
use crate::error::DownloadError;
use crate::metadata::VideoMetadata;
use crate::progress::DownloadProgress;

/// Synchronous progress sink a strategy reports through.
///
/// Invoked inline from the downloading task; a slow observer delays progress
/// for that one download only.
pub type ProgressFn = dyn Fn(&DownloadProgress) + Send + Sync;

/// Everything a strategy needs to perform one transfer.
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub episode_number: u32,
    pub output_path: &'a Path,
    pub on_progress: Option<&'a (dyn Fn(&DownloadProgress) + Send + Sync + 'a)>,
    pub token: CancellationToken,
    pub options: &'a DownloadOptions,
}

impl DownloadRequest<'_> {
    /// Report progress through the request callback, when one is set.
    pub fn emit(&self, progress: &DownloadProgress) {
        if let Some(callback) = self.on_progress {
            callback(progress);
        }
    }
}

/// A pluggable downloader implementation selected per-URL by predicate.
#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    /// Strategy name for logs and statistics.
    fn name(&self) -> &'static str;

    /// Pure predicate: can this strategy handle the URL?
    fn supports_url(&self, url: &str) -> bool;

    /// Probe metadata without touching the disk.
    ///
    /// Transient failures are retried internally; the error surfaces only
    /// once the strategy's retry budget is spent.
    async fn extract_metadata(&self, url: &str) -> Result<VideoMetadata, DownloadError>;

    /// Transfer the video to `output_path`, creating parent directories as
    /// needed. Emits at least one `Downloading` and one terminal progress
    /// event through the request callback when one is supplied.
    async fn download(&self, request: DownloadRequest<'_>) -> Result<VideoMetadata, DownloadError>;
}

/// Ordered strategy registry.
///
/// Strategies are tried in registration order and the first match wins; when
/// none match, the last registered strategy is used as the fallback. The
/// manager never retries across strategies.
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn DownloadStrategy>>,
}

impl StrategyRegistry {
    pub fn new(strategies: Vec<Arc<dyn DownloadStrategy>>) -> Result<Self, DownloadError> {
        if strategies.is_empty() {
            return Err(DownloadError::validation(
                "strategy registry requires at least one strategy",
            ));
        }
        Ok(Self { strategies })
    }

    /// Resolve the strategy for a URL: first match, else the last registered.
    pub fn resolve(&self, url: &str) -> Arc<dyn DownloadStrategy> {
        for strategy in &self.strategies {
            if strategy.supports_url(url) {
                debug!(strategy = strategy.name(), url, "Selected download strategy");
                return strategy.clone();
            }
        }

        let fallback = self
            .strategies
            .last()
            .expect("registry is never empty")
            .clone();
        debug!(strategy = fallback.name(), url, "No strategy matched, using fallback");
        fallback
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}
