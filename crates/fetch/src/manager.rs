//! The Download Manager: bounded concurrency, per-URL strategy dispatch,
//! batch aggregation, and progress fan-out.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DownloadOptions, FetchConfig};
use crate::error::DownloadError;
use crate::metadata::VideoMetadata;
use crate::path::plan_output_path;
use crate::progress::{DownloadProgress, DownloadStatus, download_id};
use crate::retry::RetryPolicy;
use crate::strategies::{HttpStrategy, PlatformSpec, PlatformStrategy};
use crate::strategy::{DownloadRequest, DownloadStrategy, StrategyRegistry};

/// Observer invoked with `(download_id, progress)` on every progress change.
pub type ProgressObserver = dyn Fn(&str, &DownloadProgress) + Send + Sync;

/// Default age threshold for [`DownloadManager::cleanup_temp_files`].
pub const DEFAULT_TEMP_FILE_MAX_AGE_HOURS: u64 = 24;

/// Handle returned by [`DownloadManager::add_progress_callback`], used to
/// unregister the observer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

/// Configuration for the Download Manager.
#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    /// Maximum concurrent transfers across the whole manager instance.
    pub max_concurrent_downloads: usize,
    /// Base directory for downloaded episode files.
    pub temp_dir: PathBuf,
    /// Retry policy handed to the built-in strategies.
    pub retry: RetryPolicy,
    /// HTTP client tuning for the built-in strategies.
    pub fetch: FetchConfig,
    /// Hosted platforms the platform strategy should recognize.
    pub platforms: Vec<PlatformSpec>,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            temp_dir: std::env::temp_dir().join("vodflow"),
            retry: RetryPolicy::default(),
            fetch: FetchConfig::default(),
            platforms: Vec::new(),
        }
    }
}

/// Aggregate statistics over the currently tracked downloads.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatistics {
    pub active_downloads: usize,
    pub total_downloaded_bytes: u64,
    pub average_speed_bps: f64,
    pub max_concurrent_downloads: usize,
    pub temp_dir: PathBuf,
    pub strategies: Vec<String>,
}

struct TrackedDownload {
    url: String,
    token: CancellationToken,
}

/// Concurrent download orchestration.
///
/// One counting semaphore bounds in-flight transfers; waiters suspend
/// cooperatively and are served FIFO. Progress entries are keyed by the
/// content-derived download id and exist only while a download is tracked.
pub struct DownloadManager {
    config: DownloadManagerConfig,
    semaphore: Arc<Semaphore>,
    registry: StrategyRegistry,
    active: DashMap<String, DownloadProgress>,
    tracked: DashMap<String, TrackedDownload>,
    callbacks: RwLock<Vec<(u64, Arc<ProgressObserver>)>>,
    next_callback_id: AtomicU64,
}

impl DownloadManager {
    /// Create a manager with the built-in strategies: the platform extractor
    /// first, the generic HTTP fetcher as the registered fallback.
    pub fn new(config: DownloadManagerConfig) -> Result<Self, DownloadError> {
        let platform = PlatformStrategy::new(
            &config.fetch,
            config.retry.clone(),
            config.platforms.clone(),
        )?;
        let http = HttpStrategy::new(&config.fetch, config.retry.clone())?;
        let registry = StrategyRegistry::new(vec![
            Arc::new(platform) as Arc<dyn DownloadStrategy>,
            Arc::new(http) as Arc<dyn DownloadStrategy>,
        ])?;
        Ok(Self::with_strategies(config, registry))
    }

    /// Create a manager over a custom strategy registry.
    pub fn with_strategies(config: DownloadManagerConfig, registry: StrategyRegistry) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads));
        Self {
            config,
            semaphore,
            registry,
            active: DashMap::new(),
            tracked: DashMap::new(),
            callbacks: RwLock::new(Vec::new()),
            next_callback_id: AtomicU64::new(0),
        }
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.config.max_concurrent_downloads
    }

    /// Register a progress observer.
    pub fn add_progress_callback(
        &self,
        callback: impl Fn(&str, &DownloadProgress) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Arc::new(callback)));
        CallbackId(id)
    }

    /// Unregister a previously added observer. Unknown handles are a no-op.
    pub fn remove_progress_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id.0);
        callbacks.len() != before
    }

    /// Record a progress change and fan it out to every observer.
    ///
    /// Each observer call is isolated: a panicking observer is logged and
    /// skipped without affecting the download or the other observers.
    fn notify_progress(&self, download_id: &str, progress: &DownloadProgress) {
        self.active
            .insert(download_id.to_string(), progress.clone());

        let observers: Vec<Arc<ProgressObserver>> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for observer in observers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer(download_id, progress);
            }));
            if outcome.is_err() {
                error!(download_id, "Progress callback panicked");
            }
        }
    }

    /// Probe metadata for a single URL through its resolved strategy.
    pub async fn extract_metadata(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
        self.registry.resolve(url).extract_metadata(url).await
    }

    /// Probe metadata for a batch, assigning episode numbers by input order.
    ///
    /// All-or-nothing: the first failing URL aborts the whole call. This is
    /// deliberately stricter than `download_batch`.
    pub async fn extract_batch_metadata(
        &self,
        urls: &[String],
        start_episode: u32,
    ) -> Result<Vec<VideoMetadata>, DownloadError> {
        info!(count = urls.len(), "Extracting batch metadata");
        let probes = urls.iter().enumerate().map(|(index, url)| async move {
            let mut metadata = self.extract_metadata(url).await?;
            metadata.episode_number = start_episode + index as u32;
            Ok::<_, DownloadError>(metadata)
        });
        futures::future::try_join_all(probes).await
    }

    /// Download one video under the global concurrency cap.
    pub async fn download_single(
        &self,
        url: &str,
        episode_number: u32,
        output_path: Option<PathBuf>,
        options: &DownloadOptions,
    ) -> Result<VideoMetadata, DownloadError> {
        self.download_inner(url, episode_number, None, output_path, options)
            .await
    }

    async fn download_inner(
        &self,
        url: &str,
        episode_number: u32,
        prefetched: Option<VideoMetadata>,
        output_path: Option<PathBuf>,
        options: &DownloadOptions,
    ) -> Result<VideoMetadata, DownloadError> {
        let id = download_id(url, episode_number);
        let strategy = self.registry.resolve(url);

        // Probe metadata up front when we need it for path planning.
        let metadata = match (&prefetched, &output_path) {
            (Some(m), _) => Some(m.clone()),
            (None, None) => {
                let mut probed = strategy.extract_metadata(url).await?;
                probed.episode_number = episode_number;
                Some(probed)
            }
            (None, Some(_)) => None,
        };

        let path = output_path.unwrap_or_else(|| {
            plan_output_path(&self.config.temp_dir, episode_number, url, metadata.as_ref())
        });

        let token = CancellationToken::new();
        self.tracked.insert(
            id.clone(),
            TrackedDownload {
                url: url.to_string(),
                token: token.clone(),
            },
        );

        let result = self
            .run_download(&id, url, episode_number, &path, &token, strategy, options)
            .await;

        self.tracked.remove(&id);
        self.active.remove(&id);

        match result {
            Ok(mut downloaded) => {
                downloaded.episode_number = episode_number;
                info!(
                    download_id = %id,
                    episode = episode_number,
                    path = %path.display(),
                    "Download completed"
                );
                Ok(downloaded)
            }
            Err(err) => {
                warn!(
                    download_id = %id,
                    episode = episode_number,
                    url,
                    error = %err,
                    "Download failed"
                );
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_download(
        &self,
        id: &str,
        url: &str,
        episode_number: u32,
        path: &std::path::Path,
        token: &CancellationToken,
        strategy: Arc<dyn DownloadStrategy>,
        options: &DownloadOptions,
    ) -> Result<VideoMetadata, DownloadError> {
        // One slot of the shared semaphore; cancellation wins over waiting.
        let _permit = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| DownloadError::Internal {
                    reason: "download semaphore closed".to_string(),
                })?
            }
        };

        debug!(
            download_id = %id,
            episode = episode_number,
            strategy = strategy.name(),
            "Starting download"
        );

        let adapter = |progress: &DownloadProgress| {
            self.notify_progress(id, progress);
        };

        strategy
            .download(DownloadRequest {
                url,
                episode_number,
                output_path: path,
                on_progress: Some(&adapter),
                token: token.clone(),
                options,
            })
            .await
    }

    /// Download many videos concurrently with contiguous episode numbering.
    ///
    /// Per-URL failures are isolated: siblings keep going and only the
    /// successful metadata is returned, in episode order. When every URL
    /// fails, the batch fails as a whole.
    pub async fn download_batch(
        self: &Arc<Self>,
        urls: &[String],
        start_episode: u32,
        extract_metadata_first: bool,
        options: &DownloadOptions,
    ) -> Result<Vec<VideoMetadata>, DownloadError> {
        if urls.is_empty() {
            return Err(DownloadError::validation("no URLs provided for download"));
        }

        info!(
            episodes = urls.len(),
            start_episode,
            max_concurrent = self.config.max_concurrent_downloads,
            "Starting batch download"
        );

        let metadata_list = if extract_metadata_first {
            Some(self.extract_batch_metadata(urls, start_episode).await?)
        } else {
            None
        };

        let mut handles = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let episode_number = start_episode + index as u32;
            let prefetched = metadata_list.as_ref().map(|list| list[index].clone());
            let manager = self.clone();
            let url = url.clone();
            let options = options.clone();
            handles.push((
                episode_number,
                url.clone(),
                tokio::spawn(async move {
                    manager
                        .download_inner(&url, episode_number, prefetched, None, &options)
                        .await
                }),
            ));
        }

        let mut successes = Vec::new();
        let mut failed = 0usize;
        for (episode_number, url, handle) in handles {
            match handle.await {
                Ok(Ok(metadata)) => successes.push(metadata),
                Ok(Err(err)) => {
                    failed += 1;
                    warn!(episode = episode_number, url, error = %err, "Episode download failed");
                }
                Err(join_err) => {
                    failed += 1;
                    error!(episode = episode_number, url, error = %join_err, "Download task aborted");
                }
            }
        }

        info!(
            successful = successes.len(),
            failed,
            total = urls.len(),
            "Batch download finished"
        );

        if successes.is_empty() {
            return Err(DownloadError::AllDownloadsFailed { failed });
        }

        successes.sort_by_key(|m| m.episode_number);
        Ok(successes)
    }

    /// Request cooperative cancellation of a tracked download.
    ///
    /// Marks the progress entry `Cancelled`; an in-flight disk write is not
    /// rolled back, partial files are left for `cleanup_temp_files`. Unknown
    /// ids are a no-op returning false.
    pub fn cancel_download(&self, download_id: &str) -> bool {
        let Some((url, token)) = self
            .tracked
            .get(download_id)
            .map(|entry| (entry.url.clone(), entry.token.clone()))
        else {
            return false;
        };

        token.cancel();

        let mut progress = self
            .active
            .get(download_id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| DownloadProgress::queued(url));
        progress.status = DownloadStatus::Cancelled;
        progress.completed_at = Some(Utc::now());
        self.notify_progress(download_id, &progress);

        info!(download_id, "Cancelled download");
        true
    }

    /// Cancel every tracked download. Returns the number cancelled.
    pub fn cancel_all_downloads(&self) -> usize {
        let ids: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter(|id| self.cancel_download(id))
            .count()
    }

    /// Snapshot of all tracked progress entries.
    pub fn active_downloads(&self) -> Vec<(String, DownloadProgress)> {
        self.active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn get_download_progress(&self, download_id: &str) -> Option<DownloadProgress> {
        self.active.get(download_id).map(|entry| entry.clone())
    }

    /// Derive statistics from the current progress entries.
    pub fn get_download_statistics(&self) -> DownloadStatistics {
        let mut total_downloaded = 0u64;
        let mut speeds = Vec::new();
        let mut count = 0usize;

        for entry in self.active.iter() {
            count += 1;
            total_downloaded += entry.downloaded_bytes;
            if entry.speed > 0.0 {
                speeds.push(entry.speed);
            }
        }

        let average_speed_bps = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f64>() / speeds.len() as f64
        };

        DownloadStatistics {
            active_downloads: count,
            total_downloaded_bytes: total_downloaded,
            average_speed_bps,
            max_concurrent_downloads: self.config.max_concurrent_downloads,
            temp_dir: self.config.temp_dir.clone(),
            strategies: self
                .registry
                .strategy_names()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Best-effort removal of temp files older than `max_age_hours`.
    ///
    /// Per-file errors are logged and skipped; empty episode directories are
    /// pruned afterwards. Returns the number of files deleted.
    pub async fn cleanup_temp_files(&self, max_age_hours: u64) -> u64 {
        let root = self.config.temp_dir.clone();
        let cutoff = SystemTime::now() - Duration::from_secs(max_age_hours * 3600);

        let removed = tokio::task::spawn_blocking(move || cleanup_dir(&root, cutoff))
            .await
            .unwrap_or_else(|join_err| {
                error!(error = %join_err, "Temp cleanup task aborted");
                0
            });

        info!(removed, max_age_hours, "Temp file cleanup finished");
        removed
    }
}

fn cleanup_dir(root: &std::path::Path, cutoff: SystemTime) -> u64 {
    if !root.exists() {
        return 0;
    }

    let mut removed = 0u64;
    let mut dirs = vec![root.to_path_buf()];
    let mut seen_dirs = Vec::new();

    while let Some(dir) = dirs.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Failed to read temp directory");
                continue;
            }
        };
        if dir != root {
            seen_dirs.push(dir.clone());
        }

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
                continue;
            }

            let modified = entry.metadata().and_then(|m| m.modified());
            match modified {
                Ok(modified) if modified < cutoff => match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(file = %path.display(), error = %err, "Failed to delete temp file");
                    }
                },
                Ok(_) => {}
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "Failed to stat temp file");
                }
            }
        }
    }

    // Deepest-first so nested empty directories collapse upwards.
    seen_dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in seen_dirs {
        // Fails (and is skipped) when the directory still has content.
        let _ = std::fs::remove_dir(&dir);
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Scripted strategy for exercising the manager without any network.
    struct ScriptedStrategy {
        delay: Duration,
        gate: Option<Arc<Semaphore>>,
        active: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl ScriptedStrategy {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                gate: None,
                active: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                delay: Duration::from_millis(0),
                gate: Some(gate),
                active: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DownloadStrategy for ScriptedStrategy {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn supports_url(&self, _url: &str) -> bool {
            true
        }

        async fn extract_metadata(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
            if url.contains("bad") {
                return Err(DownloadError::metadata(url, "scripted probe failure"));
            }
            Ok(VideoMetadata::new(url, 0).with_title("Episode").with_format("mp4"))
        }

        async fn download(
            &self,
            request: DownloadRequest<'_>,
        ) -> Result<VideoMetadata, DownloadError> {
            if request.url.contains("bad") {
                return Err(DownloadError::validation("scripted download failure"));
            }

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);

            let mut progress = DownloadProgress::queued(request.url);
            progress.status = DownloadStatus::Downloading;
            progress.started_at = Some(Utc::now());
            request.emit(&progress);

            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.map_err(|_| DownloadError::Internal {
                    reason: "gate closed".to_string(),
                })?;
                permit.forget();
            }
            tokio::time::sleep(self.delay).await;

            self.active.fetch_sub(1, Ordering::SeqCst);

            progress.status = DownloadStatus::Completed;
            progress.downloaded_bytes = 1024;
            progress.total_bytes = Some(1024);
            progress.completed_at = Some(Utc::now());
            request.emit(&progress);

            Ok(VideoMetadata::new(request.url, request.episode_number)
                .with_title("Episode")
                .with_format("mp4"))
        }
    }

    fn manager_with(
        max_concurrent: usize,
        strategy: Arc<ScriptedStrategy>,
    ) -> Arc<DownloadManager> {
        let config = DownloadManagerConfig {
            max_concurrent_downloads: max_concurrent,
            ..Default::default()
        };
        let registry = StrategyRegistry::new(vec![strategy as Arc<dyn DownloadStrategy>]).unwrap();
        Arc::new(DownloadManager::with_strategies(config, registry))
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn batch_respects_concurrency_cap() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(30)));
        let manager = manager_with(2, strategy.clone());

        let batch = urls(&[
            "http://v.example/1",
            "http://v.example/2",
            "http://v.example/3",
            "http://v.example/4",
            "http://v.example/5",
        ]);
        let results = manager
            .download_batch(&batch, 1, false, &DownloadOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert!(strategy.max_seen.load(Ordering::SeqCst) <= 2);

        let episodes: Vec<u32> = results.iter().map(|m| m.episode_number).collect();
        assert_eq!(episodes, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn extra_download_waits_for_free_slot() {
        let gate = Arc::new(Semaphore::new(0));
        let strategy = Arc::new(ScriptedStrategy::gated(gate.clone()));
        let manager = manager_with(1, strategy.clone());

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .download_single("http://v.example/1", 1, None, &DownloadOptions::default())
                    .await
            })
        };

        // Wait until the first download holds the only slot.
        while strategy.active.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let second = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .download_single("http://v.example/2", 2, None, &DownloadOptions::default())
                    .await
            })
        };

        // The second download cannot start while the slot is held.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second.is_finished());
        assert_eq!(strategy.max_seen.load(Ordering::SeqCst), 1);

        gate.add_permits(4);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(strategy.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_partial_failure_returns_survivors() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(3, strategy);

        let batch = urls(&[
            "http://v.example/bad",
            "http://v.example/2",
            "http://v.example/3",
        ]);
        let results = manager
            .download_batch(&batch, 1, false, &DownloadOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let episodes: Vec<u32> = results.iter().map(|m| m.episode_number).collect();
        assert_eq!(episodes, vec![2, 3]);
        assert!(results.iter().all(|m| !m.url.contains("bad")));
    }

    #[tokio::test]
    async fn batch_with_all_failures_raises() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(2, strategy);

        let batch = urls(&["http://v.example/bad1", "http://v.example/bad2"]);
        let err = manager
            .download_batch(&batch, 1, false, &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::AllDownloadsFailed { failed: 2 }));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(2, strategy);
        let err = manager
            .download_batch(&[], 1, false, &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Validation { .. }));
    }

    #[tokio::test]
    async fn extract_batch_metadata_is_all_or_nothing() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(2, strategy);

        let batch = urls(&["http://v.example/1", "http://v.example/bad"]);
        assert!(manager.extract_batch_metadata(&batch, 1).await.is_err());

        let batch = urls(&["http://v.example/1", "http://v.example/2"]);
        let metadata = manager.extract_batch_metadata(&batch, 5).await.unwrap();
        let episodes: Vec<u32> = metadata.iter().map(|m| m.episode_number).collect();
        assert_eq!(episodes, vec![5, 6]);
    }

    #[tokio::test]
    async fn cancel_unknown_download_is_a_noop() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(2, strategy);
        assert!(!manager.cancel_download("no-such-id"));
    }

    #[tokio::test]
    async fn cancel_waiting_download_cancels_before_start() {
        let gate = Arc::new(Semaphore::new(0));
        let strategy = Arc::new(ScriptedStrategy::gated(gate.clone()));
        let manager = manager_with(1, strategy.clone());

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .download_single("http://v.example/1", 1, None, &DownloadOptions::default())
                    .await
            })
        };
        while strategy.active.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let second = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .download_single("http://v.example/2", 2, None, &DownloadOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second_id = download_id("http://v.example/2", 2);
        assert!(manager.cancel_download(&second_id));
        let result = second.await.unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)));

        gate.add_permits(2);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn observer_panic_is_isolated() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(2, strategy);

        let seen: Arc<Mutex<Vec<DownloadStatus>>> = Arc::new(Mutex::new(Vec::new()));
        manager.add_progress_callback(|_, _| panic!("misbehaving observer"));
        let recorder = seen.clone();
        manager.add_progress_callback(move |_, progress| {
            recorder.lock().unwrap().push(progress.status);
        });

        let result = manager
            .download_single("http://v.example/1", 1, None, &DownloadOptions::default())
            .await;
        assert!(result.is_ok());

        let statuses = seen.lock().unwrap();
        assert!(statuses.contains(&DownloadStatus::Downloading));
        assert!(statuses.contains(&DownloadStatus::Completed));
    }

    #[tokio::test]
    async fn removed_observer_stops_receiving() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(2, strategy);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = manager.add_progress_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(manager.remove_progress_callback(handle));
        assert!(!manager.remove_progress_callback(handle));

        manager
            .download_single("http://v.example/1", 1, None, &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cleanup_removes_stale_files_and_empty_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let episode_dir = temp.path().join("episode_001");
        std::fs::create_dir_all(&episode_dir).unwrap();
        std::fs::write(episode_dir.join("001_partial.mp4"), b"stale").unwrap();

        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let config = DownloadManagerConfig {
            temp_dir: temp.path().to_path_buf(),
            ..Default::default()
        };
        let registry = StrategyRegistry::new(vec![strategy as Arc<dyn DownloadStrategy>]).unwrap();
        let manager = DownloadManager::with_strategies(config, registry);

        // Give the file's mtime a chance to fall behind the cutoff.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = manager.cleanup_temp_files(0).await;
        assert_eq!(removed, 1);
        assert!(!episode_dir.exists());
        assert!(temp.path().exists());
    }

    #[tokio::test]
    async fn statistics_reflect_configuration() {
        let strategy = Arc::new(ScriptedStrategy::new(Duration::from_millis(1)));
        let manager = manager_with(4, strategy);
        let stats = manager.get_download_statistics();
        assert_eq!(stats.active_downloads, 0);
        assert_eq!(stats.max_concurrent_downloads, 4);
        assert_eq!(stats.strategies, vec!["scripted".to_string()]);
    }
}
