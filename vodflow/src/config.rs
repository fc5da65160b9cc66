//! Application configuration.
//!
//! Plain config structs with defaults; `AppConfig::from_env` applies
//! environment overrides (read after `dotenvy::dotenv()` in `main`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fetch::DownloadManagerConfig;
use tracing::warn;

/// Priority scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scheduling cycles.
    pub cycle_interval: Duration,
    /// Maximum pending jobs fetched per cycle.
    pub pending_jobs_limit: usize,
    /// Admission ceiling for CPU usage, percent.
    pub cpu_threshold: f32,
    /// Admission ceiling for memory usage, percent.
    pub memory_threshold: f32,
    /// Admission ceiling for disk usage, percent.
    pub disk_threshold: f32,
    /// Whether GPU-backed jobs may be admitted on this host.
    pub enable_gpu: bool,
    /// GPU memory budget declared by the host, in MB.
    pub gpu_memory_mb: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(30),
            pending_jobs_limit: 50,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            enable_gpu: false,
            gpu_memory_mb: 8192,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string for the job repository.
    pub database_url: String,
    /// Working directory for in-flight downloads.
    pub temp_dir: PathBuf,
    /// Directory merged deliverables are written to.
    pub output_dir: PathBuf,
    /// Download engine configuration.
    pub download: DownloadManagerConfig,
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
    /// PeerTube-compatible hosts the platform strategy should recognize.
    pub platform_hosts: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let temp_dir = std::env::temp_dir().join("vodflow");
        let download = DownloadManagerConfig {
            temp_dir: temp_dir.clone(),
            ..Default::default()
        };
        Self {
            database_url: "sqlite://vodflow.db?mode=rwc".to_string(),
            temp_dir,
            output_dir: PathBuf::from("output"),
            download,
            scheduler: SchedulerConfig::default(),
            platform_hosts: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `VODFLOW_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("VODFLOW_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = env_parse::<PathBuf>("VODFLOW_TEMP_DIR") {
            config.temp_dir = dir.clone();
            config.download.temp_dir = dir;
        }
        if let Some(dir) = env_parse::<PathBuf>("VODFLOW_OUTPUT_DIR") {
            config.output_dir = dir;
        }
        if let Some(max) = env_parse::<usize>("VODFLOW_MAX_CONCURRENT_DOWNLOADS") {
            config.download.max_concurrent_downloads = max.max(1);
        }
        if let Some(secs) = env_parse::<u64>("VODFLOW_SCHEDULER_INTERVAL_SECS") {
            config.scheduler.cycle_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(limit) = env_parse::<usize>("VODFLOW_PENDING_JOBS_LIMIT") {
            config.scheduler.pending_jobs_limit = limit;
        }
        if let Some(enabled) = env_parse::<bool>("VODFLOW_ENABLE_GPU") {
            config.scheduler.enable_gpu = enabled;
        }
        if let Some(mb) = env_parse::<u64>("VODFLOW_GPU_MEMORY_MB") {
            config.scheduler.gpu_memory_mb = mb;
        }
        if let Ok(hosts) = std::env::var("VODFLOW_PLATFORM_HOSTS") {
            config.platform_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}
