//! HTTP client configuration for the download strategies.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::DownloadError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Configurable options for strategy HTTP clients.
///
/// Per-request timeouts live here; the manager never watches a transfer
/// externally, a stalled connection fails through these timeouts.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between received chunks).
    pub read_timeout: Duration,

    /// Whether to follow redirects.
    pub follow_redirects: bool,

    /// User agent string.
    pub user_agent: String,

    /// Maximum idle connections to keep per host.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing.
    pub pool_idle_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl FetchConfig {
    /// Build a reqwest client from this configuration.
    pub fn build_client(&self) -> Result<reqwest::Client, DownloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );

        let redirect = if self.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };

        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .redirect(redirect)
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .build()
            .map_err(DownloadError::from)
    }
}

/// Per-download options passed through to the selected strategy.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Resume a partial file with a byte-range request when one is found.
    pub resume: bool,

    /// Requested quality label, e.g. "1080p". Strategies that can choose
    /// between renditions prefer a matching one; others ignore it.
    pub video_quality: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            resume: true,
            video_quality: None,
        }
    }
}
