//! Hosted-platform download strategy.
//!
//! Recognizes watch-page URLs of configured video platforms, resolves the
//! real media file through the platform's JSON API, and streams the chosen
//! rendition to disk. PeerTube-compatible instances are supported out of the
//! box; other platforms can be added with a custom [`PlatformSpec`].

use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::DownloadError;
use crate::metadata::VideoMetadata;
use crate::progress::{DownloadProgress, DownloadStatus};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::strategies::http::stream_response_to_file;
use crate::strategy::{DownloadRequest, DownloadStrategy};

/// One recognized platform: a URL pattern capturing the video id and an API
/// endpoint template resolving that id to metadata plus download URLs.
#[derive(Debug, Clone)]
pub struct PlatformSpec {
    pub name: String,
    url_regex: Regex,
    api_template: String,
}

impl PlatformSpec {
    /// A spec from an explicit pattern and API template.
    ///
    /// The pattern's first capture group is the video id; `{id}` in the
    /// template is replaced with it.
    pub fn new(
        name: impl Into<String>,
        url_pattern: &str,
        api_template: impl Into<String>,
    ) -> Result<Self, DownloadError> {
        let url_regex = Regex::new(url_pattern)
            .map_err(|e| DownloadError::validation(format!("invalid platform pattern: {e}")))?;
        Ok(Self {
            name: name.into(),
            url_regex,
            api_template: api_template.into(),
        })
    }

    /// A spec for one PeerTube-compatible instance.
    pub fn peertube(host: &str) -> Result<Self, DownloadError> {
        let escaped = regex::escape(host);
        Self::new(
            format!("peertube:{host}"),
            &format!(r"^https?://{escaped}/(?:w|videos/watch)/([0-9a-zA-Z-]+)"),
            format!("https://{host}/api/v1/videos/{{id}}"),
        )
    }

    fn video_id<'a>(&self, url: &'a str) -> Option<&'a str> {
        self.url_regex
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    fn api_url(&self, id: &str) -> String {
        self.api_template.replace("{id}", id)
    }
}

#[derive(Debug, Deserialize)]
struct ApiVideo {
    name: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    files: Vec<ApiFile>,
}

#[derive(Debug, Deserialize)]
struct ApiFile {
    #[serde(rename = "fileDownloadUrl")]
    file_download_url: String,
    size: Option<u64>,
    resolution: Option<ApiResolution>,
}

#[derive(Debug, Deserialize)]
struct ApiResolution {
    label: Option<String>,
}

/// Resolved media information for one platform video.
struct ResolvedMedia {
    title: Option<String>,
    duration: Option<f64>,
    filesize: Option<u64>,
    format: Option<String>,
    media_url: String,
}

pub struct PlatformStrategy {
    client: Client,
    retry: RetryPolicy,
    specs: Vec<PlatformSpec>,
}

impl PlatformStrategy {
    pub fn new(
        config: &FetchConfig,
        retry: RetryPolicy,
        specs: Vec<PlatformSpec>,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            client: config.build_client()?,
            retry,
            specs,
        })
    }

    fn spec_for<'a>(&'a self, url: &'a str) -> Option<(&'a PlatformSpec, &'a str)> {
        self.specs
            .iter()
            .find_map(|spec| spec.video_id(url).map(|id| (spec, id)))
    }

    async fn resolve(
        &self,
        url: &str,
        quality: Option<&str>,
    ) -> Result<ResolvedMedia, DownloadError> {
        let (spec, id) = self
            .spec_for(url)
            .ok_or_else(|| DownloadError::UnsupportedUrl {
                url: url.to_string(),
            })?;
        let api_url = spec.api_url(id);
        debug!(platform = %spec.name, %api_url, "Resolving platform video");

        let response = self.client.get(&api_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, api_url, "platform resolve"));
        }

        let video: ApiVideo = response
            .json()
            .await
            .map_err(|e| DownloadError::metadata(url, format!("malformed platform response: {e}")))?;

        let file = pick_file(&video.files, quality).ok_or_else(|| {
            DownloadError::metadata(url, "platform response lists no downloadable files")
        })?;

        let format = file
            .file_download_url
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| ext.len() <= 5);

        Ok(ResolvedMedia {
            title: video.name.clone(),
            duration: video.duration,
            filesize: file.size,
            format,
            media_url: file.file_download_url.clone(),
        })
    }

    /// One download attempt: re-resolve the media URL (signed URLs go stale)
    /// and stream it to disk.
    async fn attempt(&self, request: &DownloadRequest<'_>) -> Result<VideoMetadata, DownloadError> {
        let resolved = self
            .resolve(request.url, request.options.video_quality.as_deref())
            .await?;

        let response = self.client.get(&resolved.media_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(
                status,
                resolved.media_url.clone(),
                "download",
            ));
        }

        let total_bytes = response.content_length().or(resolved.filesize);
        let mut progress = DownloadProgress {
            url: request.url.to_string(),
            status: DownloadStatus::Downloading,
            downloaded_bytes: 0,
            total_bytes,
            speed: 0.0,
            eta: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        request.emit(&progress);

        stream_response_to_file(response, request.output_path, false, &mut progress, request)
            .await?;

        let filesize = tokio::fs::metadata(request.output_path).await?.len();

        let mut metadata = VideoMetadata::new(request.url, request.episode_number);
        metadata.title = resolved.title;
        metadata.duration = resolved.duration;
        metadata.filesize = Some(filesize);
        metadata.format = resolved.format;
        metadata.downloaded_path = Some(request.output_path.to_path_buf());

        progress.status = DownloadStatus::Completed;
        progress.downloaded_bytes = filesize;
        progress.total_bytes = progress.total_bytes.or(Some(filesize));
        progress.completed_at = Some(Utc::now());
        request.emit(&progress);

        Ok(metadata)
    }
}

/// Prefer a rendition whose label matches the requested quality, else the
/// largest file.
fn pick_file<'a>(files: &'a [ApiFile], quality: Option<&str>) -> Option<&'a ApiFile> {
    if let Some(wanted) = quality
        && let Some(file) = files.iter().find(|f| {
            f.resolution
                .as_ref()
                .and_then(|r| r.label.as_deref())
                .is_some_and(|label| label.eq_ignore_ascii_case(wanted))
        })
    {
        return Some(file);
    }
    files.iter().max_by_key(|f| f.size.unwrap_or(0))
}

#[async_trait::async_trait]
impl DownloadStrategy for PlatformStrategy {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn supports_url(&self, url: &str) -> bool {
        self.spec_for(url).is_some()
    }

    async fn extract_metadata(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
        let token = tokio_util::sync::CancellationToken::new();
        let resolved = retry_with_backoff(&self.retry, &token, |_| self.resolve(url, None))
            .await
            .map_err(|err| super::map_exhausted(url, &self.retry, err))?;

        let mut metadata = VideoMetadata::new(url, 0);
        metadata.title = resolved.title;
        metadata.duration = resolved.duration;
        metadata.filesize = resolved.filesize;
        metadata.format = resolved.format;
        Ok(metadata)
    }

    async fn download(&self, request: DownloadRequest<'_>) -> Result<VideoMetadata, DownloadError> {
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let token = request.token.clone();
        let result = retry_with_backoff(&self.retry, &token, |_| self.attempt(&request)).await;

        match result {
            Ok(metadata) => Ok(metadata),
            Err(DownloadError::Cancelled) => Err(DownloadError::Cancelled),
            Err(err) => {
                let mut progress = DownloadProgress::queued(request.url);
                progress.status = DownloadStatus::Failed;
                progress.error = Some(err.to_string());
                progress.completed_at = Some(Utc::now());
                request.emit(&progress);
                Err(super::map_exhausted(request.url, &self.retry, err))
            }
        }
    }
}
