//! Generic HTTP download strategy.
//!
//! Handles any direct http(s) URL: metadata from a HEAD probe, chunked
//! streaming to disk, and resuming a partial file via a byte-range request
//! when the server answers 206 Partial Content.

use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{DownloadOptions, FetchConfig};
use crate::error::DownloadError;
use crate::metadata::VideoMetadata;
use crate::progress::{DownloadProgress, DownloadStatus};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::strategy::{DownloadRequest, DownloadStrategy};

/// Minimum interval between progress emissions.
const PROGRESS_INTERVAL_SECS: f64 = 1.0;

pub struct HttpStrategy {
    client: Client,
    retry: RetryPolicy,
}

impl HttpStrategy {
    pub fn new(config: &FetchConfig, retry: RetryPolicy) -> Result<Self, DownloadError> {
        Ok(Self {
            client: config.build_client()?,
            retry,
        })
    }

    async fn probe(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
        let response = self.client.head(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, url, "metadata probe"));
        }

        let headers = response.headers();
        let filename = headers
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition_filename)
            .or_else(|| last_path_segment(url));

        let filesize = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let format = filename
            .as_deref()
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
            .or_else(|| {
                headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|ct| ct.strip_prefix("video/"))
                    .map(|sub| sub.split(';').next().unwrap_or(sub).trim().to_string())
            });

        let mut metadata = VideoMetadata::new(url, 0);
        metadata.title = filename.map(|name| match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name,
        });
        metadata.filesize = filesize;
        metadata.format = format;
        Ok(metadata)
    }

    /// One download attempt. Re-invoked by the retry layer; a later attempt
    /// picks up whatever the previous one managed to write.
    async fn attempt(
        &self,
        request: &DownloadRequest<'_>,
        options: &DownloadOptions,
    ) -> Result<VideoMetadata, DownloadError> {
        let url = request.url;

        let mut resume_from = if options.resume {
            tokio::fs::metadata(request.output_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            0
        };

        let mut builder = self.client.get(url);
        if resume_from > 0 {
            builder = builder.header(header::RANGE, format!("bytes={resume_from}-"));
        }

        let response = builder.send().await?;
        let status = response.status();

        let append = match (resume_from > 0, status) {
            (true, StatusCode::PARTIAL_CONTENT) => {
                info!(url, resume_from, "Resuming partial download");
                true
            }
            (true, StatusCode::OK) => {
                // Server ignored the range; restart from the beginning.
                warn!(url, "Server does not support resume, restarting");
                resume_from = 0;
                false
            }
            (_, status) if !status.is_success() => {
                return Err(DownloadError::http_status(status, url, "download"));
            }
            _ => false,
        };

        let total_bytes = response
            .content_length()
            .map(|remaining| resume_from + remaining);

        let mut progress = DownloadProgress {
            url: url.to_string(),
            status: DownloadStatus::Downloading,
            downloaded_bytes: resume_from,
            total_bytes,
            speed: 0.0,
            eta: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        request.emit(&progress);

        let written =
            stream_response_to_file(response, request.output_path, append, &mut progress, request)
                .await?;
        debug!(url, bytes = written, "Transfer finished");

        let filesize = tokio::fs::metadata(request.output_path).await?.len();

        let mut metadata = VideoMetadata::new(url, request.episode_number);
        metadata.title = request
            .output_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
        metadata.format = request
            .output_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        metadata.filesize = Some(filesize);
        metadata.downloaded_path = Some(request.output_path.to_path_buf());

        progress.status = DownloadStatus::Completed;
        progress.downloaded_bytes = filesize;
        progress.total_bytes = progress.total_bytes.or(Some(filesize));
        progress.completed_at = Some(Utc::now());
        request.emit(&progress);

        Ok(metadata)
    }
}

#[async_trait::async_trait]
impl DownloadStrategy for HttpStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports_url(&self, url: &str) -> bool {
        matches!(
            url::Url::parse(url).map(|u| u.scheme().to_string()),
            Ok(scheme) if scheme == "http" || scheme == "https"
        )
    }

    async fn extract_metadata(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
        let token = tokio_util::sync::CancellationToken::new();
        retry_with_backoff(&self.retry, &token, |_| self.probe(url))
            .await
            .map_err(|err| super::map_exhausted(url, &self.retry, err))
    }

    async fn download(&self, request: DownloadRequest<'_>) -> Result<VideoMetadata, DownloadError> {
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = request.options.clone();
        let token = request.token.clone();
        let result =
            retry_with_backoff(&self.retry, &token, |_| self.attempt(&request, &options)).await;

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

/// Stream a response body to disk with throttled progress emission.
///
/// Shared by the HTTP and platform strategies. Cancellation is cooperative:
/// an in-flight chunk finishes writing and the partial file is left on disk
/// for later cleanup.
pub(crate) async fn stream_response_to_file(
    response: reqwest::Response,
    path: &Path,
    append: bool,
    progress: &mut DownloadProgress,
    request: &DownloadRequest<'_>,
) -> Result<u64, DownloadError> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(path)
        .await?;
    let mut writer = tokio::io::BufWriter::new(file);

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    let mut last_emit = Instant::now();
    let mut bytes_since_emit: u64 = 0;

    while let Some(chunk) = stream.next().await {
        if request.token.is_cancelled() {
            writer.flush().await?;
            return Err(DownloadError::Cancelled);
        }

        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
        bytes_since_emit += chunk.len() as u64;
        progress.downloaded_bytes += chunk.len() as u64;

        let elapsed = last_emit.elapsed().as_secs_f64();
        if elapsed >= PROGRESS_INTERVAL_SECS {
            progress.speed = bytes_since_emit as f64 / elapsed;
            progress.eta = match (progress.total_bytes, progress.speed > 0.0) {
                (Some(total), true) => {
                    Some(total.saturating_sub(progress.downloaded_bytes) as f64 / progress.speed)
                }
                _ => None,
            };
            request.emit(progress);
            last_emit = Instant::now();
            bytes_since_emit = 0;
        }
    }

    writer.flush().await?;
    Ok(written)
}

fn parse_content_disposition_filename(value: &str) -> Option<String> {
    let (_, rest) = value.split_once("filename=")?;
    let name = rest.split(';').next()?.trim().trim_matches(['"', '\'']);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn last_path_segment(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_disposition() {
        assert_eq!(
            parse_content_disposition_filename("attachment; filename=\"ep01.mp4\""),
            Some("ep01.mp4".to_string())
        );
        assert_eq!(
            parse_content_disposition_filename("attachment; filename=ep01.mp4; size=5"),
            Some("ep01.mp4".to_string())
        );
        assert_eq!(parse_content_disposition_filename("attachment"), None);
    }

    #[test]
    fn extracts_last_path_segment() {
        assert_eq!(
            last_path_segment("https://v.example/series/ep01.mp4?sig=abc"),
            Some("ep01.mp4".to_string())
        );
        assert_eq!(last_path_segment("https://v.example/"), None);
    }

    #[test]
    fn supports_only_http_schemes() {
        let strategy = HttpStrategy::new(&FetchConfig::default(), RetryPolicy::default()).unwrap();
        assert!(strategy.supports_url("http://v.example/a.mp4"));
        assert!(strategy.supports_url("https://v.example/a.mp4"));
        assert!(!strategy.supports_url("ftp://v.example/a.mp4"));
        assert!(!strategy.supports_url("not a url"));
    }
}
