//! Built-in download strategies.

pub mod http;
pub mod platform;

pub use http::HttpStrategy;
pub use platform::{PlatformSpec, PlatformStrategy};

use crate::error::DownloadError;
use crate::retry::RetryPolicy;

/// Wrap a still-retryable error once a strategy's retry budget is spent.
pub(crate) fn map_exhausted(url: &str, retry: &RetryPolicy, err: DownloadError) -> DownloadError {
    if err.is_retryable() {
        DownloadError::retries_exhausted(url, retry.max_retries + 1, err)
    } else {
        err
    }
}
