use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("no strategy supports URL `{url}`")]
    UnsupportedUrl { url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("metadata extraction failed for {url}: {reason}")]
    Metadata { url: String, reason: String },

    #[error("validation error: {reason}")]
    Validation { reason: String },

    #[error("download of {url} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("all {failed} downloads in the batch failed")]
    AllDownloadsFailed { failed: usize },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn metadata(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Metadata {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn retries_exhausted(url: impl Into<String>, attempts: u32, source: DownloadError) -> Self {
        Self::RetriesExhausted {
            url: url.into(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Whether the retry layer may attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::UnsupportedUrl { .. }
            | Self::Validation { .. }
            | Self::RetriesExhausted { .. }
            | Self::AllDownloadsFailed { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::Io { .. } | Self::Metadata { .. } | Self::Internal { .. } => true,
        }
    }
}
