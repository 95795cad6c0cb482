use std::error::Error as _;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("strategy registry used before initialization")]
    NotInitialized,

    #[error("extraction failed for {url}: {source}")]
    ExtractionFailed {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("no images found at the submitted urls")]
    NoImagesFound,

    #[error("none of the images could be downloaded")]
    NoImagesDownloaded,

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("a job is already processing for this user")]
    AlreadyProcessing,

    #[error("invalid archive name: {0}")]
    InvalidArchiveName(String),

    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, GalleryError>;

/// Outcome classification for a single network fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Connection reset, timeout, DNS failure, hang-up or 5xx.
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("http status {0}")]
    Status(u16),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.is_server_error() {
            FetchError::Transient(format!("server responded {}", status))
        } else {
            FetchError::Status(status.as_u16())
        }
    }
}

const TRANSIENT_PATTERNS: [&str; 6] = [
    "connection reset",
    "timed out",
    "timeout",
    "dns error",
    "socket hang up",
    "connection closed before message completed",
];

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return FetchError::from_status(status);
        }
        if err.is_timeout() || err.is_connect() {
            return FetchError::Transient(err.to_string());
        }
        // reqwest hides the io cause behind `source()`, so inspect the whole chain
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        let lowered = message.to_lowercase();
        if TRANSIENT_PATTERNS.iter().any(|p| lowered.contains(p)) {
            FetchError::Transient(message)
        } else {
            FetchError::Other(message)
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Other(format!("io error: {}", err))
    }
}
