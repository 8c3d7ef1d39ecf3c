//! Error types for archivist

use thiserror::Error;

/// Main error type for archivist operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No streams available")]
    NoStreamsAvailable,

    #[error("No suitable stream found")]
    NoSuitableStream,

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Cache store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Merge tool unavailable: {0}")]
    MergerUnavailable(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ArchiveError>,
    },

    #[error("Generic error: {0}")]
    Generic(String),
}

impl ArchiveError {
    /// Check if another attempt could succeed where this one failed.
    ///
    /// Selection errors are terminal because the candidate list never changes
    /// between attempts. Cancellation always ends the retry loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiveError::HttpStatus { .. }
            | ArchiveError::Http(_)
            | ArchiveError::Io(_)
            | ArchiveError::Timeout(_) => true,
            ArchiveError::Merge(_) | ArchiveError::Generic(_) => true,
            ArchiveError::Config(_)
            | ArchiveError::NoStreamsAvailable
            | ArchiveError::NoSuitableStream
            | ArchiveError::Json(_)
            | ArchiveError::Url(_)
            | ArchiveError::Store(_)
            | ArchiveError::MergerUnavailable(_)
            | ArchiveError::Cancelled
            | ArchiveError::RetriesExhausted { .. } => false,
        }
    }

    /// Check if the error is a stream selection failure
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self,
            ArchiveError::NoStreamsAvailable | ArchiveError::NoSuitableStream
        )
    }

    /// Check if the error came from cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            ArchiveError::Cancelled => true,
            ArchiveError::RetriesExhausted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
