//! # archivist - resumable media acquisition engine
//!
//! Archives media from a streaming platform given a catalog of candidate
//! streams for one piece of content.
//!
//! ## Features
//!
//! - Best-stream selection (combined vs. separate video and audio)
//! - Byte-range resume across attempts and restarts
//! - Segmented transfers with ordered concatenation
//! - Audio/video merging through ffmpeg
//! - Progress publishing to an HTTP controller and a Redis cache
//!
//! ## Example
//!
//! ```rust,no_run
//! use archivist::{Config, DownloadRequest, Downloader};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let request: DownloadRequest = serde_json::from_str(&std::fs::read_to_string("request.json")?)?;
//!     let downloader = Downloader::new(Config::default().with_output_dir("./downloads"))?;
//!
//!     let result = downloader.download(&CancellationToken::new(), &request).await;
//!     println!("Downloaded: {:?}", result.file_path);
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod core;
pub mod download;
pub mod error;
pub mod report;
pub mod utils;

// Re-export main types
pub use self::core::{
    Config, DownloadProgress, DownloadRequest, DownloadResult, DownloadStatus, DownloadWarning, Downloader,
    ProgressTracker, Stream, StreamSelector, StreamType,
};
pub use error::ArchiveError;
pub use report::{ProgressReporter, ProgressSink, RedisProgressReporter};

/// Result type alias for archivist operations
pub type Result<T> = std::result::Result<T, ArchiveError>;
