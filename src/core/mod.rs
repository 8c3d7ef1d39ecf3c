//! Core functionality for archivist

pub mod config;
pub mod downloader;
pub mod media;
pub mod progress;
pub mod selector;

pub use config::*;
pub use downloader::*;
pub use media::*;
pub use progress::*;
pub use selector::*;
