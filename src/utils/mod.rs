//! Utility functions for archivist

pub mod cache;
pub mod filename;

pub use cache::*;
pub use filename::*;
