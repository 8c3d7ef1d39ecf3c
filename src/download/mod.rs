//! Transfer, retry, merge and sidecar plumbing for archivist

pub mod merger;
pub mod retry;
pub mod sidecar;
pub mod transport;

pub use merger::*;
pub use retry::*;
pub use sidecar::*;
pub use transport::*;
