//! Command line interface for archivist

pub mod args;
pub mod output;

pub use args::{Args, Command, DownloadArgs, SweepArgs, VerbosityLevel};
pub use output::{ConsoleSink, OutputFormatter};
