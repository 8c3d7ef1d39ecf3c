//! Command line argument parsing

use crate::core::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// archivist - resumable media archiver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (only errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the content described by a request file
    Download(DownloadArgs),
    /// Remove stale entries from the shared active-download set
    Sweep(SweepArgs),
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// JSON file holding the download request
    #[arg(value_name = "REQUEST")]
    pub request: PathBuf,

    /// Output directory
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Tallest acceptable video height
    #[arg(long, value_name = "PIXELS")]
    pub max_height: Option<u32>,

    /// Take a combined stream whenever one exists
    #[arg(long)]
    pub prefer_combined: bool,

    /// Container of merged output (e.g., 'mp4', 'mkv')
    #[arg(long, value_name = "EXT")]
    pub merge_format: Option<String>,

    /// Total download attempts
    #[arg(long)]
    pub retries: Option<u32>,

    /// Backoff delay after a failed attempt, repeat for a table (e.g., 5s)
    #[arg(long = "retry-delay", value_name = "DURATION")]
    pub retry_delays: Vec<humantime::Duration>,

    /// Longest wait for the next chunk of a response body (e.g., 60s)
    #[arg(long, value_name = "DURATION")]
    pub read_timeout: Option<humantime::Duration>,

    /// Path to the ffmpeg binary
    #[arg(long, value_name = "PATH")]
    pub ffmpeg: Option<PathBuf>,

    /// Worker id reported with progress
    #[arg(long, value_name = "ID")]
    pub worker_id: Option<String>,

    /// Override User-Agent header
    #[arg(long, value_name = "USER_AGENT")]
    pub user_agent: Option<String>,

    /// Skip thumbnail, metadata and subtitle files
    #[arg(long)]
    pub no_sidecars: bool,

    /// Disable progress output
    #[arg(long)]
    pub no_progress: bool,

    /// Controller base URL receiving progress and status pushes
    #[arg(long, env = "ARCHIVIST_CONTROLLER_URL", value_name = "URL")]
    pub controller: Option<String>,

    /// Redis URL of the shared progress cache
    #[arg(long, env = "ARCHIVIST_REDIS_URL", value_name = "URL")]
    pub redis: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct SweepArgs {
    /// Redis URL of the shared progress cache
    #[arg(long, env = "ARCHIVIST_REDIS_URL", value_name = "URL")]
    pub redis: String,

    /// Keep sweeping at this interval until interrupted (e.g., 30s)
    #[arg(long, value_name = "DURATION")]
    pub every: Option<humantime::Duration>,
}

impl Args {
    /// Get output verbosity level
    pub fn verbosity_level(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }
}

impl DownloadArgs {
    /// Override `config` with the flags that were given
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(output) = &self.output {
            config = config.with_output_dir(output);
        }
        if let Some(max_height) = self.max_height {
            config = config.with_max_height(max_height);
        }
        if self.prefer_combined {
            config = config.with_prefer_combined(true);
        }
        if let Some(format) = &self.merge_format {
            config = config.with_merge_format(format);
        }
        if let Some(retries) = self.retries {
            config = config.with_retries(retries);
        }
        if !self.retry_delays.is_empty() {
            config = config.with_retry_delays(self.retry_delays.iter().map(|d| Duration::from(*d)).collect());
        }
        if let Some(timeout) = self.read_timeout {
            config.read_timeout = timeout.into();
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config = config.with_ffmpeg_path(ffmpeg);
        }
        if let Some(worker_id) = &self.worker_id {
            config = config.with_worker_id(worker_id);
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = Some(user_agent.clone());
        }
        if self.no_sidecars {
            config = config.with_sidecars(false);
        }
        config
    }
}

/// Output verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbosityLevel {
    /// Quiet (only errors)
    Quiet,
    /// Normal
    Normal,
    /// Verbose (debug info)
    Verbose,
}
