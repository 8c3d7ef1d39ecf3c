//! Output formatting and progress display

use crate::cli::args::VerbosityLevel;
use crate::core::media::DownloadWarning;
use crate::core::progress::{format_bytes, format_duration, DownloadProgress, DownloadStatus};
use crate::error::ArchiveError;
use crate::report::ProgressSink;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

/// Output formatter for archivist
pub struct OutputFormatter {
    verbosity: VerbosityLevel,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self { verbosity }
    }

    /// Progress sink drawing a console bar, `None` in quiet mode
    pub fn console_sink(&self) -> Option<ConsoleSink> {
        if self.verbosity == VerbosityLevel::Quiet {
            return None;
        }

        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        let progress_bar = ProgressBar::new(0);
        progress_bar.set_style(style);
        progress_bar.set_message("Starting...");
        Some(ConsoleSink { progress_bar })
    }

    /// Print info message
    pub fn info(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            println!("ℹ️  {}", message);
        }
    }

    /// Print success message
    pub fn success(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            println!("✅ {}", message);
        }
    }

    /// Print warning message
    pub fn warning(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            eprintln!("⚠️  {}", message);
        }
    }

    /// Print error message
    pub fn error(&self, message: &str) {
        eprintln!("❌ {}", message);
    }

    /// Print download start message
    pub fn print_download_start(&self, video_id: &str, title: &str, output_dir: &Path) {
        if self.verbosity == VerbosityLevel::Quiet {
            return;
        }

        println!("🚀 Starting download...");
        println!("📹 {} ({})", if title.is_empty() { video_id } else { title }, video_id);
        println!("💾 Output: {}", output_dir.display());
        println!();
    }

    /// Print download complete message
    pub fn print_download_complete(&self, output_path: &Path, size: u64, attempts: u32, duration: Duration) {
        if self.verbosity == VerbosityLevel::Quiet {
            return;
        }

        println!();
        println!("✅ Download completed!");
        println!("💾 Saved to: {} ({})", output_path.display(), format_bytes(size));
        if attempts > 1 {
            println!("🔁 Attempts: {}", attempts);
        }
        println!("⏱️  Time: {}", format_duration(duration));
    }

    /// Print non-fatal problems of a finished download
    pub fn print_warnings(&self, warnings: &[DownloadWarning]) {
        for warning in warnings {
            self.warning(&format!("{:?}: {}", warning.kind, warning.message));
        }
    }
}

/// Console progress bar fed by download events
pub struct ConsoleSink {
    progress_bar: ProgressBar,
}

impl ConsoleSink {
    fn render(&self, progress: &DownloadProgress) {
        if progress.total > 0 {
            self.progress_bar.set_length(progress.total);
        }
        self.progress_bar.set_position(progress.downloaded);

        match progress.status {
            DownloadStatus::Downloading => {
                let mut message = format!("{} ETA {}", progress.speed, progress.eta);
                if let Some(fragment) = &progress.fragment {
                    message.push_str(&format!(" [{}]", fragment));
                }
                self.progress_bar.set_message(message);
            }
            DownloadStatus::Processing => self.progress_bar.set_message("Merging..."),
            DownloadStatus::Completed => self.progress_bar.finish_with_message("Done"),
            DownloadStatus::Error => self.progress_bar.abandon_with_message("Failed"),
        }
    }
}

#[async_trait]
impl ProgressSink for ConsoleSink {
    async fn publish(&self, progress: &DownloadProgress, _force: bool) -> Result<(), ArchiveError> {
        self.render(progress);
        Ok(())
    }
}
