//! Main entry point for archivist CLI

use anyhow::{Context, Result};
use archivist::cli::{Args, Command, DownloadArgs, OutputFormatter, SweepArgs, VerbosityLevel};
use archivist::core::{Config, DownloadRequest, Downloader};
use archivist::report::{ProgressReporter, RedisProgressReporter, RedisStore};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbosity_level());
    debug!("Starting archivist with args: {:?}", args);

    let formatter = OutputFormatter::new(args.verbosity_level());

    // Ctrl-C cancels whatever is running
    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling...");
            ctrl_c_token.cancel();
        }
    });

    match &args.command {
        Command::Download(download) => handle_download(download, &formatter, &token).await,
        Command::Sweep(sweep) => handle_sweep(sweep, &formatter, &token).await,
    }
}

/// Handle single content download
async fn handle_download(args: &DownloadArgs, formatter: &OutputFormatter, token: &CancellationToken) -> Result<()> {
    let raw = tokio::fs::read_to_string(&args.request)
        .await
        .with_context(|| format!("failed to read request file {:?}", args.request))?;
    let request: DownloadRequest = serde_json::from_str(&raw)
        .with_context(|| format!("invalid request file {:?}", args.request))?;

    let config = args.apply(Config::from_env()?);
    let mut downloader = Downloader::new(config)?;

    if !args.no_progress {
        if let Some(console) = formatter.console_sink() {
            downloader = downloader.with_sink(Arc::new(console));
        }
    }
    if let Some(controller) = &args.controller {
        info!("Reporting progress to {}", controller);
        downloader = downloader.with_sink(Arc::new(ProgressReporter::new(controller)?));
    }
    if let Some(redis_url) = &args.redis {
        let store = RedisStore::connect(redis_url).await?;
        downloader = downloader.with_sink(Arc::new(RedisProgressReporter::new(Arc::new(store))));
    }

    formatter.print_download_start(&request.video_id, &request.title, &downloader.content_dir(&request));

    let result = downloader.download(token, &request).await;
    formatter.print_warnings(&result.warnings);

    if let Some(error) = result.error {
        formatter.error(&error.to_string());
        return Err(error.into());
    }

    if let Some(path) = &result.file_path {
        formatter.print_download_complete(path, result.file_size, result.attempts, result.elapsed);
    }
    Ok(())
}

/// Handle active-set sweeping, once or periodically
async fn handle_sweep(args: &SweepArgs, formatter: &OutputFormatter, token: &CancellationToken) -> Result<()> {
    let store = RedisStore::connect(&args.redis).await?;
    let reporter = Arc::new(RedisProgressReporter::new(Arc::new(store)));

    match args.every {
        Some(every) => {
            formatter.info(&format!("Sweeping every {}", every));
            reporter.spawn_sweeper(every.into(), token.clone()).await?;
        }
        None => {
            let removed = reporter.sweep().await?;
            formatter.success(&format!("Removed {} stale entries", removed.len()));
        }
    }
    Ok(())
}

/// Initialize logging system
fn init_logging(verbosity: VerbosityLevel) {
    let default_level = match verbosity {
        VerbosityLevel::Quiet => "error",
        VerbosityLevel::Normal => "info",
        VerbosityLevel::Verbose => "debug",
    };

    // RUST_LOG wins over the verbosity flags
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}
