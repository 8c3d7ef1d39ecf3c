//! Main downloader implementation

use crate::core::config::Config;
use crate::core::media::{
    DownloadRequest, DownloadResult, DownloadWarning, Resolution, Stream, WarningKind,
};
use crate::core::progress::{
    format_speed, DownloadProgress, DownloadStatus, ProgressCallback, ProgressTracker,
    StatusUpdate,
};
use crate::core::selector::{needs_audio_reencode, Selection, StreamSelector};
use crate::download::merger::{concat_raw, temp_output, FfmpegMerger, MediaMerger, MergeMode};
use crate::download::retry::RetryPolicy;
use crate::download::sidecar::{write_metadata, write_subtitles, write_thumbnail, MetadataSidecar};
use crate::download::transport::{TransferCallback, TransferProgress, Transport, TransportConfig};
use crate::error::ArchiveError;
use crate::report::{ProgressEmitter, ProgressPump, ProgressSink};
use crate::utils::filename::{canonical_filename, to_safe_filename};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scratch directory for segment files, inside the content directory
pub const SEGMENTS_DIR: &str = ".segments";

/// Final artifact of a successful attempt
struct Artifact {
    path: PathBuf,
    size: u64,
    warnings: Vec<DownloadWarning>,
}

/// Downloads one piece of content at a time with retry, resume, merge and
/// progress reporting. Each worker owns its own instance.
pub struct Downloader {
    config: Config,
    selector: StreamSelector,
    transport: Transport,
    retry: RetryPolicy,
    merger: Arc<dyn MediaMerger>,
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl Downloader {
    /// Create a downloader, rejecting an invalid configuration before any
    /// network activity
    pub fn new(config: Config) -> Result<Self, ArchiveError> {
        config.validate()?;

        let selector = StreamSelector::new(config.max_height, config.prefer_combined)
            .with_container(&config.merge_format);
        let transport = Transport::new(TransportConfig::from_config(&config))?;
        let retry = RetryPolicy::from_config(&config);
        let merger: Arc<dyn MediaMerger> = Arc::new(FfmpegMerger::new(config.ffmpeg_path.clone()));

        Ok(Self {
            config,
            selector,
            transport,
            retry,
            merger,
            sinks: Vec::new(),
        })
    }

    /// Replace the merge tool
    pub fn with_merger(mut self, merger: Arc<dyn MediaMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Add a progress sink
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `{output}/channels/{channel}/videos/{id}`, or `{output}/videos/{id}`
    /// without a channel
    pub fn content_dir(&self, request: &DownloadRequest) -> PathBuf {
        let video = to_safe_filename(&request.video_id, "");
        match &request.channel_id {
            Some(channel) => self
                .config
                .output_dir
                .join("channels")
                .join(to_safe_filename(channel, ""))
                .join("videos")
                .join(video),
            None => self.config.output_dir.join("videos").join(video),
        }
    }

    /// Final file name for the given extension
    pub fn output_name(&self, request: &DownloadRequest, ext: &str) -> String {
        match request.episode {
            Some(episode) => {
                let channel = request
                    .channel_name
                    .as_deref()
                    .or(request.channel_id.as_deref())
                    .unwrap_or("unknown");
                canonical_filename(channel, episode, &request.title, ext)
            }
            None => format!("video.{}", ext),
        }
    }

    /// Download `request`, retrying transient failures.
    ///
    /// Never returns early without a terminal progress event: every call
    /// ends with either `completed` or `error` published to all sinks.
    pub async fn download(&self, token: &CancellationToken, request: &DownloadRequest) -> DownloadResult {
        let started = Instant::now();
        let pump = ProgressPump::start(self.sinks.clone());
        let emitter = pump.emitter();

        let tracker_emitter = emitter.clone();
        let callback: ProgressCallback = Arc::new(move |progress| tracker_emitter.progress(progress));
        let mut tracker = ProgressTracker::new(&request.video_id, &self.config.worker_id, 0, callback);

        info!("Starting download for: {}", request.video_id);

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            debug!("Attempt {}/{} for {}", attempts, self.retry.attempts, request.video_id);

            let error = match self.attempt(token, request, &emitter, &mut tracker).await {
                Ok(artifact) => break Ok(artifact),
                Err(e) => e,
            };

            if error.is_cancelled() {
                info!("Download of {} cancelled", request.video_id);
                break Err(error);
            }
            if !error.is_retryable() {
                warn!("Download of {} failed permanently: {}", request.video_id, error);
                break Err(error);
            }
            if !self.retry.has_next(attempts) {
                break Err(ArchiveError::RetriesExhausted {
                    attempts,
                    source: Box::new(error),
                });
            }

            warn!(
                "Attempt {}/{} for {} failed: {}. Retrying...",
                attempts, self.retry.attempts, request.video_id, error
            );
            if let Err(cancelled) = self.retry.backoff(attempts, token).await {
                break Err(cancelled);
            }
        };

        let result = match outcome {
            Ok(artifact) => {
                info!(
                    "Download completed: {:?} ({} bytes)",
                    artifact.path, artifact.size
                );
                tracker.set_total(artifact.size);
                tracker.complete();

                let mut update = StatusUpdate::new(&request.video_id, &self.config.worker_id, DownloadStatus::Completed);
                update.file_path = Some(artifact.path.to_string_lossy().into_owned());
                update.file_size = Some(artifact.size);
                emitter.status(update);

                DownloadResult {
                    success: true,
                    attempts,
                    elapsed: started.elapsed(),
                    file_path: Some(artifact.path),
                    file_size: artifact.size,
                    error: None,
                    warnings: artifact.warnings,
                }
            }
            Err(error) => {
                warn!("Download of {} failed: {}", request.video_id, error);
                tracker.error();

                let mut update = StatusUpdate::new(&request.video_id, &self.config.worker_id, DownloadStatus::Error);
                update.error = Some(error.to_string());
                emitter.status(update);

                DownloadResult {
                    success: false,
                    attempts,
                    elapsed: started.elapsed(),
                    file_path: None,
                    file_size: 0,
                    error: Some(error),
                    warnings: Vec::new(),
                }
            }
        };

        drop(tracker);
        drop(emitter);
        pump.finish(token).await;
        result
    }

    async fn attempt(
        &self,
        token: &CancellationToken,
        request: &DownloadRequest,
        emitter: &ProgressEmitter,
        tracker: &mut ProgressTracker,
    ) -> Result<Artifact, ArchiveError> {
        let dir = self.content_dir(request);
        fs::create_dir_all(&dir).await?;

        let selection = self.selector.select(&request.streams)?;
        info!(
            "Selected format {} ({}, {}){}",
            selection.video.format_id,
            selection.video.quality_label(),
            selection.video.bitrate_string(),
            selection
                .audio
                .as_ref()
                .map(|a| format!(" + audio {}", a.format_id))
                .unwrap_or_default()
        );

        emitter.force(
            DownloadProgress::new(&request.video_id, &self.config.worker_id, DownloadStatus::Downloading)
                .with_bytes(0, selection.video.content_length),
        );

        let mut warnings = Vec::new();
        let video_path = dir.join(format!("video.{}", selection.video.extension()));
        self.fetch_stream(&selection.video, &video_path, token, request, emitter, tracker)
            .await?;

        let mut final_path = video_path.clone();
        let mut merged = false;

        if let Some(audio) = &selection.audio {
            if self.merger.is_available().await {
                let audio_path = dir.join(format!("audio.{}", audio.extension()));
                self.fetch_stream(audio, &audio_path, token, request, emitter, tracker)
                    .await?;

                tracker.processing();
                let target = dir.join(self.output_name(request, &self.config.merge_format));
                match self.merge(&video_path, &audio_path, audio, &target, token).await {
                    Ok(()) => {
                        merged = true;
                        if target != video_path {
                            remove_transient(&video_path, &mut warnings).await;
                        }
                        final_path = target;
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!("Merge failed, keeping video-only file: {}", e);
                        warnings.push(DownloadWarning::new(WarningKind::Merge, e.to_string()));
                    }
                }
                remove_transient(&audio_path, &mut warnings).await;
            } else {
                warn!("Merge tool unavailable, keeping video-only file");
                warnings.push(DownloadWarning::new(
                    WarningKind::MergeUnavailable,
                    "audio track skipped: merge tool unavailable",
                ));
            }
        }

        if !merged {
            let target = dir.join(self.output_name(request, selection.video.extension()));
            if target != final_path {
                fs::rename(&final_path, &target).await?;
                final_path = target;
            }
        }

        self.write_sidecars(request, &selection, &dir, &final_path, token, &mut warnings)
            .await?;

        let size = fs::metadata(&final_path).await?.len();
        Ok(Artifact {
            path: final_path,
            size,
            warnings,
        })
    }

    /// Fetch one stream into `dest`. A `dest` left by an earlier attempt is
    /// complete, since files only get their final name once fully written.
    async fn fetch_stream(
        &self,
        stream: &Stream,
        dest: &Path,
        token: &CancellationToken,
        request: &DownloadRequest,
        emitter: &ProgressEmitter,
        tracker: &mut ProgressTracker,
    ) -> Result<u64, ArchiveError> {
        if let Ok(meta) = fs::metadata(dest).await {
            if meta.len() > 0 {
                debug!("{:?} already downloaded, skipping", dest);
                return Ok(meta.len());
            }
        }

        if stream.is_segmented {
            return self.fetch_segmented(stream, dest, token, tracker).await;
        }

        let emitter = emitter.clone();
        let video_id = request.video_id.clone();
        let worker_id = self.config.worker_id.clone();
        let callback: TransferCallback = Arc::new(move |transfer: TransferProgress| {
            let mut progress = DownloadProgress::new(&video_id, &worker_id, DownloadStatus::Downloading)
                .with_bytes(transfer.downloaded, transfer.total);
            progress.speed = format_speed(transfer.speed);
            progress.eta = transfer.eta;
            emitter.progress(progress);
        });

        self.transport
            .fetch_resumable(&stream.url, dest, stream.content_length, token, Some(&callback))
            .await
    }

    async fn fetch_segmented(
        &self,
        stream: &Stream,
        dest: &Path,
        token: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<u64, ArchiveError> {
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let stem = dest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());
        let scratch = dir.join(SEGMENTS_DIR).join(stem);

        info!(
            "Fetching {} segments for format {}",
            stream.segment_urls.len(),
            stream.format_id
        );
        tracker.set_total(0);
        let files = self
            .transport
            .fetch_segments(
                stream.init_segment_url.as_deref(),
                &stream.segment_urls,
                &scratch,
                stream.extension(),
                token,
                |index, count, bytes| tracker.fragment(index, count, bytes),
            )
            .await?;

        let size = self.join_segments(&files, dest, token).await?;

        if let Err(e) = fs::remove_dir_all(&scratch).await {
            warn!("Failed to remove segment directory {:?}: {}", scratch, e);
        }
        // only succeeds once every stream's scratch dir is gone
        let _ = fs::remove_dir(dir.join(SEGMENTS_DIR)).await;

        Ok(size)
    }

    /// Join segments with the merge tool, or byte by byte when it is
    /// unavailable or fails
    async fn join_segments(
        &self,
        files: &[PathBuf],
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<u64, ArchiveError> {
        if self.merger.is_available().await {
            let temp = temp_output(dest);
            match self
                .merger
                .concat(files, &temp, self.config.merge_timeout, token)
                .await
            {
                Ok(outcome) => {
                    if let Err(e) = fs::rename(&outcome.output, dest).await {
                        let _ = fs::remove_file(&outcome.output).await;
                        return Err(e.into());
                    }
                    return Ok(outcome.size);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Segment concat failed, joining raw bytes: {}", e),
            }
        }
        concat_raw(files, dest).await
    }

    /// Merge into `target` through a temporary file, so `target` may be one
    /// of the inputs
    async fn merge(
        &self,
        video: &Path,
        audio_path: &Path,
        audio: &Stream,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<(), ArchiveError> {
        let mode = if needs_audio_reencode(audio, &self.config.merge_format) {
            MergeMode::ReencodeAudio
        } else {
            MergeMode::Copy
        };

        let temp = temp_output(target);
        let outcome = self
            .merger
            .merge(video, audio_path, &temp, mode, self.config.merge_timeout, token)
            .await?;
        if let Err(e) = fs::rename(&outcome.output, target).await {
            let _ = fs::remove_file(&outcome.output).await;
            return Err(e.into());
        }
        info!("Merged into {:?} ({} bytes)", target, outcome.size);
        Ok(())
    }

    /// Thumbnail, metadata and subtitles. Failures become warnings; only
    /// cancellation aborts.
    async fn write_sidecars(
        &self,
        request: &DownloadRequest,
        selection: &Selection,
        dir: &Path,
        artifact: &Path,
        token: &CancellationToken,
        warnings: &mut Vec<DownloadWarning>,
    ) -> Result<(), ArchiveError> {
        if self.config.write_thumbnail {
            if let Some(url) = &request.thumbnail_url {
                match write_thumbnail(&self.transport, url, dir, token).await {
                    Ok(_) => {}
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!("Thumbnail download failed: {}", e);
                        warnings.push(DownloadWarning::new(WarningKind::Thumbnail, e.to_string()));
                    }
                }
            }
        }

        if self.config.write_metadata {
            let sidecar = MetadataSidecar::new(
                request,
                Some(Resolution::from_stream(&selection.video)),
                Some(artifact),
            );
            if let Err(e) = write_metadata(dir, &sidecar).await {
                warn!("Metadata write failed: {}", e);
                warnings.push(DownloadWarning::new(WarningKind::Metadata, e.to_string()));
            }
        }

        if self.config.write_subtitles && !request.subtitles.is_empty() {
            match write_subtitles(
                &self.transport,
                &request.subtitles,
                &self.config.subtitle_languages,
                dir,
                token,
            )
            .await
            {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("Subtitle download failed: {}", e);
                    warnings.push(DownloadWarning::new(WarningKind::Subtitles, e.to_string()));
                }
            }
        }

        Ok(())
    }
}

async fn remove_transient(path: &Path, warnings: &mut Vec<DownloadWarning>) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
            warnings.push(DownloadWarning::new(
                WarningKind::Cleanup,
                format!("{}: {}", path.display(), e),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::StreamType;
    use tempfile::TempDir;

    fn downloader(dir: &Path) -> Downloader {
        Downloader::new(Config::default().with_output_dir(dir)).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Downloader::new(Config::default().with_retries(0));
        assert!(matches!(result, Err(ArchiveError::Config(_))));
    }

    #[test]
    fn test_content_dir_layout() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader(dir.path());

        let request = DownloadRequest::new("vid", Vec::new()).with_channel("UC1", "Chan");
        assert_eq!(
            downloader.content_dir(&request),
            dir.path().join("channels/UC1/videos/vid")
        );

        let request = DownloadRequest::new("vid", Vec::new());
        assert_eq!(downloader.content_dir(&request), dir.path().join("videos/vid"));
    }

    #[test]
    fn test_output_name() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader(dir.path());

        let request = DownloadRequest::new("vid", Vec::new());
        assert_eq!(downloader.output_name(&request, "mp4"), "video.mp4");

        let request = request
            .with_channel("UC1", "Chan")
            .with_title("Pilot")
            .with_episode(3);
        assert_eq!(downloader.output_name(&request, "mkv"), "Chan-ep00003-Pilot.mkv");
    }

    #[tokio::test]
    async fn test_selection_error_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader(dir.path());
        let request = DownloadRequest::new("vid", Vec::new());

        let result = downloader.download(&CancellationToken::new(), &request).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(matches!(result.error, Some(ArchiveError::NoStreamsAvailable)));
    }

    #[tokio::test]
    async fn test_cancelled_download_stops() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader(dir.path());
        let stream = Stream::new("18", "http://127.0.0.1:9/v", "mp4", StreamType::Combined)
            .with_dimensions(640, 360);
        let request = DownloadRequest::new("vid", vec![stream]);
        let token = CancellationToken::new();
        token.cancel();

        let result = downloader.download(&token, &request).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(matches!(result.error, Some(ArchiveError::Cancelled)));
    }

    struct StalledSink;

    #[async_trait::async_trait]
    impl ProgressSink for StalledSink {
        async fn publish(&self, _progress: &DownloadProgress, _force: bool) -> Result<(), ArchiveError> {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_download_does_not_wait_for_stalled_sink() {
        let dir = TempDir::new().unwrap();
        let downloader = downloader(dir.path()).with_sink(Arc::new(StalledSink));
        let stream = Stream::new("18", "http://127.0.0.1:9/v", "mp4", StreamType::Combined)
            .with_dimensions(640, 360);
        let request = DownloadRequest::new("vid", vec![stream]);
        let token = CancellationToken::new();
        token.cancel();

        let started = Instant::now();
        let result = downloader.download(&token, &request).await;

        assert!(matches!(result.error, Some(ArchiveError::Cancelled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }
}
