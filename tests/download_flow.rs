//! End-to-end download scenarios against a local HTTP server

use archivist::core::{
    Config, DownloadProgress, DownloadRequest, DownloadStatus, Downloader, StatusUpdate, Stream,
    StreamType, WarningKind,
};
use archivist::download::{MediaMerger, MergeMode, MergeOutcome};
use archivist::report::redis::{progress_key, ACTIVE_SET};
use archivist::report::{ProgressSink, ProgressStore, RedisProgressReporter};
use archivist::utils::MemoryStore;
use archivist::ArchiveError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PAYLOAD: &[u8] = b"hello, world!";

#[derive(Default)]
struct RecordingSink {
    progress: Mutex<Vec<DownloadProgress>>,
    statuses: Mutex<Vec<StatusUpdate>>,
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn publish(&self, progress: &DownloadProgress, _force: bool) -> Result<(), ArchiveError> {
        self.progress.lock().unwrap().push(progress.clone());
        Ok(())
    }

    async fn publish_status(&self, update: &StatusUpdate) -> Result<(), ArchiveError> {
        self.statuses.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// Merger that "merges" by concatenating its inputs, or always fails
struct FakeMerger {
    fail: bool,
}

#[async_trait]
impl MediaMerger for FakeMerger {
    async fn is_available(&self) -> bool {
        true
    }

    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        _mode: MergeMode,
        _timeout: Duration,
        _token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        if self.fail {
            return Err(ArchiveError::Merge("codec mismatch".to_string()));
        }
        let mut bytes = std::fs::read(video)?;
        bytes.extend(std::fs::read(audio)?);
        std::fs::write(output, &bytes)?;
        Ok(MergeOutcome {
            output: output.to_path_buf(),
            size: bytes.len() as u64,
        })
    }

    async fn concat(
        &self,
        _segments: &[PathBuf],
        _output: &Path,
        _timeout: Duration,
        _token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        Err(ArchiveError::Merge("concat not supported".to_string()))
    }

    async fn extract_audio(
        &self,
        _input: &Path,
        _output: &Path,
        _timeout: Duration,
        _token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        Err(ArchiveError::Merge("not supported".to_string()))
    }

    async fn remux(
        &self,
        _input: &Path,
        _output: &Path,
        _timeout: Duration,
        _token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        Err(ArchiveError::Merge("not supported".to_string()))
    }
}

fn config(dir: &Path) -> Config {
    Config::default()
        .with_output_dir(dir)
        .with_retries(3)
        .with_retry_delays(vec![Duration::from_millis(10)])
        .with_ffmpeg_path("/nonexistent/ffmpeg")
        .with_sidecars(false)
}

fn combined(url: String) -> Stream {
    Stream::new("22", url, "mp4", StreamType::Combined)
        .with_dimensions(1280, 720)
        .with_codecs("avc1.64001F", "mp4a.40.2")
        .with_content_length(PAYLOAD.len() as u64)
}

fn split_streams(base: &str) -> Vec<Stream> {
    vec![
        Stream::new("137", format!("{}/video", base), "mp4", StreamType::Video)
            .with_dimensions(1920, 1080)
            .with_codecs("avc1.640028", ""),
        Stream::new("140", format!("{}/audio", base), "m4a", StreamType::Audio)
            .with_codecs("", "mp4a.40.2")
            .with_bitrate(128_000),
    ]
}

#[tokio::test]
async fn test_fail_then_succeed_takes_two_attempts() {
    let mut server = mockito::Server::new_async().await;
    let failure = server
        .mock("GET", "/video")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/video")
        .with_status(200)
        .with_body(PAYLOAD)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let downloader = Downloader::new(config(dir.path())).unwrap().with_sink(sink.clone());
    let request = DownloadRequest::new("vid", vec![combined(format!("{}/video", server.url()))]);

    let result = downloader.download(&CancellationToken::new(), &request).await;

    failure.assert_async().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.file_size, 13);

    let path = result.file_path.unwrap();
    assert_eq!(path, dir.path().join("videos/vid/video.mp4"));
    assert_eq!(std::fs::read(&path).unwrap(), PAYLOAD);

    let progress = sink.progress.lock().unwrap();
    assert_eq!(progress.first().unwrap().status, DownloadStatus::Downloading);
    assert_eq!(progress.first().unwrap().percent, 0.0);
    let last = progress.last().unwrap();
    assert_eq!(last.status, DownloadStatus::Completed);
    assert_eq!(last.percent, 100.0);

    let statuses = sink.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, DownloadStatus::Completed);
    assert_eq!(statuses[0].file_size, Some(13));
}

#[tokio::test]
async fn test_persistent_failure_exhausts_attempts() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/video")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let downloader = Downloader::new(config(dir.path())).unwrap().with_sink(sink.clone());
    let request = DownloadRequest::new("vid", vec![combined(format!("{}/video", server.url()))]);

    let result = downloader.download(&CancellationToken::new(), &request).await;

    mock.assert_async().await;
    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert!(result.file_path.is_none());
    assert!(matches!(
        result.error,
        Some(ArchiveError::RetriesExhausted { attempts: 3, .. })
    ));
    assert!(!dir.path().join("videos/vid/video.mp4").exists());

    assert_eq!(
        sink.progress.lock().unwrap().last().unwrap().status,
        DownloadStatus::Error
    );
    let statuses = sink.statuses.lock().unwrap();
    assert_eq!(statuses[0].status, DownloadStatus::Error);
    assert!(statuses[0].error.as_deref().unwrap().contains("3 attempts"));
}

#[tokio::test]
async fn test_merge_tool_unavailable_keeps_video_only() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/video")
        .with_body(PAYLOAD)
        .create_async()
        .await;
    let audio = server.mock("GET", "/audio").expect(0).create_async().await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(config(dir.path())).unwrap();
    let request = DownloadRequest::new("vid", split_streams(&server.url()));

    let result = downloader.download(&CancellationToken::new(), &request).await;

    audio.assert_async().await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.has_warning(WarningKind::MergeUnavailable));
    assert_eq!(std::fs::read(result.file_path.unwrap()).unwrap(), PAYLOAD);
}

#[tokio::test]
async fn test_merge_failure_is_a_warning() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/video").with_body("VIDEO").create_async().await;
    server.mock("GET", "/audio").with_body("AUDIO").create_async().await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(config(dir.path()))
        .unwrap()
        .with_merger(Arc::new(FakeMerger { fail: true }));
    let request = DownloadRequest::new("vid", split_streams(&server.url()));

    let result = downloader.download(&CancellationToken::new(), &request).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.attempts, 1);
    assert!(result.has_warning(WarningKind::Merge));

    let content_dir = dir.path().join("videos/vid");
    assert_eq!(std::fs::read(content_dir.join("video.mp4")).unwrap(), b"VIDEO");
    assert!(!content_dir.join("audio.m4a").exists());
}

#[tokio::test]
async fn test_merge_into_canonical_name() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/video").with_body("VIDEO").create_async().await;
    server.mock("GET", "/audio").with_body("AUDIO").create_async().await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(config(dir.path()))
        .unwrap()
        .with_merger(Arc::new(FakeMerger { fail: false }));
    let request = DownloadRequest::new("vid", split_streams(&server.url()))
        .with_channel("UC1", "Chan")
        .with_title("Pilot")
        .with_episode(7);

    let result = downloader.download(&CancellationToken::new(), &request).await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);

    let content_dir = dir.path().join("channels/UC1/videos/vid");
    let path = result.file_path.unwrap();
    assert_eq!(path, content_dir.join("Chan-ep00007-Pilot.mp4"));
    assert_eq!(std::fs::read(&path).unwrap(), b"VIDEOAUDIO");
    assert!(!content_dir.join("video.mp4").exists());
    assert!(!content_dir.join("audio.m4a").exists());
}

#[tokio::test]
async fn test_merge_in_place_goes_through_temp_file() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/video").with_body("VIDEO").create_async().await;
    server.mock("GET", "/audio").with_body("AUDIO").create_async().await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(config(dir.path()))
        .unwrap()
        .with_merger(Arc::new(FakeMerger { fail: false }));
    let request = DownloadRequest::new("vid", split_streams(&server.url()));

    let result = downloader.download(&CancellationToken::new(), &request).await;

    let content_dir = dir.path().join("videos/vid");
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.file_path.unwrap(), content_dir.join("video.mp4"));
    assert_eq!(std::fs::read(content_dir.join("video.mp4")).unwrap(), b"VIDEOAUDIO");
    assert!(!content_dir.join("video.merging.mp4").exists());
}

#[tokio::test]
async fn test_failed_rename_removes_merge_output() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/video").with_body("VIDEO").create_async().await;
    server.mock("GET", "/audio").with_body("AUDIO").create_async().await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(config(dir.path()))
        .unwrap()
        .with_merger(Arc::new(FakeMerger { fail: false }));
    let request = DownloadRequest::new("vid", split_streams(&server.url()))
        .with_channel("UC1", "Chan")
        .with_title("Pilot")
        .with_episode(1);

    // a non-empty directory squatting on the final name makes the rename fail
    let content_dir = dir.path().join("channels/UC1/videos/vid");
    let blocker = content_dir.join("Chan-ep00001-Pilot.mp4");
    std::fs::create_dir_all(blocker.join("inner")).unwrap();

    let result = downloader.download(&CancellationToken::new(), &request).await;

    assert!(!result.success);
    let leftovers: Vec<String> = std::fs::read_dir(&content_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".merging."))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[tokio::test]
async fn test_resume_from_partial_file() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/video")
        .match_header("range", "bytes=5-")
        .with_status(206)
        .with_header("content-range", "bytes 5-12/13")
        .with_body(&PAYLOAD[5..])
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let content_dir = dir.path().join("videos/vid");
    std::fs::create_dir_all(&content_dir).unwrap();
    std::fs::write(content_dir.join("video.mp4.part"), &PAYLOAD[..5]).unwrap();

    let downloader = Downloader::new(config(dir.path())).unwrap();
    let request = DownloadRequest::new("vid", vec![combined(format!("{}/video", server.url()))]);

    let result = downloader.download(&CancellationToken::new(), &request).await;

    mock.assert_async().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(std::fs::read(content_dir.join("video.mp4")).unwrap(), PAYLOAD);
    assert!(!content_dir.join("video.mp4.part").exists());
}

#[tokio::test]
async fn test_segmented_stream_joins_raw_in_order() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/init").with_body("I").create_async().await;
    server.mock("GET", "/s1").with_body("A").create_async().await;
    server.mock("GET", "/s2").with_body("B").create_async().await;

    let base = server.url();
    let stream = Stream::new("299", "", "mp4", StreamType::Combined)
        .with_dimensions(1920, 1080)
        .with_segments(
            Some(format!("{}/init", base)),
            vec![format!("{}/s1", base), format!("{}/s2", base)],
        );

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let downloader = Downloader::new(config(dir.path())).unwrap().with_sink(sink.clone());
    let request = DownloadRequest::new("vid", vec![stream]);

    let result = downloader.download(&CancellationToken::new(), &request).await;

    let content_dir = dir.path().join("videos/vid");
    assert!(result.success, "{:?}", result.error);
    assert_eq!(std::fs::read(content_dir.join("video.mp4")).unwrap(), b"IAB");
    assert!(!content_dir.join(".segments").exists());

    let labels: Vec<String> = sink
        .progress
        .lock()
        .unwrap()
        .iter()
        .filter_map(|p| p.fragment.clone())
        .collect();
    // back-to-back fragment records may collapse, the last one always survives
    assert_eq!(labels.last().map(String::as_str), Some("2/2"));
    assert!(labels.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_sidecars_and_thumbnail_warning() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/video").with_body(PAYLOAD).create_async().await;
    server.mock("GET", "/thumb.jpg").with_status(404).create_async().await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(config(dir.path()).with_sidecars(true)).unwrap();
    let mut request = DownloadRequest::new("vid", vec![combined(format!("{}/video", server.url()))])
        .with_title("A title");
    request.thumbnail_url = Some(format!("{}/thumb.jpg", server.url()));

    let result = downloader.download(&CancellationToken::new(), &request).await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.has_warning(WarningKind::Thumbnail));
    assert!(!result.has_warning(WarningKind::Metadata));

    let metadata: serde_json::Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("videos/vid/metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["title"], "A title");
    assert_eq!(metadata["selected"]["label"], "720p");
}

#[tokio::test]
async fn test_cache_reporter_clears_active_set() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/video").with_body(PAYLOAD).create_async().await;

    let store = MemoryStore::new();
    let reporter = Arc::new(RedisProgressReporter::new(Arc::new(store.clone())));

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(config(dir.path())).unwrap().with_sink(reporter.clone());
    let request = DownloadRequest::new("vid", vec![combined(format!("{}/video", server.url()))]);

    let result = downloader.download(&CancellationToken::new(), &request).await;

    assert!(result.success, "{:?}", result.error);
    assert!(store.set_members(ACTIVE_SET).await.unwrap().is_empty());
    assert!(store.exists(&progress_key("vid")).await.unwrap());

    let stored = reporter.fetch("vid").await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
    assert_eq!(stored.percent, 100.0);
    assert_eq!(stored.downloaded, 13);
}
