//! Stream catalog, download request and result structures

use crate::error::ArchiveError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// Video track only, needs an audio companion
    Video,
    /// Audio track only
    Audio,
    /// Audio and video in one resource
    Combined,
}

/// One candidate network stream for a piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    /// Upstream format identifier (itag)
    pub format_id: String,
    /// Direct resource URL, empty for segmented streams
    #[serde(default)]
    pub url: String,
    /// Container extension (e.g. "mp4", "webm", "m4a")
    pub ext: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Bitrate in bits per second
    #[serde(default)]
    pub bitrate: u64,
    /// Declared size in bytes, 0 when unknown
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub video_codec: String,
    #[serde(default)]
    pub audio_codec: String,
    pub stream_type: StreamType,
    #[serde(default)]
    pub is_segmented: bool,
    /// Ordered media segment URLs
    #[serde(default)]
    pub segment_urls: Vec<String>,
    /// Initialization segment, fetched before the media segments
    #[serde(default)]
    pub init_segment_url: Option<String>,
}

impl Stream {
    /// Create a progressive (single URL) stream
    pub fn new(
        format_id: impl Into<String>,
        url: impl Into<String>,
        ext: impl Into<String>,
        stream_type: StreamType,
    ) -> Self {
        Self {
            format_id: format_id.into(),
            url: url.into(),
            ext: ext.into(),
            width: 0,
            height: 0,
            bitrate: 0,
            content_length: 0,
            video_codec: String::new(),
            audio_codec: String::new(),
            stream_type,
            is_segmented: false,
            segment_urls: Vec::new(),
            init_segment_url: None,
        }
    }

    /// Set frame dimensions
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set bitrate
    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set codecs; pass an empty string for an absent track
    pub fn with_codecs(mut self, video_codec: &str, audio_codec: &str) -> Self {
        self.video_codec = video_codec.to_string();
        self.audio_codec = audio_codec.to_string();
        self
    }

    /// Set declared content length
    pub fn with_content_length(mut self, content_length: u64) -> Self {
        self.content_length = content_length;
        self
    }

    /// Turn this stream into a segmented one
    pub fn with_segments(mut self, init: Option<String>, segments: Vec<String>) -> Self {
        self.is_segmented = true;
        self.init_segment_url = init;
        self.segment_urls = segments;
        self
    }

    /// A stream is usable when it has a URL or at least one segment
    pub fn is_usable(&self) -> bool {
        if self.is_segmented {
            !self.segment_urls.is_empty()
        } else {
            !self.url.is_empty()
        }
    }

    /// Check if the stream carries picture; zero height never does
    pub fn has_video(&self) -> bool {
        self.height > 0 && matches!(self.stream_type, StreamType::Video | StreamType::Combined)
    }

    pub fn has_audio(&self) -> bool {
        matches!(self.stream_type, StreamType::Audio | StreamType::Combined)
    }

    /// Human-readable quality label
    pub fn quality_label(&self) -> String {
        if self.height > 0 {
            format!("{}p", self.height)
        } else if self.has_audio() {
            format!("audio {}", self.bitrate_string())
        } else {
            "Unknown".to_string()
        }
    }

    /// Get human-readable bitrate string
    pub fn bitrate_string(&self) -> String {
        if self.bitrate > 0 {
            format!("{} kbps", self.bitrate / 1000)
        } else {
            "Unknown".to_string()
        }
    }

    /// Extension without leading dot, defaulting to mp4
    pub fn extension(&self) -> &str {
        let ext = self.ext.trim_start_matches('.');
        if ext.is_empty() {
            "mp4"
        } else {
            ext
        }
    }
}

/// A subtitle track offered by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    /// Language code (e.g. "en")
    pub language: String,
    /// WebVTT resource URL
    pub url: String,
}

/// One available resolution, as written to the metadata sidecar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub height: u32,
    pub width: u32,
    pub label: String,
    pub format_id: String,
    pub has_audio: bool,
}

impl Resolution {
    /// Build the resolution entry for a video-bearing stream
    pub fn from_stream(stream: &Stream) -> Self {
        Self {
            height: stream.height,
            width: stream.width,
            label: format!("{}p", stream.height),
            format_id: stream.format_id.clone(),
            has_audio: stream.has_audio(),
        }
    }

    /// Derive the resolution ladder from a stream catalog, tallest first,
    /// one entry per height. A combined stream wins over a video-only one
    /// at the same height.
    pub fn ladder(streams: &[Stream]) -> Vec<Resolution> {
        let mut candidates: Vec<&Stream> = streams.iter().filter(|s| s.has_video()).collect();
        candidates.sort_by(|a, b| {
            b.height
                .cmp(&a.height)
                .then_with(|| b.has_audio().cmp(&a.has_audio()))
                .then_with(|| b.bitrate.cmp(&a.bitrate))
        });
        candidates.dedup_by_key(|s| s.height);
        candidates.into_iter().map(Resolution::from_stream).collect()
    }
}

/// Everything needed to archive one piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Content id on the platform
    pub video_id: String,
    /// Parent collection (channel) id
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Display name of the parent collection
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Duration in seconds
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub view_count: Option<u64>,
    /// Episode number within the collection
    #[serde(default)]
    pub episode: Option<u32>,
    pub streams: Vec<Stream>,
    /// Precomputed resolution ladder
    #[serde(default)]
    pub resolutions: Option<Vec<Resolution>>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
}

impl DownloadRequest {
    /// Create a request with no metadata
    pub fn new(video_id: impl Into<String>, streams: Vec<Stream>) -> Self {
        Self {
            video_id: video_id.into(),
            channel_id: None,
            channel_name: None,
            title: String::new(),
            description: String::new(),
            duration: 0,
            upload_date: None,
            thumbnail_url: None,
            view_count: None,
            episode: None,
            streams,
            resolutions: None,
            subtitles: Vec::new(),
        }
    }

    /// Set parent collection
    pub fn with_channel(mut self, channel_id: &str, channel_name: &str) -> Self {
        self.channel_id = Some(channel_id.to_string());
        self.channel_name = Some(channel_name.to_string());
        self
    }

    /// Set title
    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    /// Set episode number
    pub fn with_episode(mut self, episode: u32) -> Self {
        self.episode = Some(episode);
        self
    }

    /// Resolution ladder, precomputed or derived from the streams
    pub fn available_resolutions(&self) -> Vec<Resolution> {
        match &self.resolutions {
            Some(list) => list.clone(),
            None => Resolution::ladder(&self.streams),
        }
    }
}

/// Category of a non-fatal problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Thumbnail,
    Metadata,
    Subtitles,
    Merge,
    MergeUnavailable,
    Cleanup,
}

/// A side step that failed without failing the download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl DownloadWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one `Downloader::download` call
#[derive(Debug)]
pub struct DownloadResult {
    pub success: bool,
    /// Attempts consumed, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
    pub file_path: Option<PathBuf>,
    pub file_size: u64,
    pub error: Option<ArchiveError>,
    /// Degraded-but-successful notes from the winning attempt
    pub warnings: Vec<DownloadWarning>,
}

impl DownloadResult {
    /// Check if a side step of the given kind was degraded
    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }
}
