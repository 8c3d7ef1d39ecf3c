//! Stream selection

use crate::core::media::{Stream, StreamType};
use crate::error::ArchiveError;
use std::cmp::Ordering;

/// Streams chosen for one download
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Video-bearing stream (combined or video-only)
    pub video: Stream,
    /// Audio companion, present only when `video` is video-only
    pub audio: Option<Stream>,
}

impl Selection {
    /// Check if the selection needs a merge step
    pub fn needs_merge(&self) -> bool {
        self.audio.is_some()
    }
}

/// Picks the best (video, audio) pair from a stream catalog
#[derive(Debug, Clone)]
pub struct StreamSelector {
    /// Tallest acceptable video stream
    pub max_height: u32,
    /// Take a combined stream whenever one exists
    pub prefer_combined: bool,
    /// Container ranked first among otherwise equal streams
    pub preferred_container: String,
}

impl Default for StreamSelector {
    fn default() -> Self {
        Self {
            max_height: u32::MAX,
            prefer_combined: false,
            preferred_container: "mp4".to_string(),
        }
    }
}

impl StreamSelector {
    pub fn new(max_height: u32, prefer_combined: bool) -> Self {
        Self {
            max_height,
            prefer_combined,
            ..Self::default()
        }
    }

    /// Set the preferred container
    pub fn with_container(mut self, container: &str) -> Self {
        self.preferred_container = container.trim_start_matches('.').to_lowercase();
        self
    }

    /// Select the best stream combination.
    ///
    /// A combined stream wins outright when `prefer_combined` is set: a caller
    /// without a merge tool must never end up with a silent video-only file,
    /// however tall. Otherwise the video-only stream is taken only when it is
    /// strictly taller than the best combined one.
    pub fn select(&self, streams: &[Stream]) -> Result<Selection, ArchiveError> {
        if streams.is_empty() {
            return Err(ArchiveError::NoStreamsAvailable);
        }

        let combined = self.best_video(streams, StreamType::Combined);
        let video_only = self.best_video(streams, StreamType::Video);
        let audio = best_audio(streams);

        if self.prefer_combined {
            if let Some(combined) = combined {
                return Ok(Selection {
                    video: combined.clone(),
                    audio: None,
                });
            }
        }

        match (video_only, combined) {
            (Some(video), Some(combined)) if video.height > combined.height => Ok(Selection {
                video: video.clone(),
                audio: audio.cloned(),
            }),
            (_, Some(combined)) => Ok(Selection {
                video: combined.clone(),
                audio: None,
            }),
            (Some(video), None) => Ok(Selection {
                video: video.clone(),
                audio: audio.cloned(),
            }),
            (None, None) => Err(ArchiveError::NoSuitableStream),
        }
    }

    /// Best video-bearing stream of one type under the height cap
    pub fn best_video<'a>(&self, streams: &'a [Stream], stream_type: StreamType) -> Option<&'a Stream> {
        let mut candidates: Vec<&Stream> = streams
            .iter()
            .filter(|s| s.stream_type == stream_type)
            .filter(|s| s.is_usable() && s.has_video())
            .filter(|s| s.height <= self.max_height)
            .collect();

        candidates.sort_by(|a, b| self.compare_video(a, b));
        candidates.first().copied()
    }

    /// Codec compatibility, then container, then height and bitrate descending
    fn compare_video(&self, a: &Stream, b: &Stream) -> Ordering {
        video_codec_rank(&a.video_codec)
            .cmp(&video_codec_rank(&b.video_codec))
            .then_with(|| self.container_rank(&a.ext).cmp(&self.container_rank(&b.ext)))
            .then_with(|| b.height.cmp(&a.height))
            .then_with(|| b.bitrate.cmp(&a.bitrate))
    }

    fn container_rank(&self, ext: &str) -> u8 {
        let ext = ext.trim_start_matches('.').to_lowercase();
        if ext == self.preferred_container {
            0
        } else {
            match ext.as_str() {
                "mp4" => 1,
                "webm" => 2,
                _ => 3,
            }
        }
    }
}

/// Best audio-only stream: codec preference, then bitrate descending
pub fn best_audio(streams: &[Stream]) -> Option<&Stream> {
    let mut candidates: Vec<&Stream> = streams
        .iter()
        .filter(|s| s.stream_type == StreamType::Audio && s.is_usable())
        .collect();

    candidates.sort_by(|a, b| {
        audio_codec_rank(&a.audio_codec)
            .cmp(&audio_codec_rank(&b.audio_codec))
            .then_with(|| b.bitrate.cmp(&a.bitrate))
    });
    candidates.first().copied()
}

/// Lower is more widely playable
fn video_codec_rank(codec: &str) -> u8 {
    let codec = codec.to_lowercase();
    if codec.starts_with("avc1") || codec.starts_with("h264") {
        0
    } else if codec.starts_with("vp9") || codec.starts_with("vp09") {
        1
    } else if codec.starts_with("av01") {
        2
    } else {
        3
    }
}

fn audio_codec_rank(codec: &str) -> u8 {
    let codec = codec.to_lowercase();
    if codec.starts_with("mp4a") || codec.starts_with("aac") {
        0
    } else if codec.starts_with("opus") {
        1
    } else {
        2
    }
}

/// Check if an audio stream must be re-encoded to fit the output container
pub fn needs_audio_reencode(audio: &Stream, container: &str) -> bool {
    let container = container.trim_start_matches('.').to_lowercase();
    container == "mp4" && audio_codec_rank(&audio.audio_codec) != 0
}
