//! Best-effort companion files written next to the media artifact

use crate::core::media::{DownloadRequest, Resolution, SubtitleTrack};
use crate::download::transport::Transport;
use crate::error::ArchiveError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const METADATA_FILE: &str = "metadata.json";

/// Thumbnail name in the content directory, whatever format the host serves
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

/// Contents of `metadata.json`
#[derive(Debug, Serialize)]
pub struct MetadataSidecar<'a> {
    pub video_id: &'a str,
    pub channel_id: Option<&'a str>,
    pub channel_name: Option<&'a str>,
    pub title: &'a str,
    pub description: &'a str,
    pub duration: u64,
    pub upload_date: Option<&'a str>,
    pub view_count: Option<u64>,
    pub episode: Option<u32>,
    pub thumbnail_url: Option<&'a str>,
    /// Resolution actually downloaded
    pub selected: Option<Resolution>,
    pub resolutions: Vec<Resolution>,
    pub file_name: Option<String>,
    pub archived_at: String,
}

impl<'a> MetadataSidecar<'a> {
    pub fn new(request: &'a DownloadRequest, selected: Option<Resolution>, file: Option<&Path>) -> Self {
        Self {
            video_id: &request.video_id,
            channel_id: request.channel_id.as_deref(),
            channel_name: request.channel_name.as_deref(),
            title: &request.title,
            description: &request.description,
            duration: request.duration,
            upload_date: request.upload_date.as_deref(),
            view_count: request.view_count,
            episode: request.episode,
            thumbnail_url: request.thumbnail_url.as_deref(),
            selected,
            resolutions: request.available_resolutions(),
            file_name: file
                .and_then(|f| f.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            archived_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Write `metadata.json` into `dir`
pub async fn write_metadata(dir: &Path, sidecar: &MetadataSidecar<'_>) -> Result<PathBuf, ArchiveError> {
    let path = dir.join(METADATA_FILE);
    let json = serde_json::to_vec_pretty(sidecar)?;
    fs::write(&path, json).await?;
    debug!("Wrote metadata to {:?}", path);
    Ok(path)
}

/// Download the thumbnail into `dir` as [`THUMBNAIL_FILE`]
pub async fn write_thumbnail(
    transport: &Transport,
    url: &str,
    dir: &Path,
    token: &CancellationToken,
) -> Result<PathBuf, ArchiveError> {
    let path = dir.join(THUMBNAIL_FILE);
    let size = transport.fetch_to_file(url, &path, token).await?;
    info!("Saved thumbnail {:?} ({} bytes)", path, size);
    Ok(path)
}

/// Download each subtitle track whose language is in `languages`
/// as `subtitles.{lang}.vtt`. Stops at the first failure.
pub async fn write_subtitles(
    transport: &Transport,
    tracks: &[SubtitleTrack],
    languages: &[String],
    dir: &Path,
    token: &CancellationToken,
) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut written = Vec::new();
    for track in wanted_tracks(tracks, languages) {
        let path = dir.join(format!("subtitles.{}.vtt", track.language));
        transport.fetch_to_file(&track.url, &path, token).await?;
        written.push(path);
    }
    if !written.is_empty() {
        info!("Saved {} subtitle track(s)", written.len());
    }
    Ok(written)
}

fn wanted_tracks<'a>(tracks: &'a [SubtitleTrack], languages: &'a [String]) -> impl Iterator<Item = &'a SubtitleTrack> {
    tracks.iter().filter(move |track| {
        languages
            .iter()
            .any(|lang| lang.eq_ignore_ascii_case(&track.language))
    })
}
