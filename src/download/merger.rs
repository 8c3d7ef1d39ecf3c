//! Merge orchestration over an external media tool

use crate::error::ArchiveError;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the audio track is carried into the merged output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Copy both tracks as they are
    Copy,
    /// Copy video, re-encode audio to AAC
    ReencodeAudio,
}

/// A finished merge-tool run
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub output: PathBuf,
    pub size: u64,
}

/// External media tool seam
#[async_trait]
pub trait MediaMerger: Send + Sync {
    /// Check if the tool can be run at all
    async fn is_available(&self) -> bool;

    /// Combine a video-only and an audio-only file into `output`
    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        mode: MergeMode,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError>;

    /// Join segment files, in order, into `output`
    async fn concat(
        &self,
        segments: &[PathBuf],
        output: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError>;

    /// Copy the audio track of `input` into `output`
    async fn extract_audio(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError>;

    /// Rewrite `input` into the container implied by `output`
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError>;
}

/// `MediaMerger` backed by the ffmpeg binary
pub struct FfmpegMerger {
    ffmpeg_path: PathBuf,
    available: OnceCell<bool>,
}

impl FfmpegMerger {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            available: OnceCell::new(),
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }

    async fn probe(&self) -> bool {
        let status = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                debug!("Found ffmpeg at {:?}", self.ffmpeg_path);
                true
            }
            Ok(status) => {
                warn!("ffmpeg at {:?} exited with {}", self.ffmpeg_path, status);
                false
            }
            Err(e) => {
                warn!("ffmpeg not available at {:?}: {}", self.ffmpeg_path, e);
                false
            }
        }
    }

    /// Run ffmpeg with `args` followed by `output`. The child is killed when
    /// the timeout elapses or the token fires.
    async fn run(
        &self,
        args: Vec<OsString>,
        output: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(&args)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {:?} {:?} {:?}", self.ffmpeg_path, args, output);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArchiveError::MergerUnavailable(format!("{:?}: {}", self.ffmpeg_path, e))
            } else {
                ArchiveError::Merge(format!("Failed to spawn ffmpeg: {}", e))
            }
        })?;

        let finished = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = fs::remove_file(output).await;
                return Err(ArchiveError::Cancelled);
            }
            finished = tokio::time::timeout(timeout, child.wait_with_output()) => finished,
        };

        let result = match finished {
            Err(_) => {
                let _ = fs::remove_file(output).await;
                return Err(ArchiveError::Timeout(format!(
                    "ffmpeg did not finish within {:?}",
                    timeout
                )));
            }
            Ok(result) => result?,
        };

        if !result.status.success() {
            let _ = fs::remove_file(output).await;
            let stderr = String::from_utf8_lossy(&result.stderr);
            let reason = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(ArchiveError::Merge(format!(
                "ffmpeg exited with {}: {}",
                result.status, reason
            )));
        }

        let size = fs::metadata(output).await?.len();
        if size == 0 {
            let _ = fs::remove_file(output).await;
            return Err(ArchiveError::Merge("ffmpeg produced an empty file".to_string()));
        }

        Ok(MergeOutcome {
            output: output.to_path_buf(),
            size,
        })
    }
}

#[async_trait]
impl MediaMerger for FfmpegMerger {
    async fn is_available(&self) -> bool {
        *self.available.get_or_init(|| self.probe()).await
    }

    async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        mode: MergeMode,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        info!("Merging {:?} + {:?} ({:?})", video, audio, mode);

        let mut args: Vec<OsString> = vec![
            "-i".into(),
            video.into(),
            "-i".into(),
            audio.into(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
        ];
        match mode {
            MergeMode::Copy => args.extend(["-c".into(), "copy".into()]),
            MergeMode::ReencodeAudio => args.extend([
                "-c:v".into(),
                "copy".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "192k".into(),
            ]),
        }
        if has_extension(output, "mp4") {
            args.extend(["-movflags".into(), "+faststart".into()]);
        }

        self.run(args, output, timeout, token).await
    }

    async fn concat(
        &self,
        segments: &[PathBuf],
        output: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        if segments.is_empty() {
            return Err(ArchiveError::Merge("no segments to concatenate".to_string()));
        }

        let list_path = output.with_extension("concat.txt");
        fs::write(&list_path, concat_list(segments)).await?;

        let args: Vec<OsString> = vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.clone().into(),
            "-c".into(),
            "copy".into(),
        ];
        let result = self.run(args, output, timeout, token).await;

        let _ = fs::remove_file(&list_path).await;
        result
    }

    async fn extract_audio(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        let args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-vn".into(),
            "-c:a".into(),
            "copy".into(),
        ];
        self.run(args, output, timeout, token).await
    }

    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<MergeOutcome, ArchiveError> {
        let args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-map".into(),
            "0".into(),
            "-c".into(),
            "copy".into(),
        ];
        self.run(args, output, timeout, token).await
    }
}

/// Temporary output for a merge whose destination is one of its inputs.
/// Keeps the extension so the tool still infers the container.
pub fn temp_output(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.extension() {
        Some(ext) => path.with_file_name(format!("{}.merging.{}", stem, ext.to_string_lossy())),
        None => path.with_file_name(format!("{}.merging", stem)),
    }
}

/// Concatenate files byte for byte into `output`. Only valid for formats
/// whose segments can be appended directly (MPEG-TS, fragmented MP4).
pub async fn concat_raw(parts: &[PathBuf], output: &Path) -> Result<u64, ArchiveError> {
    let part = crate::download::transport::partial_path(output);
    let mut writer = File::create(&part).await?;
    let mut total = 0u64;

    for path in parts {
        let mut reader = File::open(path).await?;
        total += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    writer.sync_all().await?;
    drop(writer);

    fs::rename(&part, output).await?;
    debug!("Concatenated {} files into {:?} ({} bytes)", parts.len(), output, total);
    Ok(total)
}

/// Concat demuxer list, one quoted `file` line per segment
fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_output_keeps_extension() {
        assert_eq!(
            temp_output(Path::new("/v/video.mp4")),
            PathBuf::from("/v/video.merging.mp4")
        );
        assert_eq!(temp_output(Path::new("/v/video")), PathBuf::from("/v/video.merging"));
    }

    #[test]
    fn test_concat_list_quotes_paths() {
        let list = concat_list(&[PathBuf::from("/tmp/a.ts"), PathBuf::from("/tmp/it's.ts")]);
        assert_eq!(list, "file '/tmp/a.ts'\nfile '/tmp/it'\\''s.ts'\n");
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let merger = FfmpegMerger::new("/nonexistent/ffmpeg-binary");
        assert!(!merger.is_available().await);
        // cached
        assert!(!merger.is_available().await);

        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let result = merger
            .merge(
                &dir.path().join("v.mp4"),
                &dir.path().join("a.m4a"),
                &dir.path().join("out.mp4"),
                MergeMode::Copy,
                Duration::from_secs(5),
                &token,
            )
            .await;
        assert!(matches!(result, Err(ArchiveError::MergerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_concat_raw_preserves_order() {
        let dir = TempDir::new().unwrap();
        let parts: Vec<PathBuf> = ["init", "seg1", "seg2"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let path = dir.path().join(name);
                std::fs::write(&path, format!("{}", i)).unwrap();
                path
            })
            .collect();
        let output = dir.path().join("video.mp4");

        let size = concat_raw(&parts, &output).await.unwrap();

        assert_eq!(size, 3);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "012");
        assert!(!dir.path().join("video.mp4.part").exists());
    }
}
