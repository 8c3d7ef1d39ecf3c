//! HTTP transport: resumable single-URL transfers and segmented transfers

use crate::core::config::Config;
use crate::core::progress::{eta_string, SpeedWindow};
use crate::error::ArchiveError;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum spacing between two transfer progress callbacks
pub const TRANSFER_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Suffix of in-flight files
pub const PARTIAL_SUFFIX: &str = "part";

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Longest wait for the next body chunk
    pub read_timeout: Duration,
    /// Write buffer size
    pub chunk_size: usize,
    pub user_agent: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl TransportConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            chunk_size: config.chunk_size,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Sampled state of a running transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub downloaded: u64,
    /// 0 when the server did not declare a length
    pub total: u64,
    /// Rolling-average speed in bytes per second
    pub speed: f64,
    pub eta: String,
}

/// Transfer progress callback
pub type TransferCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

struct CounterState {
    downloaded: u64,
    last_bytes: u64,
    last_at: Instant,
    window: SpeedWindow,
}

/// Byte counter shared between the body reader and the progress path.
/// Speed is resampled at most once per second.
pub struct ByteCounter {
    total: u64,
    state: Mutex<CounterState>,
}

impl ByteCounter {
    /// Start counting from `offset` bytes already on disk
    pub fn new(offset: u64, total: u64) -> Self {
        Self::started_at(offset, total, Instant::now())
    }

    fn started_at(offset: u64, total: u64, at: Instant) -> Self {
        Self {
            total,
            state: Mutex::new(CounterState {
                downloaded: offset,
                last_bytes: offset,
                last_at: at,
                window: SpeedWindow::new(),
            }),
        }
    }

    /// Count `bytes` more; returns a sample when a second or more has passed
    /// since the previous one
    pub fn advance(&self, bytes: u64) -> Option<TransferProgress> {
        self.advance_at(bytes, Instant::now())
    }

    fn advance_at(&self, bytes: u64, now: Instant) -> Option<TransferProgress> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.downloaded += bytes;

        let elapsed = now.duration_since(state.last_at);
        if elapsed < TRANSFER_SAMPLE_INTERVAL {
            return None;
        }

        let speed = (state.downloaded - state.last_bytes) as f64 / elapsed.as_secs_f64();
        state.window.push(speed);
        state.last_bytes = state.downloaded;
        state.last_at = now;
        Some(self.progress(&state))
    }

    pub fn downloaded(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).downloaded
    }

    /// Current state without sampling
    pub fn snapshot(&self) -> TransferProgress {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.progress(&state)
    }

    fn progress(&self, state: &CounterState) -> TransferProgress {
        let speed = state.window.mean();
        TransferProgress {
            downloaded: state.downloaded,
            total: self.total,
            speed,
            eta: eta_string(speed, state.downloaded, self.total),
        }
    }
}

/// Path of the in-flight file for `dest` (`video.mp4` → `video.mp4.part`)
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

/// HTTP transport owned by one worker
pub struct Transport {
    client: Client,
    config: TransportConfig,
}

impl Transport {
    /// Build the HTTP client. Only connecting is bounded by a deadline;
    /// body reads are bounded per chunk by `read_timeout`.
    pub fn new(config: TransportConfig) -> Result<Self, ArchiveError> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Download `url` into `dest`, resuming from `dest.part` when present.
    ///
    /// `dest` only appears once the whole body is on disk. Returns the final
    /// file size.
    pub async fn fetch_resumable(
        &self,
        url: &str,
        dest: &Path,
        expected_len: u64,
        token: &CancellationToken,
        on_progress: Option<&TransferCallback>,
    ) -> Result<u64, ArchiveError> {
        let part = partial_path(dest);
        let mut offset = existing_len(&part).await?;

        if expected_len > 0 && offset > expected_len {
            warn!(
                "Partial file {:?} is larger than expected ({} > {}), restarting",
                part, offset, expected_len
            );
            fs::remove_file(&part).await?;
            offset = 0;
        }

        let (response, append) = loop {
            let mut request = self.client.get(url);
            if offset > 0 {
                info!("Resuming {:?} from byte {}", dest, offset);
                request = request.header(RANGE, format!("bytes={}-", offset));
            } else {
                info!("Starting download to {:?}", dest);
            }

            let response = self.send(request, token).await?;
            let status = response.status();
            debug!("Response status {} for {}", status, url);

            match status {
                StatusCode::PARTIAL_CONTENT if offset > 0 && range_start(&response) != Some(offset) => {
                    warn!(
                        "Server answered range {} from a different byte, restarting {:?} from zero",
                        offset, dest
                    );
                    drop(response);
                    fs::remove_file(&part).await?;
                    offset = 0;
                }
                StatusCode::PARTIAL_CONTENT => break (response, offset > 0),
                StatusCode::OK => {
                    if offset > 0 {
                        warn!("Server ignored range request, restarting {:?} from zero", dest);
                    }
                    break (response, false);
                }
                StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                    if expected_len > 0 && offset >= expected_len {
                        info!("Partial file {:?} already complete, finalizing", part);
                        fs::rename(&part, dest).await?;
                        return Ok(offset);
                    }
                    warn!("Range {} rejected, discarding partial file {:?}", offset, part);
                    let _ = fs::remove_file(&part).await;
                    return Err(ArchiveError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                _ => {
                    return Err(ArchiveError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    })
                }
            }
        };
        if !append {
            offset = 0;
        }

        let total = response_total(&response, offset).unwrap_or(expected_len);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&part)
            .await?;
        let counter = ByteCounter::new(offset, total);

        self.write_body(response, file, &counter, token, on_progress)
            .await?;

        let downloaded = counter.downloaded();
        if total > 0 && downloaded < total {
            return Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("body ended at byte {} of {}", downloaded, total),
            )));
        }
        if downloaded == 0 {
            let _ = fs::remove_file(&part).await;
            return Err(ArchiveError::Generic("Empty download (0 bytes)".to_string()));
        }

        fs::rename(&part, dest).await?;
        if let Some(callback) = on_progress {
            callback(counter.snapshot());
        }
        info!("Download completed: {} bytes", downloaded);
        Ok(downloaded)
    }

    /// Download `url` into `dest` without resuming. The body goes through
    /// `dest.part` and is renamed on success.
    pub async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<u64, ArchiveError> {
        let response = self.send(self.client.get(url), token).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let part = partial_path(dest);
        let total = response.content_length().unwrap_or(0);
        let file = File::create(&part).await?;
        let counter = ByteCounter::new(0, total);

        if let Err(e) = self.write_body(response, file, &counter, token, None).await {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }

        fs::rename(&part, dest).await?;
        Ok(counter.downloaded())
    }

    /// Fetch an init segment (if any) and then every media segment, strictly
    /// in order, into `dir`. Segments already on disk from an earlier attempt
    /// are kept. `on_segment(i, n, bytes_so_far)` runs after each media
    /// segment. Returns the files in playback order.
    pub async fn fetch_segments<F>(
        &self,
        init_url: Option<&str>,
        segment_urls: &[String],
        dir: &Path,
        ext: &str,
        token: &CancellationToken,
        mut on_segment: F,
    ) -> Result<Vec<PathBuf>, ArchiveError>
    where
        F: FnMut(usize, usize, u64),
    {
        fs::create_dir_all(dir).await?;

        let mut files = Vec::with_capacity(segment_urls.len() + 1);
        let mut bytes = 0u64;

        if let Some(url) = init_url {
            let path = dir.join(format!("init.{}", ext));
            bytes += self.fetch_segment(url, &path, token).await?;
            files.push(path);
        }

        let count = segment_urls.len();
        for (index, url) in segment_urls.iter().enumerate() {
            let path = dir.join(format!("seg_{:05}.{}", index + 1, ext));
            bytes += self.fetch_segment(url, &path, token).await?;
            files.push(path);
            on_segment(index + 1, count, bytes);
        }

        debug!("Fetched {} segment files ({} bytes) into {:?}", files.len(), bytes, dir);
        Ok(files)
    }

    async fn fetch_segment(
        &self,
        url: &str,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<u64, ArchiveError> {
        if let Ok(meta) = fs::metadata(path).await {
            debug!("Segment {:?} already present, skipping", path);
            return Ok(meta.len());
        }
        self.fetch_to_file(url, path, token).await
    }

    async fn send(
        &self,
        request: RequestBuilder,
        token: &CancellationToken,
    ) -> Result<Response, ArchiveError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ArchiveError::Cancelled),
            response = request.send() => Ok(response?),
        }
    }

    /// Stream the response body into `file`. Whatever arrived is flushed
    /// to disk even when the transfer fails, so a later attempt can resume.
    async fn write_body(
        &self,
        response: Response,
        file: File,
        counter: &ByteCounter,
        token: &CancellationToken,
        on_progress: Option<&TransferCallback>,
    ) -> Result<(), ArchiveError> {
        let mut writer = BufWriter::with_capacity(self.config.chunk_size, file);
        let result = self
            .pump(response, &mut writer, counter, token, on_progress)
            .await;

        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        result
    }

    async fn pump(
        &self,
        response: Response,
        writer: &mut BufWriter<File>,
        counter: &ByteCounter,
        token: &CancellationToken,
        on_progress: Option<&TransferCallback>,
    ) -> Result<(), ArchiveError> {
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ArchiveError::Cancelled),
                next = tokio::time::timeout(self.config.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(ArchiveError::Timeout(format!(
                        "no data for {:?} after {} bytes",
                        self.config.read_timeout,
                        counter.downloaded()
                    )))
                }
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };

            writer.write_all(&chunk).await?;
            if let Some(progress) = counter.advance(chunk.len() as u64) {
                if let Some(callback) = on_progress {
                    callback(progress);
                }
            }
        }
    }
}

async fn existing_len(path: &Path) -> Result<u64, ArchiveError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// First byte of a `Content-Range` answer ("bytes 5-12/13" gives 5)
fn range_start(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .trim()
        .strip_prefix("bytes")?
        .trim_start()
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Full resource length from `Content-Range` ("bytes 5-12/13"), or
/// `offset + Content-Length`
fn response_total(response: &Response, offset: u64) -> Option<u64> {
    if let Some(range) = response.headers().get(CONTENT_RANGE) {
        if let Some(total) = range
            .to_str()
            .ok()
            .and_then(|r| r.rsplit('/').next())
            .and_then(|t| t.trim().parse::<u64>().ok())
        {
            return Some(total);
        }
    }
    response.content_length().map(|len| offset + len)
}
