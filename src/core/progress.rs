//! Progress records, throughput estimation and throttled tracking

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of speed samples averaged for display
pub const SPEED_WINDOW: usize = 5;

/// Minimum spacing between two `downloading` events from a tracker
pub const TRACKER_THROTTLE: Duration = Duration::from_millis(500);

/// Lifecycle status of a download as seen by progress consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Processing,
    Completed,
    Error,
}

impl DownloadStatus {
    /// Check if the download is still running
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Downloading | DownloadStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Processing => "processing",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress record published to the controller and the shared cache.
/// Both paths serialize this exact shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub video_id: String,
    pub worker_id: String,
    pub status: DownloadStatus,
    /// Percentage in [0, 100]
    pub percent: f64,
    pub downloaded: u64,
    pub total: u64,
    pub speed: String,
    pub eta: String,
    /// "i/n" label for segmented transfers, `null` otherwise
    #[serde(default)]
    pub fragment: Option<String>,
    /// Seconds since the Unix epoch
    pub updated_at: i64,
}

impl DownloadProgress {
    /// Create an empty record with the given status
    pub fn new(video_id: &str, worker_id: &str, status: DownloadStatus) -> Self {
        Self {
            video_id: video_id.to_string(),
            worker_id: worker_id.to_string(),
            status,
            percent: 0.0,
            downloaded: 0,
            total: 0,
            speed: String::new(),
            eta: String::new(),
            fragment: None,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Set byte counters and derive the percentage
    pub fn with_bytes(mut self, downloaded: u64, total: u64) -> Self {
        self.downloaded = downloaded;
        self.total = total;
        self.percent = percent_of(downloaded, total);
        self
    }

    /// Force the percentage, clamped to [0, 100]
    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = clamp_percent(percent);
        self
    }

    pub fn with_fragment(mut self, index: usize, count: usize) -> Self {
        self.fragment = Some(format!("{}/{}", index, count));
        self
    }
}

/// Final status pushed to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub video_id: String,
    pub worker_id: String,
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub updated_at: i64,
}

impl StatusUpdate {
    pub fn new(video_id: &str, worker_id: &str, status: DownloadStatus) -> Self {
        Self {
            video_id: video_id.to_string(),
            worker_id: worker_id.to_string(),
            status,
            error: None,
            file_path: None,
            file_size: None,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Bounded rolling window of throughput samples
#[derive(Debug, Clone, Default)]
pub struct SpeedWindow {
    samples: VecDeque<f64>,
}

impl SpeedWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SPEED_WINDOW),
        }
    }

    /// Record a bytes-per-second sample, evicting the oldest past the window
    pub fn push(&mut self, bytes_per_second: f64) {
        if self.samples.len() == SPEED_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(bytes_per_second.max(0.0));
    }

    /// Arithmetic mean of the window, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Callback receiving tracker output
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Throttled speed/ETA estimator driving a progress callback
pub struct ProgressTracker {
    video_id: String,
    worker_id: String,
    total: u64,
    callback: ProgressCallback,
    started: Instant,
    downloaded: u64,
    last_sample: Option<(Instant, u64)>,
    last_emit: Option<Instant>,
    window: SpeedWindow,
    instant_speed: f64,
}

impl ProgressTracker {
    /// Create a tracker for a transfer of `total` bytes (0 when unknown)
    pub fn new(video_id: &str, worker_id: &str, total: u64, callback: ProgressCallback) -> Self {
        Self {
            video_id: video_id.to_string(),
            worker_id: worker_id.to_string(),
            total,
            callback,
            started: Instant::now(),
            downloaded: 0,
            last_sample: None,
            last_emit: None,
            window: SpeedWindow::new(),
            instant_speed: 0.0,
        }
    }

    /// Adjust the expected total, e.g. once a response declares its length
    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Last instantaneous throughput in bytes per second
    pub fn instant_speed(&self) -> f64 {
        self.instant_speed
    }

    /// Rolling-average throughput in bytes per second
    pub fn average_speed(&self) -> f64 {
        self.window.mean()
    }

    /// Record a sample and emit a `downloading` event unless the previous
    /// event went out less than 500ms ago. Returns whether the callback ran.
    pub fn update(&mut self, downloaded: u64) -> bool {
        let now = Instant::now();
        self.sample(now, downloaded);

        if let Some(last) = self.last_emit {
            if now.duration_since(last) < TRACKER_THROTTLE {
                return false;
            }
        }

        self.last_emit = Some(now);
        (self.callback)(self.snapshot(DownloadStatus::Downloading));
        true
    }

    /// Emit a fragment-labelled event immediately
    pub fn fragment(&mut self, index: usize, count: usize, downloaded: u64) {
        let now = Instant::now();
        self.sample(now, downloaded);
        self.last_emit = Some(now);

        let mut progress = self.snapshot(DownloadStatus::Downloading);
        if self.total == 0 && count > 0 {
            progress.percent = clamp_percent(index as f64 * 100.0 / count as f64);
        }
        (self.callback)(progress.with_fragment(index, count));
    }

    /// Emit a `processing` event immediately
    pub fn processing(&mut self) {
        self.last_emit = Some(Instant::now());
        (self.callback)(self.snapshot(DownloadStatus::Processing));
    }

    /// Emit the terminal `completed` event
    pub fn complete(&mut self) {
        if self.total == 0 {
            self.total = self.downloaded;
        }
        self.downloaded = self.total;
        let mut progress = self.snapshot(DownloadStatus::Completed);
        progress.percent = 100.0;
        progress.eta = format_eta(Duration::ZERO);
        (self.callback)(progress);
    }

    /// Emit the terminal `error` event
    pub fn error(&mut self) {
        let mut progress = self.snapshot(DownloadStatus::Error);
        progress.eta = String::new();
        (self.callback)(progress);
    }

    fn sample(&mut self, now: Instant, downloaded: u64) {
        if let Some((at, bytes)) = self.last_sample {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 && downloaded >= bytes {
                self.instant_speed = (downloaded - bytes) as f64 / elapsed;
                self.window.push(self.instant_speed);
            }
        } else {
            let elapsed = now.duration_since(self.started).as_secs_f64();
            if elapsed > 0.0 && downloaded > 0 {
                self.instant_speed = downloaded as f64 / elapsed;
                self.window.push(self.instant_speed);
            }
        }
        self.last_sample = Some((now, downloaded));
        self.downloaded = downloaded;
    }

    fn snapshot(&self, status: DownloadStatus) -> DownloadProgress {
        let speed = self.window.mean();
        let mut progress = DownloadProgress::new(&self.video_id, &self.worker_id, status)
            .with_bytes(self.downloaded, self.total);
        progress.speed = format_speed(speed);
        progress.eta = eta_string(speed, self.downloaded, self.total);
        progress
    }
}

/// Percentage of `downloaded` over `total`, 0 when the total is unknown
pub fn percent_of(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    clamp_percent(downloaded as f64 * 100.0 / total as f64)
}

/// Clamp into [0, 100], mapping NaN to 0
pub fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// ETA string from a mean speed and byte counters, "Unknown" when not computable
pub fn eta_string(bytes_per_second: f64, downloaded: u64, total: u64) -> String {
    if bytes_per_second <= 0.0 || total == 0 {
        return "Unknown".to_string();
    }
    let remaining = total.saturating_sub(downloaded);
    format_eta(Duration::from_secs_f64(remaining as f64 / bytes_per_second))
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exp = (bytes_f64.ln() / THRESHOLD.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    let value = bytes_f64 / THRESHOLD.powi(exp as i32);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.1} {}", value, UNITS[exp])
    }
}

/// Format bytes per second as human-readable string
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}

/// Format an ETA as `HH:MM:SS` from one hour up, `MM:SS` below
pub fn format_eta(eta: Duration) -> String {
    let total_seconds = eta.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Format elapsed time as a short human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    if total_seconds < 60 {
        format!("{}s", total_seconds)
    } else if total_seconds < 3600 {
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        if seconds == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m {}s", minutes, seconds)
        }
    } else {
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        if minutes == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, minutes)
        }
    }
}
