//! Download engine configuration

use crate::error::ArchiveError;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix shared by every environment variable read by [`Config::from_env`]
pub const ENV_PREFIX: &str = "ARCHIVIST_";

/// Delay used when the retry delay table is empty
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Download engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for archived content
    pub output_dir: PathBuf,
    /// Tallest video stream to consider
    pub max_height: u32,
    /// Subtitle languages to fetch
    pub subtitle_languages: Vec<String>,
    pub write_thumbnail: bool,
    pub write_metadata: bool,
    pub write_subtitles: bool,
    /// Container for merged output (e.g. "mp4", "mkv")
    pub merge_format: String,
    /// Total attempts per download
    pub retries: u32,
    /// Backoff before attempt k+1 is `retry_delays[k-1]`, clamped to the last entry
    pub retry_delays: Vec<Duration>,
    /// Take a combined stream over a taller stream that needs merging
    pub prefer_combined: bool,
    /// Write buffer size for transfers
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two body chunks
    pub read_timeout: Duration,
    /// External codec tool
    pub ffmpeg_path: PathBuf,
    /// Timeout for a single merge tool invocation
    pub merge_timeout: Duration,
    /// Identifier published with every progress record
    pub worker_id: String,
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            max_height: u32::MAX,
            subtitle_languages: vec!["en".to_string()],
            write_thumbnail: true,
            write_metadata: true,
            write_subtitles: true,
            merge_format: "mp4".to_string(),
            retries: 3,
            retry_delays: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ],
            prefer_combined: false,
            chunk_size: 1024 * 1024, // 1MiB
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            merge_timeout: Duration::from_secs(30 * 60),
            worker_id: "worker-1".to_string(),
            user_agent: None,
        }
    }
}

impl Config {
    /// Set output directory
    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Set maximum video height
    pub fn with_max_height(mut self, max_height: u32) -> Self {
        self.max_height = max_height;
        self
    }

    /// Set attempt count
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set backoff delay table
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Set combined-stream preference
    pub fn with_prefer_combined(mut self, prefer_combined: bool) -> Self {
        self.prefer_combined = prefer_combined;
        self
    }

    /// Set merge tool path
    pub fn with_ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    /// Set merged output container, normalized to a bare lowercase extension
    pub fn with_merge_format(mut self, format: &str) -> Self {
        self.merge_format = format.trim().trim_start_matches('.').to_lowercase();
        self
    }

    /// Set worker id
    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        self.worker_id = worker_id.to_string();
        self
    }

    /// Toggle all sidecar files at once
    pub fn with_sidecars(mut self, enabled: bool) -> Self {
        self.write_thumbnail = enabled;
        self.write_metadata = enabled;
        self.write_subtitles = enabled;
        self
    }

    /// Check construction-time invariants
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ArchiveError::Config("output path must not be empty".to_string()));
        }
        if self.max_height == 0 {
            return Err(ArchiveError::Config("max height must be positive".to_string()));
        }
        if self.retries == 0 {
            return Err(ArchiveError::Config("retry count must be at least 1".to_string()));
        }
        if self.merge_format.is_empty() {
            return Err(ArchiveError::Config("merge format must not be empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ArchiveError::Config("chunk size must be positive".to_string()));
        }
        Ok(())
    }

    /// Load configuration from `ARCHIVIST_*` environment variables
    pub fn from_env() -> Result<Self, ArchiveError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    /// Unset or blank variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ArchiveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Config::default();

        if let Some(v) = get("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("MAX_HEIGHT") {
            config.max_height = parse_number("MAX_HEIGHT", &v)?;
        }
        if let Some(v) = get("SUBTITLE_LANGS") {
            config.subtitle_languages = v
                .split(',')
                .map(|lang| lang.trim().to_string())
                .filter(|lang| !lang.is_empty())
                .collect();
        }
        if let Some(v) = get("WRITE_THUMBNAIL") {
            config.write_thumbnail = parse_bool("WRITE_THUMBNAIL", &v)?;
        }
        if let Some(v) = get("WRITE_METADATA") {
            config.write_metadata = parse_bool("WRITE_METADATA", &v)?;
        }
        if let Some(v) = get("WRITE_SUBTITLES") {
            config.write_subtitles = parse_bool("WRITE_SUBTITLES", &v)?;
        }
        if let Some(v) = get("MERGE_FORMAT") {
            config = config.with_merge_format(&v);
        }
        if let Some(v) = get("RETRIES") {
            config.retries = parse_number("RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_DELAYS") {
            config.retry_delays = v
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(|d| parse_duration("RETRY_DELAYS", d))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = get("PREFER_COMBINED") {
            config.prefer_combined = parse_bool("PREFER_COMBINED", &v)?;
        }
        if let Some(v) = get("CHUNK_SIZE") {
            config.chunk_size = parse_number("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("CONNECT_TIMEOUT") {
            config.connect_timeout = parse_duration("CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("READ_TIMEOUT") {
            config.read_timeout = parse_duration("READ_TIMEOUT", &v)?;
        }
        if let Some(v) = get("FFMPEG_PATH") {
            config.ffmpeg_path = PathBuf::from(v);
        }
        if let Some(v) = get("MERGE_TIMEOUT") {
            config.merge_timeout = parse_duration("MERGE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("WORKER_ID") {
            config.worker_id = v;
        }
        if let Some(v) = get("USER_AGENT") {
            config.user_agent = Some(v);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ArchiveError> {
    value.parse::<T>().map_err(|_| {
        ArchiveError::Config(format!("{}{} is not a valid number: {}", ENV_PREFIX, name, value))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ArchiveError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ArchiveError::Config(format!(
            "{}{} is not a valid boolean: {}",
            ENV_PREFIX, name, value
        ))),
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration, ArchiveError> {
    humantime::parse_duration(value).map_err(|e| {
        ArchiveError::Config(format!("{}{} is not a valid duration ({}): {}", ENV_PREFIX, name, e, value))
    })
}
