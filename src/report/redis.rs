//! Progress mirror in the shared cache
//!
//! Each running download owns the key `download:progress:{id}` (5 minute TTL)
//! and is a member of the set `download:active` while it is downloading or
//! processing. A worker that dies leaves a set member whose key expires;
//! [`RedisProgressReporter::sweep`] removes those.

use crate::core::progress::{clamp_percent, DownloadProgress, DownloadStatus};
use crate::error::ArchiveError;
use crate::report::ProgressSink;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PROGRESS_KEY_PREFIX: &str = "download:progress:";
pub const ACTIVE_SET: &str = "download:active";
pub const PROGRESS_TTL: Duration = Duration::from_secs(300);

/// Minimum spacing of unforced writes for one id
pub const WRITE_INTERVAL: Duration = Duration::from_secs(1);

pub fn progress_key(video_id: &str) -> String {
    format!("{}{}", PROGRESS_KEY_PREFIX, video_id)
}

/// Key/value store with expiring keys and string sets
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ArchiveError>;
    async fn get(&self, key: &str) -> Result<Option<String>, ArchiveError>;
    async fn exists(&self, key: &str) -> Result<bool, ArchiveError>;
    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), ArchiveError>;
    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), ArchiveError>;
    async fn set_members(&self, set: &str) -> Result<Vec<String>, ArchiveError>;
}

/// `ProgressStore` on a Redis server
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `redis://host:port/db`. The manager reconnects on its own.
    pub async fn connect(url: &str) -> Result<Self, ArchiveError> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to progress cache");
        Ok(Self { conn })
    }
}

#[async_trait]
impl ProgressStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ArchiveError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ArchiveError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, ArchiveError> {
        let mut conn = self.conn.clone();
        let exists: bool = ::redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), ArchiveError> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("SADD").arg(set).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), ArchiveError> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("SREM").arg(set).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, ArchiveError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = ::redis::cmd("SMEMBERS").arg(set).query_async(&mut conn).await?;
        Ok(members)
    }
}

/// Read-back shape of a progress key. Older writers used `percentage` and
/// may omit fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoredProgress {
    pub video_id: Option<String>,
    pub worker_id: Option<String>,
    pub status: Option<String>,
    #[serde(alias = "percentage")]
    pub percent: Option<f64>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub fragment: Option<String>,
    pub updated_at: Option<i64>,
}

impl StoredProgress {
    /// Fill defaults and clamp the percentage
    pub fn normalize(self, video_id: &str) -> DownloadProgress {
        let status = match self.status.as_deref() {
            Some("processing") => DownloadStatus::Processing,
            Some("completed") => DownloadStatus::Completed,
            Some("error") => DownloadStatus::Error,
            _ => DownloadStatus::Downloading,
        };
        DownloadProgress {
            video_id: self.video_id.unwrap_or_else(|| video_id.to_string()),
            worker_id: self.worker_id.unwrap_or_default(),
            status,
            percent: clamp_percent(self.percent.unwrap_or(0.0)),
            downloaded: self.downloaded.unwrap_or(0),
            total: self.total.unwrap_or(0),
            speed: self.speed.unwrap_or_default(),
            eta: self.eta.unwrap_or_default(),
            fragment: self.fragment,
            updated_at: self.updated_at.unwrap_or(0),
        }
    }
}

/// Mirrors progress into a `ProgressStore`, at most once per second per id
/// unless forced
pub struct RedisProgressReporter {
    store: Arc<dyn ProgressStore>,
    last_write: Cache<String, (Instant, DownloadStatus)>,
}

impl RedisProgressReporter {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self {
            store,
            last_write: Cache::builder().time_to_idle(PROGRESS_TTL).build(),
        }
    }

    async fn should_write(&self, progress: &DownloadProgress, force: bool) -> bool {
        if force {
            return true;
        }
        match self.last_write.get(&progress.video_id).await {
            Some((_, status)) if status != progress.status => true,
            Some((at, _)) => at.elapsed() >= WRITE_INTERVAL,
            None => true,
        }
    }

    /// Remove active ids whose progress key has expired. Returns the
    /// removed ids.
    pub async fn sweep(&self) -> Result<Vec<String>, ArchiveError> {
        let mut removed = Vec::new();
        for video_id in self.store.set_members(ACTIVE_SET).await? {
            if !self.store.exists(&progress_key(&video_id)).await? {
                self.store.remove_from_set(ACTIVE_SET, &video_id).await?;
                removed.push(video_id);
            }
        }
        if !removed.is_empty() {
            info!("Swept {} stale active download(s)", removed.len());
        }
        Ok(removed)
    }

    /// Run `sweep` every `interval` until the token fires
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!("Active set sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Read the stored progress for `video_id`
    pub async fn fetch(&self, video_id: &str) -> Result<Option<DownloadProgress>, ArchiveError> {
        match self.store.get(&progress_key(video_id)).await? {
            Some(raw) => {
                let stored: StoredProgress = serde_json::from_str(&raw)?;
                Ok(Some(stored.normalize(video_id)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProgressSink for RedisProgressReporter {
    async fn publish(&self, progress: &DownloadProgress, force: bool) -> Result<(), ArchiveError> {
        if !self.should_write(progress, force).await {
            return Ok(());
        }

        let json = serde_json::to_string(progress)?;
        self.store
            .set_with_ttl(&progress_key(&progress.video_id), &json, PROGRESS_TTL)
            .await?;

        if progress.status.is_active() {
            self.store.add_to_set(ACTIVE_SET, &progress.video_id).await?;
        } else {
            self.store.remove_from_set(ACTIVE_SET, &progress.video_id).await?;
        }

        self.last_write
            .insert(progress.video_id.clone(), (Instant::now(), progress.status))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cache::MemoryStore;

    fn reporter() -> (RedisProgressReporter, MemoryStore) {
        let store = MemoryStore::new();
        (RedisProgressReporter::new(Arc::new(store.clone())), store)
    }

    fn progress(status: DownloadStatus, downloaded: u64) -> DownloadProgress {
        DownloadProgress::new("vid", "w1", status).with_bytes(downloaded, 100)
    }

    #[tokio::test]
    async fn test_active_set_membership() {
        let (reporter, store) = reporter();

        reporter.publish(&progress(DownloadStatus::Downloading, 10), false).await.unwrap();
        assert_eq!(store.set_members(ACTIVE_SET).await.unwrap(), vec!["vid"]);

        reporter.publish(&progress(DownloadStatus::Completed, 100), false).await.unwrap();
        assert!(store.set_members(ACTIVE_SET).await.unwrap().is_empty());

        let stored = reporter.fetch("vid").await.unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(stored.percent, 100.0);
    }

    #[tokio::test]
    async fn test_unforced_writes_are_throttled() {
        let (reporter, _store) = reporter();

        reporter.publish(&progress(DownloadStatus::Downloading, 10), false).await.unwrap();
        reporter.publish(&progress(DownloadStatus::Downloading, 20), false).await.unwrap();
        assert_eq!(reporter.fetch("vid").await.unwrap().unwrap().downloaded, 10);

        reporter.publish(&progress(DownloadStatus::Downloading, 30), true).await.unwrap();
        assert_eq!(reporter.fetch("vid").await.unwrap().unwrap().downloaded, 30);

        tokio::time::sleep(WRITE_INTERVAL + Duration::from_millis(50)).await;
        reporter.publish(&progress(DownloadStatus::Downloading, 40), false).await.unwrap();
        assert_eq!(reporter.fetch("vid").await.unwrap().unwrap().downloaded, 40);
    }

    #[tokio::test]
    async fn test_status_transition_bypasses_throttle() {
        let (reporter, _store) = reporter();

        reporter.publish(&progress(DownloadStatus::Downloading, 10), false).await.unwrap();
        reporter.publish(&progress(DownloadStatus::Processing, 100), false).await.unwrap();
        assert_eq!(
            reporter.fetch("vid").await.unwrap().unwrap().status,
            DownloadStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_members() {
        let (reporter, store) = reporter();

        reporter.publish(&progress(DownloadStatus::Downloading, 10), false).await.unwrap();
        let other = DownloadProgress::new("live", "w2", DownloadStatus::Downloading);
        reporter.publish(&other, false).await.unwrap();

        store.expire(&progress_key("vid"));
        let removed = reporter.sweep().await.unwrap();

        assert_eq!(removed, vec!["vid"]);
        assert_eq!(store.set_members(ACTIVE_SET).await.unwrap(), vec!["live"]);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let (reporter, store) = reporter();
        store.add_to_set(ACTIVE_SET, "ghost").await.unwrap();

        let token = CancellationToken::new();
        let handle = Arc::new(reporter).spawn_sweeper(Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(store.set_members(ACTIVE_SET).await.unwrap().is_empty());
    }

    #[test]
    fn test_stored_progress_normalization() {
        let stored: StoredProgress =
            serde_json::from_str(r#"{"percentage": 140.5, "status": "processing", "downloaded": 7}"#).unwrap();
        let progress = stored.normalize("vid");

        assert_eq!(progress.video_id, "vid");
        assert_eq!(progress.status, DownloadStatus::Processing);
        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.downloaded, 7);
        assert_eq!(progress.total, 0);
        assert!(progress.speed.is_empty());

        let empty: StoredProgress = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.normalize("x").status, DownloadStatus::Downloading);
    }
}
