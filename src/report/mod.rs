//! Progress publishing
//!
//! Events from a download are queued on an unbounded channel and published
//! to every sink, in order, by one task per download. A slow or failing sink
//! never stalls the transfer: unforced records waiting behind a slow sink
//! collapse into the newest one, and the final drain is bounded.

pub mod http;
pub mod redis;

pub use self::http::ProgressReporter;
pub use self::redis::{ProgressStore, RedisProgressReporter, RedisStore, StoredProgress};

use crate::core::progress::{DownloadProgress, DownloadStatus, StatusUpdate};
use crate::error::ArchiveError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest wait for queued events once a download is over
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest wait for queued events once the download was cancelled
pub const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A consumer of progress events
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Publish a progress record. `force` bypasses any rate limiting.
    async fn publish(&self, progress: &DownloadProgress, force: bool) -> Result<(), ArchiveError>;

    /// Publish a final status
    async fn publish_status(&self, _update: &StatusUpdate) -> Result<(), ArchiveError> {
        Ok(())
    }
}

enum Event {
    Progress { progress: DownloadProgress, force: bool },
    Status(StatusUpdate),
}

/// Per-download publishing task
pub struct ProgressPump {
    emitter: ProgressEmitter,
    task: JoinHandle<()>,
}

impl ProgressPump {
    pub fn start(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let task = tokio::spawn(async move {
            let mut pending = VecDeque::new();
            loop {
                if pending.is_empty() {
                    match rx.recv().await {
                        Some(event) => enqueue(&mut pending, event),
                        None => break,
                    }
                }
                while let Ok(event) = rx.try_recv() {
                    enqueue(&mut pending, event);
                }
                if let Some(event) = pending.pop_front() {
                    publish(&sinks, &event).await;
                }
            }
        });

        Self {
            emitter: ProgressEmitter {
                tx,
                last_status: Arc::new(Mutex::new(None)),
            },
            task,
        }
    }

    pub fn emitter(&self) -> ProgressEmitter {
        self.emitter.clone()
    }

    /// Close the queue and wait for the queued events to go out, for at most
    /// [`DRAIN_TIMEOUT`], or [`CANCEL_DRAIN_TIMEOUT`] once `token` fires.
    /// Whatever is still queued after that is dropped.
    pub async fn finish(self, token: &CancellationToken) {
        let ProgressPump { emitter, mut task } = self;
        drop(emitter);

        let drained = tokio::select! {
            biased;
            result = &mut task => Some(result),
            _ = token.cancelled() => tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, &mut task).await.ok(),
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => None,
        };

        match drained {
            Some(Ok(())) => debug!("Progress queue drained"),
            Some(Err(e)) => warn!("Progress task ended abnormally: {}", e),
            None => {
                warn!("Progress sinks too slow, dropping undelivered events");
                task.abort();
            }
        }
    }
}

/// Queue `event`, replacing an unforced progress record still waiting at
/// the back. Forced records and statuses are never dropped.
fn enqueue(pending: &mut VecDeque<Event>, event: Event) {
    if let Event::Progress { force: false, .. } = event {
        if let Some(Event::Progress { force: false, .. }) = pending.back() {
            pending.pop_back();
        }
    }
    pending.push_back(event);
}

async fn publish(sinks: &[Arc<dyn ProgressSink>], event: &Event) {
    for sink in sinks {
        let result = match event {
            Event::Progress { progress, force } => sink.publish(progress, *force).await,
            Event::Status(update) => sink.publish_status(update).await,
        };
        if let Err(e) = result {
            warn!("Progress publish failed: {}", e);
        }
    }
}

/// Cheap, synchronous handle for queueing events
#[derive(Clone)]
pub struct ProgressEmitter {
    tx: mpsc::UnboundedSender<Event>,
    last_status: Arc<Mutex<Option<DownloadStatus>>>,
}

impl ProgressEmitter {
    /// Queue a progress record. Status changes are always forced.
    pub fn progress(&self, progress: DownloadProgress) {
        let force = {
            let mut last = self.last_status.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *last != Some(progress.status);
            *last = Some(progress.status);
            changed || progress.status.is_terminal()
        };
        self.send(Event::Progress { progress, force });
    }

    /// Queue a progress record that bypasses rate limiting
    pub fn force(&self, progress: DownloadProgress) {
        *self.last_status.lock().unwrap_or_else(PoisonError::into_inner) = Some(progress.status);
        self.send(Event::Progress { progress, force: true });
    }

    pub fn status(&self, update: StatusUpdate) {
        self.send(Event::Status(update));
    }

    fn send(&self, event: Event) {
        // the receiver only goes away once the pump is finished
        let _ = self.tx.send(event);
    }
}
