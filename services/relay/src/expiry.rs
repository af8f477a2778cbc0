//! Deferred deletion of produced image files.
//!
//! One background task owns a [`DelayQueue`] of pending deletions. Callers
//! hold a cheap [`ExpiryScheduler`] handle and never wait on the disk.

use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ExpiryRequest {
    path: PathBuf,
    ttl: Duration,
}

/// Handle for arming file deletions.
#[derive(Debug, Clone)]
pub struct ExpiryScheduler {
    tx: mpsc::UnboundedSender<ExpiryRequest>,
}

impl ExpiryScheduler {
    /// Start the deletion service. It runs until `cancel` fires or every
    /// handle is dropped and the queue has drained.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, cancel));
        (Self { tx }, handle)
    }

    /// Delete `path` once `ttl` has elapsed. Empty paths are ignored.
    pub fn schedule(&self, path: impl Into<PathBuf>, ttl: Duration) {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return;
        }

        debug!(path = %path.display(), ttl_secs = ttl.as_secs(), "Expiry armed");
        if self.tx.send(ExpiryRequest { path, ttl }).is_err() {
            warn!("Expiry service stopped, file will not be deleted");
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<ExpiryRequest>, cancel: CancellationToken) {
    let mut queue: DelayQueue<PathBuf> = DelayQueue::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(pending = queue.len(), "Expiry service shutting down");
                break;
            }
            request = rx.recv(), if accepting => match request {
                Some(ExpiryRequest { path, ttl }) => {
                    queue.insert(path, ttl);
                }
                None => accepting = false,
            },
            // An empty DelayQueue yields None immediately
            Some(expired) = queue.next(), if !queue.is_empty() => {
                remove(expired.into_inner());
            }
        }

        if !accepting && queue.is_empty() {
            break;
        }
    }
}

fn remove(path: PathBuf) {
    match std::fs::remove_file(&path) {
        Ok(()) => {
            debug!(path = %path.display(), "Expired image removed");
            metrics::counter!("relay.images.expired").increment(1);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Expired image already gone");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove expired image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_file_removed_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("relay_1.png");
        std::fs::write(&file, b"png").unwrap();

        let (scheduler, _handle) = ExpiryScheduler::spawn(CancellationToken::new());
        scheduler.schedule(&file, Duration::from_secs(60));

        sleep(Duration::from_secs(59)).await;
        assert!(file.exists());

        sleep(Duration::from_secs(2)).await;
        assert!(!file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_deadlines() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short.png");
        let long = dir.path().join("long.png");
        std::fs::write(&short, b"a").unwrap();
        std::fs::write(&long, b"b").unwrap();

        let (scheduler, _handle) = ExpiryScheduler::spawn(CancellationToken::new());
        scheduler.schedule(&long, Duration::from_secs(30));
        scheduler.schedule(&short, Duration::from_secs(5));

        sleep(Duration::from_secs(6)).await;
        assert!(!short.exists());
        assert!(long.exists());

        sleep(Duration::from_secs(30)).await;
        assert!(!long.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_and_empty_paths_are_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let survivor = dir.path().join("survivor.png");
        std::fs::write(&survivor, b"c").unwrap();

        let (scheduler, handle) = ExpiryScheduler::spawn(CancellationToken::new());
        scheduler.schedule("", Duration::from_secs(1));
        scheduler.schedule(dir.path().join("never-written.png"), Duration::from_secs(1));
        scheduler.schedule(&survivor, Duration::from_secs(3));

        sleep(Duration::from_secs(4)).await;
        assert!(!survivor.exists());

        // Dropping the last handle lets the drained service exit
        drop(scheduler);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_service() {
        let cancel = CancellationToken::new();
        let (scheduler, handle) = ExpiryScheduler::spawn(cancel.clone());
        scheduler.schedule("/tmp/labmon-relay-never-deleted.png", Duration::from_secs(3600));

        cancel.cancel();
        handle.await.unwrap();
    }
}
