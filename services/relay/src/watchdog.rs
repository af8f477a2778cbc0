//! Periodic image production during traffic lulls.

use crate::expiry::ExpiryScheduler;
use crate::image_pipeline::ImagePipeline;
use crate::notifier::{Digest, Notify, SensorDigest};
use crate::store::{BubbleCause, Record, RecordSink};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const NEVER: u64 = u64::MAX;

/// Time of the most recent successfully produced image.
///
/// Written by the receive loop and the watchdog, read by the watchdog and
/// the status API. Updates only ever move it to "now".
#[derive(Debug)]
pub struct ActivityTracker {
    origin: Instant,
    last_image_ms: AtomicU64,
    images: AtomicU64,
}

impl ActivityTracker {
    /// Tracker with no image produced yet.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_image_ms: AtomicU64::new(NEVER),
            images: AtomicU64::new(0),
        }
    }

    pub fn record_image(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_image_ms.store(elapsed, Ordering::Release);
        self.images.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of images recorded since startup.
    pub fn images_recorded(&self) -> u64 {
        self.images.load(Ordering::Relaxed)
    }

    /// Time since the last image, `None` if there has not been one.
    pub fn since_last_image(&self) -> Option<Duration> {
        match self.last_image_ms.load(Ordering::Acquire) {
            NEVER => None,
            at => Some(self.origin.elapsed().saturating_sub(Duration::from_millis(at))),
        }
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.since_last_image().map_or(true, |since| since > threshold)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Captures a camera image whenever no image has been produced for longer
/// than the idle threshold.
pub struct IdleWatchdog {
    images: Arc<ImagePipeline>,
    sink: Arc<dyn RecordSink>,
    expiry: ExpiryScheduler,
    notifier: Arc<dyn Notify>,
    activity: Arc<ActivityTracker>,
    threshold: Duration,
    poll_interval: Duration,
    ttl: Duration,
}

impl IdleWatchdog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        images: Arc<ImagePipeline>,
        sink: Arc<dyn RecordSink>,
        expiry: ExpiryScheduler,
        notifier: Arc<dyn Notify>,
        activity: Arc<ActivityTracker>,
        threshold: Duration,
        poll_interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            images,
            sink,
            expiry,
            notifier,
            activity,
            threshold,
            poll_interval,
            ttl,
        }
    }

    /// Poll until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            threshold_secs = self.threshold.as_secs(),
            poll_secs = self.poll_interval.as_secs(),
            "Idle watchdog started"
        );

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Idle watchdog stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if self.activity.is_idle(self.threshold)
                        && AssertUnwindSafe(self.fill()).catch_unwind().await.is_err()
                    {
                        error!("Idle fill panicked, watchdog continues");
                        metrics::counter!("relay.watchdog.panics").increment(1);
                    }
                }
            }
        }
    }

    /// Capture, persist and announce one idle image. A failed capture leaves
    /// the activity clock untouched.
    #[instrument(skip(self))]
    async fn fill(&self) {
        let image = match self.images.capture().await {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "Idle capture failed");
                return;
            }
        };

        match self.sink.ensure_connected().await {
            Ok(()) => {
                let record = Record::image(
                    image.public_path.clone(),
                    (image.width, image.height),
                    BubbleCause::IdleFill,
                    None,
                    None,
                );
                if let Err(e) = self.sink.write(&record).await {
                    warn!(table = record.table(), error = %e, "Idle image not persisted");
                    metrics::counter!("relay.store.failures", "table" => record.table())
                        .increment(1);
                }
            }
            Err(e) => warn!(error = %e, "Database unavailable, idle image not persisted"),
        }

        self.expiry.schedule(&image.file_path, self.ttl);
        self.notifier.notify(Digest::Sensor(SensorDigest {
            temperature: None,
            light: None,
            image_path: Some(image.public_path.clone()),
            timestamp_ms: None,
        }));
        self.activity.record_image();

        metrics::counter!("relay.watchdog.fills").increment(1);
        debug!(path = %image.public_path, "Idle image produced");
    }
}
