use crate::config::ListenerConfig;
use crate::expiry::ExpiryScheduler;
use crate::fields::{FieldMapper, SensorReading};
use crate::image_pipeline::{ImagePipeline, StoredImage};
use crate::notifier::{Digest, ModelDigest, Notify, SensorDigest};
use crate::packet::{InboundRecord, PacketError, RecordKind};
use crate::store::{BubbleCause, Record, RecordSink};
use crate::watchdog::ActivityTracker;
use futures::FutureExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Packet counters exposed on the status API.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    malformed: AtomicU64,
    model: AtomicU64,
    sensor: AtomicU64,
    store_failures: AtomicU64,
    handler_panics: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub model: u64,
    pub sensor: u64,
    pub store_failures: u64,
    pub handler_panics: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            model: self.model.load(Ordering::Relaxed),
            sensor: self.sensor.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

/// Per-packet behaviour switches.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// Lifetime of produced and reused image files
    pub image_ttl: Duration,
    /// Fall back to camera or placeholder for readings without image data
    pub capture_on_reading: bool,
}

/// Decodes, stores and announces one datagram at a time.
pub struct PacketHandler {
    mapper: FieldMapper,
    images: Arc<ImagePipeline>,
    sink: Arc<dyn RecordSink>,
    expiry: ExpiryScheduler,
    notifier: Arc<dyn Notify>,
    activity: Arc<ActivityTracker>,
    stats: Arc<RelayStats>,
    settings: HandlerSettings,
}

impl PacketHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mapper: FieldMapper,
        images: Arc<ImagePipeline>,
        sink: Arc<dyn RecordSink>,
        expiry: ExpiryScheduler,
        notifier: Arc<dyn Notify>,
        activity: Arc<ActivityTracker>,
        stats: Arc<RelayStats>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            mapper,
            images,
            sink,
            expiry,
            notifier,
            activity,
            stats,
            settings,
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Handle one datagram body. Malformed input is counted and skipped.
    pub async fn handle_datagram(&self, bytes: &[u8]) -> Result<RecordKind, PacketError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay.packets.received").increment(1);

        let record = match InboundRecord::decode(bytes) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, len = bytes.len(), "Dropping malformed packet");
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay.packets.malformed").increment(1);
                return Err(e);
            }
        };

        let kind = record.kind();
        match kind {
            RecordKind::Model => {
                self.stats.model.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay.packets.model").increment(1);
                self.handle_model(&record).await;
            }
            RecordKind::Sensor => {
                self.stats.sensor.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay.packets.sensor").increment(1);
                self.handle_sensor(&record).await;
            }
        }

        Ok(kind)
    }

    #[instrument(skip_all)]
    async fn handle_model(&self, record: &InboundRecord) {
        let output = self.mapper.model_output(record);

        self.persist(&[Record::model_output(&output.name, output.output_text())])
            .await;

        debug!(name = %output.name, "Model output relayed");
        self.notifier.notify(Digest::Model(ModelDigest {
            name: output.name,
            output: output.output,
        }));
    }

    #[instrument(skip_all)]
    async fn handle_sensor(&self, record: &InboundRecord) {
        let reading = self.mapper.sensor_reading(record);
        let image = self.resolve_image(&reading).await;
        let image_path = image.as_ref().map(|i| i.public_path.clone());
        let device = reading.device_id.as_deref();
        let ts = reading.timestamp_ms;

        let mut records = Vec::with_capacity(4);
        if let Some(value) = reading.temperature {
            records.push(Record::temperature(value, device, ts));
        }
        if let Some(image) = &image {
            let cause = if reading.temperature.is_some() {
                BubbleCause::Fresh
            } else {
                BubbleCause::NoReading
            };
            debug!(
                path = %image.public_path,
                source = image.source.as_str(),
                cause = ?cause,
                "Image attached"
            );
            records.push(Record::image(
                image.public_path.clone(),
                (image.width, image.height),
                cause,
                device,
                ts,
            ));
        }
        if let Some(value) = reading.light {
            records.push(Record::light(value, device, ts));
        }
        records.push(Record::legacy(
            reading.temperature,
            image_path.clone(),
            reading.light,
            ts,
        ));

        self.persist(&records).await;

        if let Some(image) = &image {
            self.expiry.schedule(&image.file_path, self.settings.image_ttl);
        }

        self.notifier.notify(Digest::Sensor(SensorDigest {
            temperature: reading.temperature,
            light: reading.light,
            image_path,
            timestamp_ms: ts,
        }));

        if image.is_some() {
            self.activity.record_image();
        }
    }

    /// Existing file, then inline frame, then camera with a placeholder
    /// fallback.
    async fn resolve_image(&self, reading: &SensorReading) -> Option<StoredImage> {
        if let Some(existing) = reading
            .image_path
            .as_deref()
            .and_then(|path| self.images.existing(path))
        {
            return Some(existing);
        }

        if let Some(frame) = reading.frame.as_ref().filter(|f| f.is_object()) {
            return match self.images.reconstruct(frame) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!(error = %e, "Failed to write frame image");
                    None
                }
            };
        }

        if !self.settings.capture_on_reading {
            return None;
        }

        let captured = match self.images.capture().await {
            Ok(image) => Ok(image),
            Err(e) => {
                debug!(error = %e, "Camera capture failed, writing placeholder");
                self.images.placeholder()
            }
        };

        captured
            .map_err(|e| warn!(error = %e, "No image produced for reading"))
            .ok()
    }

    /// Write each record independently. Nothing is written when no
    /// connection can be established.
    async fn persist(&self, records: &[Record]) {
        if let Err(e) = self.sink.ensure_connected().await {
            warn!(error = %e, count = records.len(), "Database unavailable, skipping persistence");
            return;
        }

        for record in records {
            if let Err(e) = self.sink.write(record).await {
                warn!(table = record.table(), error = %e, "Write failed");
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay.store.failures", "table" => record.table()).increment(1);
            }
        }
    }
}

/// UDP receive loop.
pub struct RelayServer {
    socket: UdpSocket,
    handler: PacketHandler,
    buffer_size: usize,
    pause: Duration,
}

impl RelayServer {
    /// Bind the listener socket.
    pub async fn bind(
        config: &ListenerConfig,
        handler: PacketHandler,
        pause: Duration,
    ) -> std::io::Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let socket = UdpSocket::bind(&addr).await?;

        Ok(Self {
            socket,
            handler,
            buffer_size: config.max_datagram_bytes,
            pause,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and handle datagrams until cancelled.
    ///
    /// A panic while handling a packet is contained here: it is logged, the
    /// loop pauses briefly and then keeps receiving.
    pub async fn run(self, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.buffer_size];
        info!(addr = ?self.socket.local_addr().ok(), "Relay listening");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, peer) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    tokio::time::sleep(self.pause).await;
                    continue;
                }
            };

            let started = Instant::now();
            let outcome = AssertUnwindSafe(self.handler.handle_datagram(&buf[..len]))
                .catch_unwind()
                .await;
            metrics::histogram!("relay.packet.duration_seconds")
                .record(started.elapsed().as_secs_f64());

            match outcome {
                Ok(Ok(kind)) => debug!(%peer, kind = kind.as_str(), "Packet handled"),
                Ok(Err(_)) => {}
                Err(_) => {
                    error!(%peer, "Packet handler panicked, resuming");
                    self.handler
                        .stats
                        .handler_panics
                        .fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.pause).await;
                }
            }
        }

        info!("Relay stopped");
    }
}
