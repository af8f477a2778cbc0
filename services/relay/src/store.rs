use crate::config::DatabaseConfig;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Device recorded for temperature rows without an explicit device id
pub const DEFAULT_TEMPERATURE_DEVICE: &str = "temp_main";
/// Device recorded for light rows without an explicit device id
pub const DEFAULT_LIGHT_DEVICE: &str = "light_main";
/// Device recorded for image rows without an explicit device id
pub const DEFAULT_IMAGE_DEVICE: &str = "camera_main";

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write {table}: {source}")]
    Write {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Why an image row carries the bubble flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BubbleCause {
    /// Image accompanies a temperature reading
    Fresh,
    /// Image arrived in a packet without a temperature reading
    NoReading,
    /// Image produced by the idle watchdog
    IdleFill,
}

impl BubbleCause {
    /// Value stored in `image_data.bubble`.
    pub fn flag(&self) -> bool {
        !matches!(self, BubbleCause::Fresh)
    }
}

/// One row destined for one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Temperature {
        value: f64,
        device_id: String,
        timestamp_ms: Option<i64>,
    },
    Light {
        value: i64,
        device_id: String,
        timestamp_ms: Option<i64>,
    },
    Image {
        image_path: String,
        width: Option<u32>,
        height: Option<u32>,
        bubble: BubbleCause,
        device_id: String,
        timestamp_ms: Option<i64>,
    },
    ModelOutput {
        name: String,
        output: String,
    },
    /// Row in the unified `sensor_data` table kept for older consumers
    Legacy {
        temperature: f64,
        image_path: Option<String>,
        light: Option<i64>,
        bubble_count: i32,
        timestamp_ms: Option<i64>,
    },
}

impl Record {
    pub fn temperature(value: f64, device_id: Option<&str>, timestamp_ms: Option<i64>) -> Self {
        Record::Temperature {
            value,
            device_id: device_id.unwrap_or(DEFAULT_TEMPERATURE_DEVICE).to_string(),
            timestamp_ms,
        }
    }

    pub fn light(value: i64, device_id: Option<&str>, timestamp_ms: Option<i64>) -> Self {
        Record::Light {
            value,
            device_id: device_id.unwrap_or(DEFAULT_LIGHT_DEVICE).to_string(),
            timestamp_ms,
        }
    }

    pub fn image(
        image_path: impl Into<String>,
        dimensions: (Option<u32>, Option<u32>),
        bubble: BubbleCause,
        device_id: Option<&str>,
        timestamp_ms: Option<i64>,
    ) -> Self {
        Record::Image {
            image_path: image_path.into(),
            width: dimensions.0,
            height: dimensions.1,
            bubble,
            device_id: device_id.unwrap_or(DEFAULT_IMAGE_DEVICE).to_string(),
            timestamp_ms,
        }
    }

    pub fn model_output(name: impl Into<String>, output: impl Into<String>) -> Self {
        Record::ModelOutput {
            name: name.into(),
            output: output.into(),
        }
    }

    /// Unified row: a missing temperature is stored as 0.0 and counted as a
    /// bubble.
    pub fn legacy(
        temperature: Option<f64>,
        image_path: Option<String>,
        light: Option<i64>,
        timestamp_ms: Option<i64>,
    ) -> Self {
        Record::Legacy {
            temperature: temperature.unwrap_or(0.0),
            image_path,
            light,
            bubble_count: if temperature.is_some() { 0 } else { 1 },
            timestamp_ms,
        }
    }

    /// Target table name
    pub fn table(&self) -> &'static str {
        match self {
            Record::Temperature { .. } => "temperature_data",
            Record::Light { .. } => "light_data",
            Record::Image { .. } => "image_data",
            Record::ModelOutput { .. } => "model_outputs",
            Record::Legacy { .. } => "sensor_data",
        }
    }
}

/// Destination for relay records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Make a connection available before a batch of writes.
    async fn ensure_connected(&self) -> Result<(), StoreError>;

    /// Write one record in its own transaction.
    async fn write(&self, record: &Record) -> Result<(), StoreError>;

    /// Round-trip check used by readiness probes.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed record sink.
///
/// The pool is created lazily; if it cannot be created, writes fail with
/// [`StoreError::Unavailable`] until a later attempt succeeds.
pub struct PgStore {
    config: DatabaseConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PgStore {
    /// Create a store without connecting.
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    /// Create a store and connect, retrying with exponential backoff until a
    /// connection succeeds or `cancel` fires.
    pub async fn connect_with_retry(
        config: DatabaseConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, StoreError> {
        let store = Self::new(config);
        let mut backoff = ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(store.config.retry_initial_ms),
            max_interval: std::time::Duration::from_millis(store.config.retry_max_ms),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        loop {
            match store.connect().await {
                Ok(pool) => {
                    *store.pool.write() = Some(pool);
                    info!(attempts = attempts + 1, "Connected to PostgreSQL database");
                    return Ok(store);
                }
                Err(e) => {
                    attempts += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(backoff.max_interval);
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Database connection failed, retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(StoreError::Unavailable(
                                "shutdown requested while connecting".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let timezone = self.config.session_timezone.clone();

        PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout())
            .after_connect(move |conn, _meta| {
                let timezone = timezone.clone();
                Box::pin(async move {
                    if let Some(tz) = timezone {
                        let statement = format!("SET TIME ZONE '{}'", tz.replace('\'', "''"));
                        conn.execute(statement.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect(&self.config.url)
            .await
    }

    async fn pool(&self) -> Result<PgPool, StoreError> {
        if let Some(pool) = self.pool.read().clone() {
            return Ok(pool);
        }

        let pool = self
            .connect()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("Reconnected to PostgreSQL database");
        *self.pool.write() = Some(pool.clone());
        Ok(pool)
    }

    /// Check out one connection and run a trivial query on it, bounded by the
    /// connect timeout. A pool that exists but cannot reach the server fails
    /// here once instead of once per table.
    async fn check(&self) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        let timeout = self.config.connect_timeout();

        let round_trip = async {
            let mut conn = pool.acquire().await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok::<_, sqlx::Error>(())
        };

        match tokio::time::timeout(timeout, round_trip).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Unavailable(format!(
                "no connection within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn insert(&self, pool: &PgPool, record: &Record) -> Result<(), sqlx::Error> {
        // An uncommitted transaction is rolled back when dropped
        let mut tx = pool.begin().await?;

        match record {
            Record::Temperature {
                value,
                device_id,
                timestamp_ms,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO temperature_data (timestamp, value, device_id, unit)
                    VALUES (COALESCE(to_timestamp($1::bigint / 1000.0), NOW()), $2, $3, 'C')
                    "#,
                )
                .bind(timestamp_ms)
                .bind(value)
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
            }
            Record::Light {
                value,
                device_id,
                timestamp_ms,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO light_data (timestamp, value, device_id, unit)
                    VALUES (COALESCE(to_timestamp($1::bigint / 1000.0), NOW()), $2, $3, 'lux')
                    "#,
                )
                .bind(timestamp_ms)
                .bind(value)
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
            }
            Record::Image {
                image_path,
                width,
                height,
                bubble,
                device_id,
                timestamp_ms,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO image_data (timestamp, image_path, width, height, device_id, bubble)
                    VALUES (COALESCE(to_timestamp($1::bigint / 1000.0), NOW()), $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(timestamp_ms)
                .bind(image_path)
                .bind(width.map(|w| w as i32))
                .bind(height.map(|h| h as i32))
                .bind(device_id)
                .bind(bubble.flag())
                .execute(&mut *tx)
                .await?;
            }
            Record::ModelOutput { name, output } => {
                sqlx::query("INSERT INTO model_outputs (name, output) VALUES ($1, $2)")
                    .bind(name)
                    .bind(output)
                    .execute(&mut *tx)
                    .await?;
            }
            Record::Legacy {
                temperature,
                image_path,
                light,
                bubble_count,
                timestamp_ms,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO sensor_data (timestamp, temperature, image_path, light, bubble_count)
                    VALUES (COALESCE(to_timestamp($1::bigint / 1000.0), NOW()), $2, $3, $4, $5)
                    "#,
                )
                .bind(timestamp_ms)
                .bind(temperature)
                .bind(image_path)
                .bind(light)
                .bind(bubble_count)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await
    }
}

#[async_trait]
impl RecordSink for PgStore {
    async fn ensure_connected(&self) -> Result<(), StoreError> {
        self.check().await
    }

    #[instrument(skip(self, record), fields(table = record.table()))]
    async fn write(&self, record: &Record) -> Result<(), StoreError> {
        let pool = self.pool().await?;

        self.insert(&pool, record)
            .await
            .map_err(|source| StoreError::Write {
                table: record.table(),
                source,
            })?;

        debug!("Record written");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory sink recording every successful write.
    #[derive(Default)]
    pub struct MemorySink {
        records: Mutex<Vec<Record>>,
        failing: Mutex<HashSet<&'static str>>,
        offline: AtomicBool,
        panic_armed: AtomicBool,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn records(&self) -> Vec<Record> {
            self.records.lock().clone()
        }

        pub fn in_table(&self, table: &str) -> Vec<Record> {
            self.records
                .lock()
                .iter()
                .filter(|r| r.table() == table)
                .cloned()
                .collect()
        }

        /// Make every write to `table` fail.
        pub fn fail_table(&self, table: &'static str) {
            self.failing.lock().insert(table);
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// Make the next write panic.
        pub fn panic_on_next_write(&self) {
            self.panic_armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn ensure_connected(&self) -> Result<(), StoreError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("offline".to_string()));
            }
            Ok(())
        }

        async fn write(&self, record: &Record) -> Result<(), StoreError> {
            if self.panic_armed.swap(false, Ordering::SeqCst) {
                panic!("sink exploded");
            }
            self.ensure_connected().await?;
            if self.failing.lock().contains(record.table()) {
                return Err(StoreError::Write {
                    table: record.table(),
                    source: sqlx::Error::RowNotFound,
                });
            }
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.ensure_connected().await
        }
    }
}
