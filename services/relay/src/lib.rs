//! Lab Monitor Relay
//!
//! UDP telemetry relay for the lab monitor. Collectors and inference
//! processes send one JSON object per datagram; the relay filters each one
//! against a configured field whitelist, attaches an image, writes the result
//! to PostgreSQL and pushes a digest to the backend so it can refresh its
//! views.
//!
//! ## Features
//!
//! - **Config-driven field mapping**: per-kind whitelists and a logical field
//!   table validated at startup
//! - **Image production**: inline pixel frames are upscaled to PNG, readings
//!   without image data fall back to a camera capture or a blank placeholder
//! - **Transient image files**: every produced file is deleted after a TTL
//! - **Idle fill**: a watchdog captures an image whenever traffic has been
//!   quiet for longer than the idle threshold
//! - **Independent writes**: each table write is its own transaction, so one
//!   failing table never blocks the others
//!
//! ## Architecture
//!
//! ```text
//!  UDP datagrams
//!        │
//!        ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Relay        │────▶│ Field        │────▶│ Image        │◀──── Camera
//! │ Server       │     │ Mapper       │     │ Pipeline     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Record       │     │ Notifier     │     │ Expiry       │
//! │ Sink (PG)    │     │ (HTTP POST)  │     │ Scheduler    │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!        ▲                    ▲                    ▲
//!        └────────────────────┴────────────────────┘
//!                             │
//!                      ┌──────────────┐
//!                      │ Idle         │
//!                      │ Watchdog     │
//!                      └──────────────┘
//! ```

pub mod api;
pub mod camera;
pub mod config;
pub mod expiry;
pub mod fields;
pub mod image_pipeline;
pub mod notifier;
pub mod packet;
pub mod server;
pub mod store;
pub mod watchdog;

pub use api::AppState;
pub use camera::{open_camera, Camera, CameraError};
pub use config::Config;
pub use expiry::ExpiryScheduler;
pub use fields::{FieldConfig, FieldMapper, SensorField, SensorReading};
pub use image_pipeline::{ImagePipeline, ImageSource, StoredImage};
pub use notifier::{Digest, HttpNotifier, Notify};
pub use packet::{InboundRecord, RecordKind};
pub use server::{HandlerSettings, PacketHandler, RelayServer, RelayStats};
pub use store::{BubbleCause, PgStore, Record, RecordSink, StoreError};
pub use watchdog::{ActivityTracker, IdleWatchdog};
