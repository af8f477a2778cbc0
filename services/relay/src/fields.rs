//! Field whitelist and logical-name mapping for inbound records.
//!
//! The whitelist file is shared with the backend and looks like:
//!
//! ```json
//! {
//!   "valid_keys": {
//!     "sensor": ["temperature_c", "light", "frame", "image_path", "timestamp_ms"],
//!     "model": ["name", "output", "result"]
//!   },
//!   "sensor_fields": {
//!     "temperature": "temperature_c",
//!     "light": "light",
//!     "frame": "frame",
//!     "image_path": "image_path",
//!     "timestamp": "timestamp_ms"
//!   }
//! }
//! ```
//!
//! Logical names are checked against [`SensorField`] when the file is loaded,
//! so a typo in the mapping stops the relay at startup instead of silently
//! producing empty readings.

use crate::packet::{InboundRecord, RecordKind};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while loading the field configuration.
#[derive(Debug, Error)]
pub enum FieldConfigError {
    #[error("Field config not found at {primary} or fallback {fallback}")]
    NotFound { primary: PathBuf, fallback: PathBuf },

    #[error("Failed to read field config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid field config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown logical sensor field \"{name}\" (accepted: {accepted})")]
    UnknownField { name: String, accepted: String },
}

/// Logical sensor fields the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorField {
    Temperature,
    Light,
    Frame,
    ImagePath,
    Timestamp,
    DeviceId,
}

impl SensorField {
    pub const ALL: [SensorField; 6] = [
        SensorField::Temperature,
        SensorField::Light,
        SensorField::Frame,
        SensorField::ImagePath,
        SensorField::Timestamp,
        SensorField::DeviceId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorField::Temperature => "temperature",
            SensorField::Light => "light",
            SensorField::Frame => "frame",
            SensorField::ImagePath => "image_path",
            SensorField::Timestamp => "timestamp",
            SensorField::DeviceId => "device_id",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for SensorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawFieldConfig {
    #[serde(default)]
    valid_keys: RawValidKeys,
    #[serde(default)]
    sensor_fields: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawValidKeys {
    #[serde(default)]
    sensor: Vec<String>,
    #[serde(default)]
    model: Vec<String>,
}

/// Validated whitelist and logical-to-wire mapping.
#[derive(Debug, Clone)]
pub struct FieldConfig {
    sensor_keys: HashSet<String>,
    model_keys: HashSet<String>,
    sensor_fields: BTreeMap<SensorField, String>,
}

impl FieldConfig {
    /// Load the field config, falling back to `fallback` only when `primary`
    /// does not exist. A present but unreadable or invalid primary is an error.
    pub fn load(primary: &Path, fallback: &Path) -> Result<Self, FieldConfigError> {
        let path = if primary.exists() {
            primary
        } else if fallback.exists() {
            warn!(
                primary = %primary.display(),
                fallback = %fallback.display(),
                "Primary field config missing, using fallback"
            );
            fallback
        } else {
            return Err(FieldConfigError::NotFound {
                primary: primary.to_path_buf(),
                fallback: fallback.to_path_buf(),
            });
        };

        let text = std::fs::read_to_string(path).map_err(|source| FieldConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text).map_err(|e| match e {
            FieldConfigError::Parse { source, .. } => FieldConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;

        info!(
            path = %path.display(),
            sensor_keys = config.sensor_keys.len(),
            model_keys = config.model_keys.len(),
            mapped_fields = config.sensor_fields.len(),
            "Loaded field config"
        );

        Ok(config)
    }

    /// Parse and validate a field config document.
    pub fn from_json(text: &str) -> Result<Self, FieldConfigError> {
        let raw: RawFieldConfig =
            serde_json::from_str(text).map_err(|source| FieldConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;

        let sensor_keys: HashSet<String> = raw.valid_keys.sensor.into_iter().collect();
        let model_keys: HashSet<String> = raw.valid_keys.model.into_iter().collect();

        let mut sensor_fields = BTreeMap::new();
        for (logical, wire_key) in raw.sensor_fields {
            let field = SensorField::from_name(&logical).ok_or_else(|| {
                FieldConfigError::UnknownField {
                    name: logical.clone(),
                    accepted: SensorField::ALL
                        .iter()
                        .map(|f| f.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                }
            })?;

            if !sensor_keys.contains(&wire_key) {
                warn!(
                    field = %field,
                    wire_key = %wire_key,
                    "Mapped wire key is not whitelisted for sensor records and will always be empty"
                );
            }
            sensor_fields.insert(field, wire_key);
        }

        Ok(Self {
            sensor_keys,
            model_keys,
            sensor_fields,
        })
    }

    /// Whitelisted wire keys for the given record kind.
    pub fn valid_keys(&self, kind: RecordKind) -> &HashSet<String> {
        match kind {
            RecordKind::Sensor => &self.sensor_keys,
            RecordKind::Model => &self.model_keys,
        }
    }

    /// Wire key mapped to a logical field, if any.
    pub fn wire_key(&self, field: SensorField) -> Option<&str> {
        self.sensor_fields.get(&field).map(String::as_str)
    }
}

/// Canonical sensor reading extracted from a whitelisted record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub light: Option<i64>,
    pub frame: Option<Value>,
    pub image_path: Option<String>,
    pub timestamp_ms: Option<i64>,
    pub device_id: Option<String>,
}

/// Name and payload of a model record.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub name: String,
    pub output: Value,
}

impl ModelOutput {
    /// Text stored in the `model_outputs.output` column.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Resolves inbound records against the configured whitelist and mapping.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    config: FieldConfig,
}

impl FieldMapper {
    pub fn new(config: FieldConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    /// Keep only the keys whitelisted for `kind`.
    pub fn filter(&self, record: &InboundRecord, kind: RecordKind) -> Map<String, Value> {
        let allowed = self.config.valid_keys(kind);
        record
            .fields()
            .iter()
            .filter(|(k, _)| allowed.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Logical-name view of a filtered sensor record. Unmapped or absent wire
    /// keys yield `None`.
    pub fn logical_values(&self, filtered: &Map<String, Value>) -> BTreeMap<SensorField, Option<Value>> {
        SensorField::ALL
            .into_iter()
            .map(|field| {
                let value = self
                    .config
                    .wire_key(field)
                    .and_then(|key| filtered.get(key))
                    .filter(|v| !v.is_null())
                    .cloned();
                (field, value)
            })
            .collect()
    }

    /// Typed sensor reading from a raw record.
    pub fn sensor_reading(&self, record: &InboundRecord) -> SensorReading {
        let filtered = self.filter(record, RecordKind::Sensor);
        let mut values = self.logical_values(&filtered);
        let mut take = |field: SensorField| values.remove(&field).flatten();

        let temperature = take(SensorField::Temperature);
        let light = take(SensorField::Light);
        let frame = take(SensorField::Frame);
        let image_path = take(SensorField::ImagePath);
        let timestamp = take(SensorField::Timestamp);
        let device_id = take(SensorField::DeviceId);

        SensorReading {
            temperature: coerce(SensorField::Temperature, temperature, as_f64),
            light: coerce(SensorField::Light, light, as_truncated_i64),
            frame,
            image_path: coerce(SensorField::ImagePath, image_path, as_non_empty_string),
            timestamp_ms: coerce(SensorField::Timestamp, timestamp, as_truncated_i64),
            device_id: coerce(SensorField::DeviceId, device_id, as_non_empty_string),
        }
    }

    /// Name and output of a model record. Missing names become "unknown".
    pub fn model_output(&self, record: &InboundRecord) -> ModelOutput {
        let filtered = self.filter(record, RecordKind::Model);

        let name = ["name", "model_name"]
            .iter()
            .filter_map(|key| filtered.get(*key))
            .find(|v| is_truthy(v))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "unknown".to_string());

        let output = match filtered.get("output") {
            Some(v) if !v.is_null() => v.clone(),
            _ => filtered.get("result").cloned().unwrap_or(Value::Null),
        };

        ModelOutput { name, output }
    }
}

fn coerce<T>(field: SensorField, value: Option<Value>, f: fn(&Value) -> Option<T>) -> Option<T> {
    let value = value?;
    let coerced = f(&value);
    if coerced.is_none() {
        debug!(field = %field, value = %value, "Ignoring value of unexpected type");
    }
    coerced
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_truncated_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_non_empty_string(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

/// Presence test used for classification: null, false, 0, "", [] and {} are absent.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
pub(crate) const TEST_FIELD_CONFIG: &str = r#"{
    "valid_keys": {
        "sensor": ["temperature_c", "light", "frame", "image_path", "timestamp_ms", "device_id"],
        "model": ["name", "model_name", "output", "result"]
    },
    "sensor_fields": {
        "temperature": "temperature_c",
        "light": "light",
        "frame": "frame",
        "image_path": "image_path",
        "timestamp": "timestamp_ms",
        "device_id": "device_id"
    }
}"#;

#[cfg(test)]
pub(crate) fn test_mapper() -> FieldMapper {
    FieldMapper::new(FieldConfig::from_json(TEST_FIELD_CONFIG).unwrap())
}
