//! Inbound datagram decoding and classification.

use crate::fields::is_truthy;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while decoding a datagram.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Packet is not valid UTF-8 JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Packet is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

/// Kind of an inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Raw measurement: temperature, light, image
    Sensor,
    /// Output of an external inference process
    Model,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Sensor => "sensor",
            RecordKind::Model => "model",
        }
    }
}

/// Decoded body of one datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    fields: Map<String, Value>,
}

impl InboundRecord {
    /// Decode a datagram body. Anything other than a JSON object is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(fields) => Ok(Self { fields }),
            Value::Array(_) => Err(PacketError::NotAnObject("array")),
            Value::String(_) => Err(PacketError::NotAnObject("string")),
            Value::Number(_) => Err(PacketError::NotAnObject("number")),
            Value::Bool(_) => Err(PacketError::NotAnObject("bool")),
            Value::Null => Err(PacketError::NotAnObject("null")),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Classify the record.
    ///
    /// An explicit `type` of "model" or "sensor" wins. Otherwise a record with
    /// a `name` and an `output` or `result` is a model record, anything else
    /// is a sensor record.
    pub fn kind(&self) -> RecordKind {
        match self.fields.get("type").and_then(Value::as_str) {
            Some("model") => return RecordKind::Model,
            Some("sensor") => return RecordKind::Sensor,
            _ => {}
        }

        let present = |key: &str| self.fields.get(key).is_some_and(is_truthy);
        if present("name") && (present("output") || present("result")) {
            RecordKind::Model
        } else {
            RecordKind::Sensor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            InboundRecord::decode(b"\xff\x00not json"),
            Err(PacketError::InvalidJson(_))
        ));
        assert!(matches!(
            InboundRecord::decode(b"[1, 2, 3]"),
            Err(PacketError::NotAnObject("array"))
        ));
    }

    #[test]
    fn test_explicit_type() {
        let rec =
            tokio_test::assert_ok!(InboundRecord::decode(br#"{"type": "model", "name": "m1"}"#));
        assert_eq!(rec.kind(), RecordKind::Model);

        let rec =
            InboundRecord::decode(br#"{"type": "sensor", "name": "m1", "output": 1}"#).unwrap();
        assert_eq!(rec.kind(), RecordKind::Sensor);
    }

    #[test]
    fn test_untyped_classification() {
        let rec = InboundRecord::decode(br#"{"name": "m1", "result": {"x": 1}}"#).unwrap();
        assert_eq!(rec.kind(), RecordKind::Model);

        // Empty output does not count as present
        let rec = InboundRecord::decode(br#"{"name": "m1", "output": ""}"#).unwrap();
        assert_eq!(rec.kind(), RecordKind::Sensor);

        let rec = InboundRecord::decode(br#"{"temperature_c": 21.5}"#).unwrap();
        assert_eq!(rec.kind(), RecordKind::Sensor);
    }
}
