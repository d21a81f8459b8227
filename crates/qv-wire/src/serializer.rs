//! Message serialization.
//!
//! The reference implementation is JSON. A configured maximum message
//! size is enforced on both directions; oversized payloads fail with a
//! serialization error rather than truncating.

use serde::{de::DeserializeOwned, Serialize};

use qv_common::QuiverError;

#[derive(Debug, Clone, Default)]
pub struct SerializerConfig {
    /// Maximum encoded size in bytes; `None` means unlimited.
    pub max_message_size: Option<usize>,
}

/// Typed serialization boundary. `deserialize_value` covers callers that
/// only know the payload shape at runtime.
pub trait MessageSerializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> qv_common::Result<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> qv_common::Result<T>;

    fn deserialize_value(&self, bytes: &[u8]) -> qv_common::Result<serde_json::Value>;

    fn content_type(&self) -> &'static str;
}

#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    config: SerializerConfig,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SerializerConfig) -> Self {
        Self { config }
    }

    fn check_size(&self, size: usize) -> qv_common::Result<()> {
        if let Some(max) = self.config.max_message_size {
            if size > max {
                return Err(QuiverError::Serialization(format!(
                    "message size {size} exceeds limit {max}"
                )));
            }
        }
        Ok(())
    }
}

impl MessageSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> qv_common::Result<Vec<u8>> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| QuiverError::Serialization(e.to_string()))?;
        self.check_size(bytes.len())?;
        Ok(bytes)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> qv_common::Result<T> {
        self.check_size(bytes.len())?;
        serde_json::from_slice(bytes).map_err(|e| QuiverError::Serialization(e.to_string()))
    }

    fn deserialize_value(&self, bytes: &[u8]) -> qv_common::Result<serde_json::Value> {
        self.deserialize(bytes)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trip_preserves_value() {
        let serializer = JsonSerializer::new();
        let sample = Sample {
            name: "widget".into(),
            count: 7,
        };
        let bytes = serializer.serialize(&sample).unwrap();
        let back: Sample = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn size_limit_applies_both_ways() {
        let serializer = JsonSerializer::with_config(SerializerConfig {
            max_message_size: Some(8),
        });
        let sample = Sample {
            name: "much too large".into(),
            count: 7,
        };
        assert!(serializer.serialize(&sample).is_err());
        assert!(serializer.deserialize::<Sample>(b"{\"name\":\"x\",\"count\":1}").is_err());
    }

    #[test]
    fn runtime_typed_deserialization() {
        let serializer = JsonSerializer::new();
        let value = serializer
            .deserialize_value(b"{\"kind\":\"unknown\"}")
            .unwrap();
        assert_eq!(value["kind"], "unknown");
    }
}
