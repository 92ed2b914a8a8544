//! JSON Serializer
//!
//! Faster path for JSON-compatible data; output is UTF-8 text, so cached
//! values stay greppable in the L2 store. Binary blobs are rejected up
//! front instead of being smuggled through as number arrays.
//!
//! Round-trip collapses mirror the standard strategy: timestamps decode as
//! strings, dense arrays as sequences.

use crate::error::{Error, Result};
use crate::value::Value;

use super::{SerializedPayload, Serializer};

/// UTF-8 JSON codec; rejects binary values.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }

    fn reject_binary(value: &Value) -> Result<()> {
        match value {
            Value::Bytes(_) => Err(Error::UnsupportedValue {
                serializer: "json",
                reason: "binary blobs are not JSON-representable; use the msgpack serializer"
                    .into(),
            }),
            Value::Seq(items) => items.iter().try_for_each(Self::reject_binary),
            Value::Map(entries) => entries.values().try_for_each(Self::reject_binary),
            _ => Ok(()),
        }
    }
}

impl Serializer for JsonSerializer {
    fn format_tag(&self) -> &'static str {
        "json"
    }

    fn code(&self) -> char {
        'j'
    }

    fn serialize(&self, value: &Value) -> Result<SerializedPayload> {
        Self::reject_binary(value)?;
        let bytes = serde_json::to_vec(value).map_err(|e| Error::Serialization {
            serializer: "json",
            reason: e.to_string(),
        })?;
        Ok(SerializedPayload {
            bytes: bytes.into(),
            compressible: true,
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization {
            serializer: "json",
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
