//! Standard Serializer - Schema-less MessagePack
//!
//! The default strategy: encodes the full container model to native
//! MessagePack types. Documented round-trip collapses:
//!
//! - timestamps are written as RFC 3339 strings and decode as `Str`
//! - dense numeric arrays are written as plain arrays and decode as `Seq`
//! - any sequence decodes as an ordered `Seq` regardless of origin

use crate::error::{Error, Result};
use crate::value::Value;

use super::{SerializedPayload, Serializer};

/// Schema-less MessagePack codec for the full container model.
#[derive(Debug, Clone, Default)]
pub struct StandardSerializer;

impl StandardSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for StandardSerializer {
    fn format_tag(&self) -> &'static str {
        "msgpack"
    }

    fn code(&self) -> char {
        's'
    }

    fn serialize(&self, value: &Value) -> Result<SerializedPayload> {
        let bytes = rmp_serde::to_vec(value).map_err(|e| Error::Serialization {
            serializer: "msgpack",
            reason: e.to_string(),
        })?;
        Ok(SerializedPayload {
            bytes: bytes.into(),
            compressible: true,
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization {
            serializer: "msgpack",
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
