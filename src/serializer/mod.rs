//! Serializer Strategies
//!
//! Pluggable codecs between the semantic container model and bytes. The
//! strategy in use stamps its format tag into the stored envelope; on read,
//! a tag that does not match the configured strategy is a
//! [`SerializerMismatch`](crate::Error::SerializerMismatch), which the read
//! path treats as a miss.

mod columnar;
mod json;
mod raw;
mod standard;

pub use columnar::ColumnarSerializer;
pub use json::JsonSerializer;
pub use raw::RawNumericSerializer;
pub use standard::StandardSerializer;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::value::Value;

/// Output of a serializer: the encoded bytes plus the metadata the envelope
/// codec needs.
#[derive(Debug, Clone)]
pub struct SerializedPayload {
    /// Encoded value
    pub bytes: Bytes,
    /// Whether the envelope codec should attempt LZ4 (the raw-numeric path
    /// emits already-dense bytes and opts out)
    pub compressible: bool,
}

/// Strategy contract: domain value to bytes and back.
pub trait Serializer: Send + Sync {
    /// Opaque identifier stamped into the envelope
    fn format_tag(&self) -> &'static str;

    /// One-character code folded into cache keys
    fn code(&self) -> char;

    /// Encode a value. Fails loudly on inputs outside the strategy's model.
    fn serialize(&self, value: &Value) -> Result<SerializedPayload>;

    /// Decode bytes previously produced by `serialize`.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// Built-in strategy selection, used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SerializerKind {
    /// Schema-less MessagePack (default): full container model
    #[default]
    Standard,
    /// UTF-8 JSON; rejects binary blobs
    Json,
    /// Column-major tables; rejects non-tabular values
    Columnar,
    /// Typed header + raw little-endian bytes for dense numeric arrays
    RawNumeric,
}

impl SerializerKind {
    /// Instantiate the strategy.
    pub fn build(self) -> Arc<dyn Serializer> {
        match self {
            SerializerKind::Standard => Arc::new(StandardSerializer::new()),
            SerializerKind::Json => Arc::new(JsonSerializer::new()),
            SerializerKind::Columnar => Arc::new(ColumnarSerializer::new()),
            SerializerKind::RawNumeric => Arc::new(RawNumericSerializer::new()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SerializerKind::Standard => "standard",
            SerializerKind::Json => "json",
            SerializerKind::Columnar => "columnar",
            SerializerKind::RawNumeric => "raw-numeric",
        }
    }
}

impl std::fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Tests
// =============================================================================
