//! Raw Numeric Serializer - Dense Array Fast Path
//!
//! For dense numeric arrays the generic codecs waste time: the data is
//! already as small as it gets and LZ4 rarely helps. This strategy emits a
//! four-byte typed header followed by raw little-endian element bytes, and
//! tells the envelope codec to skip compression.
//!
//! Layout:
//!
//! ```text
//! dtype(1) || reserved(3, zero) || element_count(8, LE) || elements(count * 8, LE)
//! ```

use crate::error::{Error, Result};
use crate::value::Value;

use super::{SerializedPayload, Serializer};

const DTYPE_F64: u8 = 0x01;
const DTYPE_I64: u8 = 0x02;

const HEADER_LEN: usize = 12;

/// Typed-header raw codec for `F64Array` / `I64Array` values.
#[derive(Debug, Clone, Default)]
pub struct RawNumericSerializer;

impl RawNumericSerializer {
    pub fn new() -> Self {
        Self
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Serialization {
        serializer: "raw",
        reason: reason.into(),
    }
}

impl Serializer for RawNumericSerializer {
    fn format_tag(&self) -> &'static str {
        "raw"
    }

    fn code(&self) -> char {
        'r'
    }

    fn serialize(&self, value: &Value) -> Result<SerializedPayload> {
        let (dtype, count) = match value {
            Value::F64Array(v) => (DTYPE_F64, v.len()),
            Value::I64Array(v) => (DTYPE_I64, v.len()),
            other => {
                return Err(Error::UnsupportedValue {
                    serializer: "raw",
                    reason: format!(
                        "expected a dense numeric array, found {}; use the msgpack serializer",
                        other.type_name()
                    ),
                })
            }
        };

        let mut out = Vec::with_capacity(HEADER_LEN + count * 8);
        out.push(dtype);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&(count as u64).to_le_bytes());
        match value {
            Value::F64Array(values) => {
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Value::I64Array(values) => {
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            _ => unreachable!(),
        }

        Ok(SerializedPayload {
            bytes: out.into(),
            // Already dense; the envelope stores these verbatim
            compressible: false,
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.len() < HEADER_LEN {
            return Err(malformed("truncated raw-numeric header"));
        }
        let dtype = bytes[0];
        if bytes[1..4] != [0, 0, 0] {
            return Err(malformed("non-zero reserved bytes in raw-numeric header"));
        }
        let count = u64::from_le_bytes(bytes[4..12].try_into().expect("sliced 8 bytes")) as usize;
        let body = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(8)
            .ok_or_else(|| malformed("element count overflow"))?;
        if body.len() != expected {
            return Err(malformed(format!(
                "raw-numeric body is {} bytes, header declares {}",
                body.len(),
                expected
            )));
        }

        match dtype {
            DTYPE_F64 => Ok(Value::F64Array(
                body.chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().expect("chunked 8 bytes")))
                    .collect(),
            )),
            DTYPE_I64 => Ok(Value::I64Array(
                body.chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().expect("chunked 8 bytes")))
                    .collect(),
            )),
            other => Err(malformed(format!("unknown raw-numeric dtype {other:#04x}"))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
