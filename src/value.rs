//! Semantic Container Model
//!
//! The fixed value vocabulary the cache moves through its serializers:
//! primitives, ordered sequences, string-keyed mappings, a promoted UTC
//! timestamp scalar, and dense numeric arrays for the raw fast path.
//!
//! Domain types (ORM rows, framework models) are deliberately NOT detected;
//! callers convert to this model explicitly and serializers fail loudly on
//! anything outside it.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};

/// A cacheable value in the fixed container model.
///
/// Mappings use `BTreeMap` so key order is canonical; sequence order is
/// significant. Round trips through the serializers collapse some
/// distinctions (tuples become sequences, timestamps may come back as
/// RFC 3339 strings); each serializer documents its own collapses.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer
    Int(i64),
    /// IEEE-754 double
    Float(f64),
    /// UTF-8 text
    Str(String),
    /// Opaque binary
    Bytes(Bytes),
    /// Promoted scalar: timezone-fixed instant, canonicalized to RFC 3339
    Timestamp(DateTime<Utc>),
    /// Ordered sequence
    Seq(Vec<Value>),
    /// String-keyed mapping, canonical key order
    Map(BTreeMap<String, Value>),
    /// Dense f64 array (raw-numeric fast path)
    F64Array(Vec<f64>),
    /// Dense i64 array (raw-numeric fast path)
    I64Array(Vec<i64>),
}

impl Value {
    /// RFC 3339 rendering used wherever a timestamp is promoted to text.
    pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Seq(_) => "seq",
            Value::Map(_) => "map",
            Value::F64Array(_) => "f64-array",
            Value::I64Array(_) => "i64-array",
        }
    }

    /// Whether this value is a scalar (no nested structure).
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            Value::Seq(_) | Value::Map(_) | Value::F64Array(_) | Value::I64Array(_)
        )
    }

    /// Convenience constructor for a string value.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Convenience constructor for a map value.
    pub fn map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Value::Map(entries.into_iter().collect())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

// =============================================================================
// Serde bridge
// =============================================================================
//
// Values serialize to the *native* types of the target format (MessagePack
// map/array/bin, JSON object/array), not to a tagged enum encoding. This is
// what makes the stored bytes schema-less, and it is also where the
// documented round-trip collapses come from: timestamps come back as
// strings, dense arrays come back as sequences, and sequences of any origin
// come back as `Seq`.

impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::{SerializeMap, SerializeSeq};
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::Timestamp(ts) => serializer.serialize_str(&Value::format_timestamp(ts)),
            Value::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::F64Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for v in values {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::I64Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for v in values {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> serde::de::Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a cacheable value (primitive, sequence, or string-keyed map)")
            }

            fn visit_unit<E>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D>(self, d: D) -> std::result::Result<Value, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                d.deserialize_any(ValueVisitor)
            }

            fn visit_bool<E>(self, v: bool) -> std::result::Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Value, E> {
                Ok(Value::Int(v))
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Value, E>
            where
                E: serde::de::Error,
            {
                i64::try_from(v)
                    .map(Value::Int)
                    .map_err(|_| E::custom(format!("integer {v} overflows i64")))
            }

            fn visit_f64<E>(self, v: f64) -> std::result::Result<Value, E> {
                Ok(Value::Float(v))
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Value, E> {
                Ok(Value::Str(v.to_string()))
            }

            fn visit_string<E>(self, v: String) -> std::result::Result<Value, E> {
                Ok(Value::Str(v))
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Value, E> {
                Ok(Value::Bytes(Bytes::copy_from_slice(v)))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
                Ok(Value::Bytes(Bytes::from(v)))
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element::<Value>()? {
                    items.push(item);
                }
                Ok(Value::Seq(items))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut entries = BTreeMap::new();
                while let Some((k, v)) = map.next_entry::<String, Value>()? {
                    entries.insert(k, v);
                }
                Ok(Value::Map(entries))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

// =============================================================================
// Tests
// =============================================================================
