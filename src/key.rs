//! Cache Key Generation
//!
//! Derives a deterministic, fixed-width fingerprint from a stable function
//! identity, its arguments, and an optional namespace. Arguments are
//! normalized into a canonical MessagePack encoding (sorted mapping keys,
//! `-0.0` folded to `0.0`, timestamps as RFC 3339, dense arrays replaced by
//! a content hash) and digested with Blake2b-128, so the same call produces
//! a bit-equal fingerprint across processes and runs.
//!
//! The composite key is human-readable for operability:
//!
//! ```text
//! ns:{namespace}:func:{identity}:args:{fingerprint}:{ic}{serializer_code}
//! ```
//!
//! The prefix is advisory; equality is byte-equality on the full string.

use std::collections::BTreeMap;

use blake2::digest::consts::{U16, U32};
use blake2::{Blake2b, Digest};

use crate::error::{Error, Result};
use crate::value::Value;

type Blake2b128 = Blake2b<U16>;
type Blake2b256 = Blake2b<U32>;

/// Per-array byte cap for array-valued arguments
pub const ARRAY_MAX_BYTES: usize = 100_000;

/// Aggregate byte cap across all array-valued arguments of one call
pub const ARRAY_AGGREGATE_MAX: usize = 5_000_000;

/// Practical key length limit shared by common L2 stores
const MAX_KEY_LENGTH: usize = 250;

/// Prefix kept for readability when an overlong key is shortened
const KEY_PREFIX_LENGTH: usize = 50;

/// A fully composed cache key plus the metadata the handler needs from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    full: String,
    namespace: String,
}

impl CacheKey {
    /// Construct a key directly from its parts. Used by callers that manage
    /// their own key scheme; `generate` is the usual entry point.
    pub fn raw(full: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            full: full.into(),
            namespace: namespace.into(),
        }
    }

    /// The full composite key string (the identity of the entry).
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Namespace this key belongs to (invalidation and breaker scope).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the distributed fill lock guarding this key.
    pub fn lock_name(&self) -> String {
        format!("lock:{}", self.full)
    }

    /// Shortened rendering for logs and error context (never the payload).
    pub fn hint(&self) -> &str {
        let end = self
            .full
            .char_indices()
            .nth(64)
            .map(|(i, _)| i)
            .unwrap_or(self.full.len());
        &self.full[..end]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

/// Generates consistent cache keys from function identity and arguments.
#[derive(Debug, Default, Clone)]
pub struct KeyGenerator;

impl KeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate a cache key.
    ///
    /// `identity` must be stable across runs (e.g. `"billing.load_invoice"`);
    /// runtime reflection on the callable is deliberately not attempted.
    /// `integrity` records whether envelope checksumming is on, and
    /// `serializer_code` is the one-character code of the configured
    /// serializer; both are folded into the key so a configuration switch
    /// can never decode a foreign envelope.
    pub fn generate(
        &self,
        identity: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        namespace: Option<&str>,
        integrity: bool,
        serializer_code: char,
    ) -> Result<CacheKey> {
        let fingerprint = self.fingerprint(args, kwargs)?;

        let mut key = String::with_capacity(128);
        if let Some(ns) = namespace {
            key.push_str("ns:");
            key.push_str(ns);
            key.push(':');
        }
        key.push_str("func:");
        key.push_str(identity);
        key.push_str(":args:");
        key.push_str(&fingerprint);
        key.push(':');
        key.push(if integrity { '1' } else { '0' });
        key.push(serializer_code);

        Ok(CacheKey {
            full: normalize_key(&key),
            namespace: namespace.unwrap_or("default").to_string(),
        })
    }

    /// 32-hex-character Blake2b-128 fingerprint of the canonical argument
    /// encoding. Pure: same inputs give the same output everywhere.
    pub fn fingerprint(&self, args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<String> {
        let mut buf = Vec::with_capacity(256);
        let mut array_budget = ArrayBudget::default();

        // Canonical shape is a two-element array: [args, kwargs]
        rmp::encode::write_array_len(&mut buf, 2).map_err(encode_err)?;
        rmp::encode::write_array_len(&mut buf, args.len() as u32).map_err(encode_err)?;
        for arg in args {
            encode_canonical(arg, &mut buf, &mut array_budget)?;
        }
        rmp::encode::write_map_len(&mut buf, kwargs.len() as u32).map_err(encode_err)?;
        for (name, value) in kwargs {
            rmp::encode::write_str(&mut buf, name).map_err(encode_err)?;
            encode_canonical(value, &mut buf, &mut array_budget)?;
        }

        let mut hasher = Blake2b128::new();
        hasher.update(&buf);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Aggregate tracker for array bytes across one call's arguments.
#[derive(Default)]
struct ArrayBudget {
    seen: usize,
}

impl ArrayBudget {
    fn charge(&mut self, nbytes: usize) -> Result<()> {
        if nbytes > ARRAY_MAX_BYTES {
            return Err(Error::KeyGeneration(format!(
                "array argument too large ({nbytes} bytes, max {ARRAY_MAX_BYTES}); \
                 hash the array yourself and pass the digest instead"
            )));
        }
        self.seen += nbytes;
        if self.seen > ARRAY_AGGREGATE_MAX {
            return Err(Error::KeyGeneration(format!(
                "total array argument size exceeds {ARRAY_AGGREGATE_MAX} bytes"
            )));
        }
        Ok(())
    }
}

fn encode_err<E: std::fmt::Display>(e: E) -> Error {
    Error::KeyGeneration(format!("canonical encoding failed: {e}"))
}

/// Canonical MessagePack encoding of a value for fingerprinting.
///
/// Never invokes user-supplied hashing; every branch is a fixed rule.
fn encode_canonical(value: &Value, buf: &mut Vec<u8>, budget: &mut ArrayBudget) -> Result<()> {
    match value {
        Value::Null => {
            rmp::encode::write_nil(buf).map_err(encode_err)?;
        }
        Value::Bool(b) => {
            rmp::encode::write_bool(buf, *b).map_err(encode_err)?;
        }
        Value::Int(i) => {
            rmp::encode::write_sint(buf, *i).map_err(encode_err)?;
        }
        Value::Float(f) => {
            // -0.0 folds to 0.0 so the fingerprint is platform-stable
            let f = if *f == 0.0 { 0.0 } else { *f };
            if f.is_nan() {
                return Err(Error::KeyGeneration(
                    "NaN is not a valid cache key argument".into(),
                ));
            }
            rmp::encode::write_f64(buf, f).map_err(encode_err)?;
        }
        Value::Str(s) => {
            rmp::encode::write_str(buf, s).map_err(encode_err)?;
        }
        Value::Bytes(b) => {
            rmp::encode::write_bin(buf, b).map_err(encode_err)?;
        }
        Value::Timestamp(ts) => {
            rmp::encode::write_str(buf, &Value::format_timestamp(ts)).map_err(encode_err)?;
        }
        Value::Seq(items) => {
            rmp::encode::write_array_len(buf, items.len() as u32).map_err(encode_err)?;
            for item in items {
                encode_canonical(item, buf, budget)?;
            }
        }
        Value::Map(entries) => {
            // BTreeMap iteration order is the canonical (sorted) order
            rmp::encode::write_map_len(buf, entries.len() as u32).map_err(encode_err)?;
            for (k, v) in entries {
                rmp::encode::write_str(buf, k).map_err(encode_err)?;
                encode_canonical(v, buf, budget)?;
            }
        }
        Value::F64Array(values) => {
            budget.charge(values.len() * 8)?;
            encode_array_digest(buf, values.len(), "f64", |h| {
                for v in values {
                    let v = if *v == 0.0 { 0.0 } else { *v };
                    h.update(v.to_le_bytes());
                }
            })?;
        }
        Value::I64Array(values) => {
            budget.charge(values.len() * 8)?;
            encode_array_digest(buf, values.len(), "i64", |h| {
                for v in values {
                    h.update(v.to_le_bytes());
                }
            })?;
        }
    }
    Ok(())
}

/// Arrays are fingerprinted as `["__array_v1__", [len], dtype, hash]` with a
/// Blake2b-256 content hash over little-endian element bytes. The version
/// prefix leaves room for protocol evolution.
fn encode_array_digest(
    buf: &mut Vec<u8>,
    len: usize,
    dtype: &str,
    feed: impl FnOnce(&mut Blake2b256),
) -> Result<()> {
    let mut hasher = Blake2b256::new();
    feed(&mut hasher);
    let content_hash = hex::encode(hasher.finalize());

    rmp::encode::write_array_len(buf, 4).map_err(encode_err)?;
    rmp::encode::write_str(buf, "__array_v1__").map_err(encode_err)?;
    rmp::encode::write_array_len(buf, 1).map_err(encode_err)?;
    rmp::encode::write_uint(buf, len as u64).map_err(encode_err)?;
    rmp::encode::write_str(buf, dtype).map_err(encode_err)?;
    rmp::encode::write_str(buf, &content_hash).map_err(encode_err)?;
    Ok(())
}

/// Normalize a composed key for L2 stores: no whitespace or control
/// characters, bounded length. Overlong keys keep a readable prefix and
/// append a Blake2b-128 digest of the full key.
fn normalize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    if cleaned.len() <= MAX_KEY_LENGTH {
        return cleaned;
    }

    let mut hasher = Blake2b128::new();
    hasher.update(cleaned.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let prefix_end = cleaned
        .char_indices()
        .nth(KEY_PREFIX_LENGTH)
        .map(|(i, _)| i)
        .unwrap_or(cleaned.len());
    format!("{}:{}", &cleaned[..prefix_end], digest)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn gen() -> KeyGenerator {
        KeyGenerator::new()
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let args = vec![Value::Int(7), Value::Str("user".into())];
        let kwargs = BTreeMap::new();
        let a = gen().fingerprint(&args, &kwargs).unwrap();
        let b = gen().fingerprint(&args, &kwargs).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32); // 128-bit digest, hex
    }

    #[test]
    fn test_fingerprint_distinguishes_args() {
        let kwargs = BTreeMap::new();
        let a = gen().fingerprint(&[Value::Int(7)], &kwargs).unwrap();
        let b = gen().fingerprint(&[Value::Int(8)], &kwargs).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_kwarg_order_is_irrelevant() {
        let mut k1 = BTreeMap::new();
        k1.insert("b".to_string(), Value::Int(2));
        k1.insert("a".to_string(), Value::Int(1));
        let mut k2 = BTreeMap::new();
        k2.insert("a".to_string(), Value::Int(1));
        k2.insert("b".to_string(), Value::Int(2));
        assert_eq!(
            gen().fingerprint(&[], &k1).unwrap(),
            gen().fingerprint(&[], &k2).unwrap()
        );
    }

    #[test]
    fn test_negative_zero_folds_to_zero() {
        let kwargs = BTreeMap::new();
        let a = gen().fingerprint(&[Value::Float(0.0)], &kwargs).unwrap();
        let b = gen().fingerprint(&[Value::Float(-0.0)], &kwargs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_nan_is_rejected() {
        let kwargs = BTreeMap::new();
        let err = gen().fingerprint(&[Value::Float(f64::NAN)], &kwargs);
        assert!(err.is_err());
    }

    #[test]
    fn test_composite_key_shape() {
        let key = gen()
            .generate(
                "billing.load_invoice",
                &[Value::Int(42)],
                &BTreeMap::new(),
                Some("billing"),
                true,
                's',
            )
            .unwrap();
        let s = key.as_str();
        assert!(s.starts_with("ns:billing:func:billing.load_invoice:args:"));
        assert!(s.ends_with(":1s"));
        assert_eq!(key.namespace(), "billing");
    }

    #[test]
    fn test_key_without_namespace() {
        let key = gen()
            .generate("f", &[], &BTreeMap::new(), None, false, 'j')
            .unwrap();
        assert!(key.as_str().starts_with("func:f:args:"));
        assert!(key.as_str().ends_with(":0j"));
        assert_eq!(key.namespace(), "default");
    }

    #[test]
    fn test_overlong_key_is_shortened_deterministically() {
        let identity = "m".repeat(400);
        let k1 = gen()
            .generate(&identity, &[], &BTreeMap::new(), None, true, 's')
            .unwrap();
        let k2 = gen()
            .generate(&identity, &[], &BTreeMap::new(), None, true, 's')
            .unwrap();
        assert_eq!(k1, k2);
        assert!(k1.as_str().len() <= 250);
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let key = gen()
            .generate("mod func", &[], &BTreeMap::new(), None, true, 's')
            .unwrap();
        assert!(!key.as_str().contains(' '));
    }

    #[test]
    fn test_timestamp_arguments_hash_stably() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let kwargs = BTreeMap::new();
        let a = gen()
            .fingerprint(&[Value::Timestamp(ts)], &kwargs)
            .unwrap();
        let b = gen()
            .fingerprint(&[Value::Timestamp(ts)], &kwargs)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_array_argument_fingerprint() {
        let kwargs = BTreeMap::new();
        let a = gen()
            .fingerprint(&[Value::F64Array(vec![1.0, 2.0])], &kwargs)
            .unwrap();
        let b = gen()
            .fingerprint(&[Value::F64Array(vec![1.0, 2.5])], &kwargs)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_oversized_array_is_rejected() {
        let big = vec![0.0f64; (ARRAY_MAX_BYTES / 8) + 1];
        let err = gen().fingerprint(&[Value::F64Array(big)], &BTreeMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_aggregate_array_budget() {
        // Each array is under the per-array cap but together they exceed
        // the aggregate budget.
        let chunk = vec![0.0f64; ARRAY_MAX_BYTES / 8];
        let args: Vec<Value> = (0..51).map(|_| Value::F64Array(chunk.clone())).collect();
        let err = gen().fingerprint(&args, &BTreeMap::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_lock_name_derivation() {
        let key = CacheKey::raw("ns:a:func:f:args:x:1s", "a");
        assert_eq!(key.lock_name(), "lock:ns:a:func:f:args:x:1s");
    }
}
