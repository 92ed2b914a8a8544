//! Byte Envelope Codec
//!
//! Frames serialized payloads into the opaque value stored in both cache
//! tiers. The wire format is bit-exact; changing it breaks cache
//! compatibility across the fleet:
//!
//! ```text
//! version(1) || fmt_len(varint) || fmt_tag(fmt_len) || checksum(8, LE) ||
//! original_size(4, LE) || compressed_payload(*)
//! ```
//!
//! The payload is LZ4-compressed unless it is small or incompressible, in
//! which case it is stored verbatim (`compressed_len == original_size`
//! signals pass-through). The checksum is xxh3-64 over the compressed
//! payload. `original_size` bounds decompression; together with the ratio
//! guard it rejects decompression bombs before any allocation.

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

/// Current envelope version byte
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Hard cap on the declared decompressed size (512 MiB)
pub const MAX_UNCOMPRESSED: u64 = 512 * 1024 * 1024;

/// Hard cap on `original_size / compressed_len`
pub const MAX_COMPRESSION_RATIO: u64 = 100;

/// Payloads below this size are stored uncompressed; LZ4 overhead
/// dominates at these sizes.
pub const COMPRESSION_MIN_BYTES: usize = 64;

/// Envelope codec configuration
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Maximum declared decompressed size accepted on retrieve
    pub max_uncompressed: u64,
    /// Maximum accepted `original_size / compressed_len` ratio
    pub max_ratio: u64,
    /// Minimum payload size worth compressing
    pub compression_min_bytes: usize,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_uncompressed: MAX_UNCOMPRESSED,
            max_ratio: MAX_COMPRESSION_RATIO,
            compression_min_bytes: COMPRESSION_MIN_BYTES,
        }
    }
}

/// Frames and unframes cache payloads.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    config: EnvelopeConfig,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EnvelopeConfig) -> Self {
        Self { config }
    }

    /// Frame `plaintext` under `format_tag`.
    ///
    /// `compressible: false` skips LZ4 entirely (the raw-numeric serializer
    /// emits already-dense bytes).
    pub fn store(&self, plaintext: &[u8], format_tag: &str, compressible: bool) -> Result<Bytes> {
        if plaintext.len() as u64 > self.config.max_uncompressed {
            return Err(Error::SizeLimitExceeded {
                declared: plaintext.len() as u64,
                limit: self.config.max_uncompressed,
            });
        }

        let payload: Vec<u8> = if compressible && plaintext.len() >= self.config.compression_min_bytes
        {
            match lz4::block::compress(plaintext, None, false) {
                // Pass through when compression does not pay for itself
                Ok(compressed) if compressed.len() < plaintext.len() => compressed,
                Ok(_) => plaintext.to_vec(),
                Err(e) => {
                    tracing::warn!("lz4 compression failed, storing uncompressed: {e}");
                    plaintext.to_vec()
                }
            }
        } else {
            plaintext.to_vec()
        };

        let checksum = xxh3_64(&payload);
        let tag_bytes = format_tag.as_bytes();

        let mut out = Vec::with_capacity(1 + 5 + tag_bytes.len() + 8 + 4 + payload.len());
        out.push(ENVELOPE_VERSION);
        write_varint(&mut out, tag_bytes.len() as u64);
        out.extend_from_slice(tag_bytes);
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(Bytes::from(out))
    }

    /// Unframe an envelope back into `(plaintext, format_tag)`.
    ///
    /// All failures are reported; none are silently recovered.
    pub fn retrieve(&self, envelope: &[u8]) -> Result<(Bytes, String)> {
        let mut cursor = Cursor::new(envelope);

        let version = cursor.take_u8()?;
        if version != ENVELOPE_VERSION {
            return Err(Error::MalformedEnvelope(format!(
                "unknown envelope version {version:#04x}"
            )));
        }

        let tag_len = cursor.take_varint()?;
        if tag_len > 255 {
            return Err(Error::MalformedEnvelope(format!(
                "format tag length {tag_len} is implausible"
            )));
        }
        let tag_bytes = cursor.take_bytes(tag_len as usize)?;
        let format_tag = std::str::from_utf8(tag_bytes)
            .map_err(|_| Error::MalformedEnvelope("format tag is not UTF-8".into()))?
            .to_string();

        let checksum = u64::from_le_bytes(cursor.take_array::<8>()?);
        let original_size = u32::from_le_bytes(cursor.take_array::<4>()?) as u64;
        let payload = cursor.rest();

        // Decompression-bomb guards run before any checksum or allocation
        if original_size > self.config.max_uncompressed {
            return Err(Error::SizeLimitExceeded {
                declared: original_size,
                limit: self.config.max_uncompressed,
            });
        }
        let ratio = original_size / std::cmp::max(1, payload.len() as u64);
        if ratio > self.config.max_ratio {
            return Err(Error::SizeLimitExceeded {
                declared: original_size,
                limit: payload.len() as u64 * self.config.max_ratio,
            });
        }

        let actual = xxh3_64(payload);
        if actual != checksum {
            return Err(Error::Integrity {
                expected: checksum,
                actual,
            });
        }

        // compressed_len == original_size marks a pass-through payload
        if payload.len() as u64 == original_size {
            return Ok((Bytes::copy_from_slice(payload), format_tag));
        }

        let decompressed = lz4::block::decompress(payload, Some(original_size as i32))
            .map_err(|e| Error::Decompression(e.to_string()))?;
        if decompressed.len() as u64 != original_size {
            return Err(Error::MalformedEnvelope(format!(
                "decompressed to {} bytes, envelope declared {}",
                decompressed.len(),
                original_size
            )));
        }
        Ok((Bytes::from(decompressed), format_tag))
    }

    /// Peek the format tag without decompressing. The handler uses this to
    /// detect serializer mismatches before paying for decompression.
    pub fn peek_format_tag(&self, envelope: &[u8]) -> Result<String> {
        let mut cursor = Cursor::new(envelope);
        let version = cursor.take_u8()?;
        if version != ENVELOPE_VERSION {
            return Err(Error::MalformedEnvelope(format!(
                "unknown envelope version {version:#04x}"
            )));
        }
        let tag_len = cursor.take_varint()?;
        let tag_bytes = cursor.take_bytes(tag_len as usize)?;
        std::str::from_utf8(tag_bytes)
            .map(str::to_string)
            .map_err(|_| Error::MalformedEnvelope("format tag is not UTF-8".into()))
    }
}

/// Unsigned LEB128, matching the varint in the wire format.
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Bounds-checked reader over the envelope bytes.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::MalformedEnvelope("truncated envelope".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.take_u8()?;
            if shift >= 63 && byte > 1 {
                return Err(Error::MalformedEnvelope("varint overflow".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::MalformedEnvelope("truncated envelope".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take_bytes(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(slice);
        Ok(arr)
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const COMPRESSIBLE: &[u8] = b"the quick brown fox jumps over the lazy dog \
        the quick brown fox jumps over the lazy dog \
        the quick brown fox jumps over the lazy dog";

    #[test]
    fn test_roundtrip_compressible() {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(COMPRESSIBLE, "s", true).unwrap();
        assert!(envelope.len() < COMPRESSIBLE.len() + 32);

        let (plaintext, tag) = codec.retrieve(&envelope).unwrap();
        assert_eq!(plaintext.as_ref(), COMPRESSIBLE);
        assert_eq!(tag, "s");
    }

    #[test]
    fn test_roundtrip_small_passthrough() {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(b"tiny", "j", true).unwrap();
        let (plaintext, tag) = codec.retrieve(&envelope).unwrap();
        assert_eq!(plaintext.as_ref(), b"tiny");
        assert_eq!(tag, "j");
    }

    #[test]
    fn test_roundtrip_incompressible_passthrough() {
        let codec = EnvelopeCodec::new();
        let noise: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let envelope = codec.store(&noise, "r", false).unwrap();
        let (plaintext, _) = codec.retrieve(&envelope).unwrap();
        assert_eq!(plaintext.as_ref(), noise.as_slice());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let codec = EnvelopeCodec::new();
        let mut envelope = codec.store(COMPRESSIBLE, "s", true).unwrap().to_vec();
        envelope[0] = 0x7f;
        match codec.retrieve(&envelope) {
            Err(Error::MalformedEnvelope(_)) => {}
            other => panic!("expected MalformedEnvelope, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(COMPRESSIBLE, "s", true).unwrap();
        for cut in [0, 1, 3, 9, envelope.len() - 1] {
            let err = codec.retrieve(&envelope[..cut]);
            assert!(err.is_err(), "cut at {cut} should fail");
        }
    }

    #[test]
    fn test_payload_bitflip_is_integrity_error() {
        let codec = EnvelopeCodec::new();
        let mut envelope = codec.store(COMPRESSIBLE, "s", true).unwrap().to_vec();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        match codec.retrieve(&envelope) {
            Err(Error::Integrity { .. }) => {}
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[test]
    fn test_checksum_bitflip_is_integrity_error() {
        let codec = EnvelopeCodec::new();
        let mut envelope = codec.store(COMPRESSIBLE, "s", true).unwrap().to_vec();
        // version(1) + varint(1 for short tags) + tag(1) puts the checksum at offset 3
        envelope[3] ^= 0x80;
        match codec.retrieve(&envelope) {
            Err(Error::Integrity { .. }) => {}
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[test]
    fn test_decompression_bomb_declared_size() {
        let codec = EnvelopeCodec::new();
        // Hand-build an envelope declaring 2^31 decompressed bytes behind a
        // 4-byte payload.
        let payload = [0u8; 4];
        let mut envelope = vec![ENVELOPE_VERSION];
        write_varint(&mut envelope, 1);
        envelope.push(b's');
        envelope.extend_from_slice(&xxh3_64(&payload).to_le_bytes());
        envelope.extend_from_slice(&(2u32.pow(31)).to_le_bytes());
        envelope.extend_from_slice(&payload);

        match codec.retrieve(&envelope) {
            Err(Error::SizeLimitExceeded { declared, .. }) => {
                assert_eq!(declared, 2u64.pow(31));
            }
            other => panic!("expected SizeLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_compression_ratio_guard() {
        let codec = EnvelopeCodec::new();
        // Declared size is within the absolute cap but the ratio against the
        // 4-byte payload is far beyond 100x.
        let payload = [0u8; 4];
        let mut envelope = vec![ENVELOPE_VERSION];
        write_varint(&mut envelope, 1);
        envelope.push(b's');
        envelope.extend_from_slice(&xxh3_64(&payload).to_le_bytes());
        envelope.extend_from_slice(&(1024u32 * 1024).to_le_bytes());
        envelope.extend_from_slice(&payload);

        assert!(matches!(
            codec.retrieve(&envelope),
            Err(Error::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_peek_format_tag() {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(COMPRESSIBLE, "columnar", true).unwrap();
        assert_eq!(codec.peek_format_tag(&envelope).unwrap(), "columnar");
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(b"", "s", true).unwrap();
        let (plaintext, _) = codec.retrieve(&envelope).unwrap();
        assert!(plaintext.is_empty());
    }

    #[test]
    fn test_varint_roundtrip_multibyte() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xac, 0x02]);
        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.take_varint().unwrap(), 300);
    }
}
