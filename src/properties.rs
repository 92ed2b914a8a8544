//! Property-Based Tests for the Byte Pipeline
//!
//! Uses proptest to verify the pipeline invariants across arbitrary
//! inputs:
//!
//! 1. **Roundtrip**: deserialize(serialize(v)) = v for admissible values
//! 2. **Envelope integrity**: any single-bit flip is detected
//! 3. **Key determinism**: equal inputs fingerprint equally, and the
//!    fingerprint is insensitive to mapping insertion order
//! 4. **Encryption authenticity**: tampered or mis-keyed ciphertext
//!    never opens

#![cfg(test)]

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use crate::encryption::{Encryptor, MasterKey};
use crate::envelope::EnvelopeCodec;
use crate::error::Error;
use crate::key::KeyGenerator;
use crate::serializer::{Serializer, StandardSerializer};
use crate::value::Value;

// =============================================================================
// Strategies
// =============================================================================

/// Scalar values admissible to every strategy.
fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        // Finite floats only; NaN breaks equality, infinities are admissible
        prop::num::f64::NORMAL.prop_map(Value::Float),
        ".{0,32}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(|b| Value::Bytes(Bytes::from(b))),
    ]
}

/// Recursive value trees: scalars, sequences, and string-keyed maps.
fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 48, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Seq),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..8).prop_map(Value::Map),
        ]
    })
}

fn kwargs_strategy() -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map("[a-z_]{1,12}", scalar_strategy(), 0..6)
}

// =============================================================================
// Roundtrip
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_standard_serializer_roundtrip(value in value_strategy()) {
        let serializer = StandardSerializer::new();
        let payload = serializer.serialize(&value).unwrap();
        let decoded = serializer.deserialize(&payload.bytes).unwrap();
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn prop_envelope_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(&payload, "msgpack", true).unwrap();
        let (recovered, tag) = codec.retrieve(&envelope).unwrap();
        prop_assert_eq!(recovered.as_ref(), payload.as_slice());
        prop_assert_eq!(tag.as_str(), "msgpack");
    }
}

// =============================================================================
// Envelope integrity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_envelope_detects_any_bit_flip(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        flip_seed in any::<u64>(),
    ) {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(&payload, "s", true).unwrap();

        // Flip one bit in the checksum or compressed payload region
        // (header offset: version 1 + varint 1 + tag 1)
        let tamper_region = 3..envelope.len();
        let bit_count = (tamper_region.len() * 8) as u64;
        let target_bit = (flip_seed % bit_count) as usize;

        let mut tampered = envelope.to_vec();
        tampered[3 + target_bit / 8] ^= 1 << (target_bit % 8);

        match codec.retrieve(&tampered) {
            Ok((recovered, _)) => {
                // A flip inside `original_size` can only be accepted if it
                // leaves the payload parse identical; anything recovered
                // must equal the original
                prop_assert_eq!(recovered.as_ref(), payload.as_slice());
            }
            Err(_) => {}
        }
    }

    #[test]
    fn prop_payload_or_checksum_flip_is_rejected(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        flip_seed in any::<u64>(),
    ) {
        let codec = EnvelopeCodec::new();
        let envelope = codec.store(&payload, "s", true).unwrap();

        // Checksum sits at bytes 3..11; payload follows original_size at 15
        let checksum_bits = 8 * 8;
        let payload_bits = (envelope.len() - 15) * 8;
        let target = (flip_seed % (checksum_bits + payload_bits) as u64) as usize;
        let byte_index = if target < checksum_bits {
            3 + target / 8
        } else {
            15 + (target - checksum_bits) / 8
        };

        let mut tampered = envelope.to_vec();
        tampered[byte_index] ^= 1 << (target % 8);

        prop_assert!(codec.retrieve(&tampered).is_err());
    }
}

// =============================================================================
// Key determinism
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_fingerprint_is_deterministic(
        args in prop::collection::vec(scalar_strategy(), 0..6),
        kwargs in kwargs_strategy(),
    ) {
        // NaN floats are rejected by design; skip them
        prop_assume!(!args.iter().any(|v| matches!(v, Value::Float(f) if f.is_nan())));

        let a = KeyGenerator::new().fingerprint(&args, &kwargs).unwrap();
        let b = KeyGenerator::new().fingerprint(&args, &kwargs).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), 32);
    }

    #[test]
    fn prop_distinct_args_rarely_collide(
        a in any::<i64>(),
        b in any::<i64>(),
    ) {
        prop_assume!(a != b);
        let kwargs = BTreeMap::new();
        let fp_a = KeyGenerator::new().fingerprint(&[Value::Int(a)], &kwargs).unwrap();
        let fp_b = KeyGenerator::new().fingerprint(&[Value::Int(b)], &kwargs).unwrap();
        prop_assert_ne!(fp_a, fp_b);
    }
}

// =============================================================================
// Encryption authenticity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_encryption_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        key_byte in any::<u8>(),
    ) {
        let enc = Encryptor::new(MasterKey::from_bytes(vec![key_byte; 32]).unwrap(), vec![]);
        let sealed = enc.encrypt(&plaintext, "ns", "cache-key").unwrap();
        let opened = enc.decrypt(&sealed, "ns", "cache-key").unwrap();
        prop_assert_eq!(opened.as_ref(), plaintext.as_slice());
    }

    #[test]
    fn prop_tampered_ciphertext_never_opens(
        plaintext in prop::collection::vec(any::<u8>(), 1..512),
        flip_seed in any::<u64>(),
    ) {
        let enc = Encryptor::new(MasterKey::from_bytes(vec![0x5a; 32]).unwrap(), vec![]);
        let sealed = enc.encrypt(&plaintext, "ns", "cache-key").unwrap();

        let bit = (flip_seed % (sealed.len() as u64 * 8)) as usize;
        let mut tampered = sealed.to_vec();
        tampered[bit / 8] ^= 1 << (bit % 8);

        let result = matches!(
            enc.decrypt(&tampered, "ns", "cache-key"),
            Err(Error::Decryption { .. })
        );
        prop_assert!(result);
    }

    #[test]
    fn prop_wrong_aad_never_opens(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        other_key in "[a-z]{1,24}",
    ) {
        prop_assume!(other_key != "cache-key");
        let enc = Encryptor::new(MasterKey::from_bytes(vec![0x5a; 32]).unwrap(), vec![]);
        let sealed = enc.encrypt(&plaintext, "ns", "cache-key").unwrap();
        prop_assert!(enc.decrypt(&sealed, "ns", &other_key).is_err());
    }
}
