//! Encryption Wrapper
//!
//! AES-256-GCM around the byte envelope, so the L2 store only ever sees
//! authenticated ciphertext. The cache key is bound in as AAD: a ciphertext
//! copied under a different key fails to open. Per-namespace data keys are
//! derived from a single master secret with HKDF-SHA256 and cached; the
//! master secret itself is never logged, serialized, or sent anywhere.
//!
//! Wire shape: `nonce(12) || AEAD_ct(envelope_len + 16)`.
//!
//! Nonces are a 64-bit per-process counter with a 32-bit random suffix, so
//! process restarts cannot collide with earlier nonces under the same
//! derived key.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use bytes::Bytes;
use dashmap::DashMap;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Minimum master secret length in bytes
pub const MIN_MASTER_KEY_LEN: usize = 32;

/// AES-GCM nonce length
const NONCE_LEN: usize = 12;

/// HKDF domain-separation salt; changing it re-keys every namespace
const KDF_SALT: &[u8] = b"cachestor.namespace-key.v1";

/// A master secret for envelope encryption. Kept zeroized in memory and
/// redacted from debug output.
#[derive(Clone)]
pub struct MasterKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl MasterKey {
    /// Construct from raw bytes; rejects secrets shorter than 32 bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_MASTER_KEY_LEN {
            return Err(Error::Config(format!(
                "master key must be at least {MIN_MASTER_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    /// Construct from a hex-encoded secret (the environment format).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|_| Error::Config("master key is not valid hex".into()))?;
        Self::from_bytes(bytes)
    }

    fn derive(&self, namespace: &str) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), &self.bytes);
        let mut okm = [0u8; 32];
        // Infallible for a 32-byte output with SHA-256
        hk.expand(namespace.as_bytes(), &mut okm)
            .unwrap_or_else(|_| unreachable!("32-byte HKDF output is always valid"));
        okm
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").field("bytes", &"<redacted>").finish()
    }
}

/// AEAD codec over envelopes, one instance per handler.
pub struct Encryptor {
    /// Current master plus retired masters, tried in order on decrypt.
    /// Entries written under a retired key expire naturally.
    masters: Vec<MasterKey>,
    /// Derived data keys per (master index, namespace)
    derived: DashMap<(usize, String), [u8; 32]>,
    /// Monotone nonce counter
    counter: AtomicU64,
    /// Per-process random nonce suffix
    suffix: [u8; 4],
}

impl Encryptor {
    /// `rotated` lists retired master keys still accepted for decryption.
    pub fn new(master: MasterKey, rotated: Vec<MasterKey>) -> Self {
        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);

        let mut masters = Vec::with_capacity(1 + rotated.len());
        masters.push(master);
        masters.extend(rotated);

        Self {
            masters,
            derived: DashMap::new(),
            counter: AtomicU64::new(0),
            suffix,
        }
    }

    fn data_key(&self, master_idx: usize, namespace: &str) -> [u8; 32] {
        if let Some(k) = self.derived.get(&(master_idx, namespace.to_string())) {
            return *k;
        }
        let key = self.masters[master_idx].derive(namespace);
        self.derived
            .insert((master_idx, namespace.to_string()), key);
        key
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&count.to_be_bytes());
        nonce[8..].copy_from_slice(&self.suffix);
        nonce
    }

    /// Seal an envelope under the namespace key, binding `cache_key` as AAD.
    pub fn encrypt(&self, envelope: &[u8], namespace: &str, cache_key: &str) -> Result<Bytes> {
        let key_bytes = self.data_key(0, namespace);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = self.next_nonce();

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: envelope,
                    aad: cache_key.as_bytes(),
                },
            )
            .map_err(|_| Error::Decryption {
                key_hint: truncate_hint(cache_key),
                reason: "AEAD seal failed".into(),
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(Bytes::from(out))
    }

    /// Open a sealed envelope. Tries the current master key first, then the
    /// rotation list. Any tag mismatch fails; plaintext is never returned on
    /// a failed authentication.
    pub fn decrypt(&self, data: &[u8], namespace: &str, cache_key: &str) -> Result<Bytes> {
        if data.len() < NONCE_LEN + 16 {
            return Err(Error::Decryption {
                key_hint: truncate_hint(cache_key),
                reason: format!("ciphertext too short ({} bytes)", data.len()),
            });
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        for master_idx in 0..self.masters.len() {
            let key_bytes = self.data_key(master_idx, namespace);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
            if let Ok(plaintext) = cipher.decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: cache_key.as_bytes(),
                },
            ) {
                return Ok(Bytes::from(plaintext));
            }
        }

        Err(Error::Decryption {
            key_hint: truncate_hint(cache_key),
            reason: "authentication tag mismatch".into(),
        })
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("masters", &self.masters.len())
            .field("derived_keys", &self.derived.len())
            .finish()
    }
}

fn truncate_hint(key: &str) -> String {
    key.chars().take(64).collect()
}

// =============================================================================
// Tests
// =============================================================================
