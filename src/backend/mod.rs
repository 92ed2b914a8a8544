//! L2 Backend Contract
//!
//! Four operations on a byte-keyed, byte-valued store. The backend never
//! interprets the bytes it holds; everything it sees is an opaque envelope
//! (ciphertext when encryption is on). Implementations own their
//! connection pooling and transport retries; the core only wraps them in
//! the reliability envelope.

mod file;
mod memory;
pub(crate) mod redis;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Shared, out-of-process byte store addressed by cache keys.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch the bytes under `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store bytes under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check presence without fetching.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Backend name for logs and health reports.
    fn name(&self) -> &'static str;
}
