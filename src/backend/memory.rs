//! In-Memory Backend
//!
//! DashMap-backed store for tests and single-process setups. TTLs are
//! enforced lazily on access.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Result;

use super::CacheBackend;

/// Process-local byte store; useful as an L2 stand-in under test.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, (Bytes, Option<Instant>)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, key: &str) -> Option<Bytes> {
        let (value, deadline) = {
            let entry = self.entries.get(key)?;
            entry.value().clone()
        };
        if matches!(deadline, Some(d) if Instant::now() > d) {
            self.entries.remove(key);
            return None;
        }
        Some(value)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// Tests
// =============================================================================
