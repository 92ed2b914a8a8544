//! Redis Backend
//!
//! Default shared L2 tier. Connection pooling and reconnects are delegated
//! to the client's `ConnectionManager`; the core only maps transport
//! failures into the error taxonomy so the reliability envelope can
//! classify them (connection trouble and server-loading are transient,
//! auth and protocol faults are permanent).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind};

use crate::error::{Error, Result};

use super::CacheBackend;

/// Redis-backed byte store.
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid redis URL: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| map_redis_error(e, "connect", ""))?;
        Ok(Self { manager })
    }

    /// Wrap an existing connection manager (shared pools, tests).
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

/// Map a client error into the taxonomy the breaker understands.
pub(crate) fn map_redis_error(e: redis::RedisError, operation: &'static str, key: &str) -> Error {
    let key_hint: String = key.chars().take(64).collect();
    if e.is_timeout() {
        return Error::Timeout {
            operation,
            timeout_ms: 0,
        };
    }
    let transient = e.is_connection_refusal()
        || e.is_connection_dropped()
        || e.is_io_error()
        || e.is_cluster_error()
        || matches!(e.kind(), ErrorKind::BusyLoadingError | ErrorKind::TryAgain);
    if transient {
        Error::Connection {
            operation,
            key_hint,
            reason: e.to_string(),
        }
    } else {
        Error::PermanentBackend {
            operation,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| map_redis_error(e, "get", key))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                // PX keeps sub-second TTLs exact
                redis::cmd("SET")
                    .arg(key)
                    .arg(value.as_ref())
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| map_redis_error(e, "set", key))?;
            }
            None => {
                conn.set::<_, _, ()>(key, value.as_ref())
                    .await
                    .map_err(|e| map_redis_error(e, "set", key))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: u64 = conn
            .del(key)
            .await
            .map_err(|e| map_redis_error(e, "delete", key))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        conn.exists(key)
            .await
            .map_err(|e| map_redis_error(e, "exists", key))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// Tests
// =============================================================================
