//! Distributed Fill Lock
//!
//! Single-fill coordination on a cold key: before invoking the user
//! computation, the handler takes a lock named after the cache key so at
//! most one process in the fleet recomputes it. The lock value is a random
//! holder id, and release deletes only the holder's own lock; a crashed
//! holder's lock dies by TTL.
//!
//! Acquisition polls with a short backoff up to `acquire_timeout`. On
//! timeout the caller proceeds WITHOUT the lock - a bounded stampede is
//! preferred over failing the request.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::backend::redis::map_redis_error;
use crate::error::Result;

/// Poll interval while the lock is held elsewhere
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(50);

/// Proof of lock ownership; pass back to `release`.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    holder: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn new_holder_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fleet-wide mutual exclusion for cache fills.
#[async_trait]
pub trait FillLock: Send + Sync {
    /// Attempt to take the lock; `None` means another holder has it.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>>;

    /// Release the holder's own lock. Releasing a lock that already
    /// expired (and may have been re-acquired) is a no-op.
    async fn release(&self, guard: LockGuard) -> Result<()>;
}

/// Result of polling for the lock
#[derive(Debug)]
pub enum AcquireOutcome<T> {
    /// Lock taken; the caller owns the guard and must release it
    Acquired(LockGuard),
    /// `acquire_timeout` expired; the caller falls through to an unlocked
    /// fill (documented degradation)
    TimedOut,
    /// The per-poll check settled the request before the lock was taken
    Settled(T),
}

/// Poll for the lock until `acquire_timeout` elapses.
///
/// `while_waiting` runs between polls; the current holder usually fills
/// the cache, so a waiter that sees the result land can stop waiting. It
/// returns `Some` to settle the request without the lock.
pub async fn acquire_with_timeout<T>(
    lock: &dyn FillLock,
    name: &str,
    ttl: Duration,
    acquire_timeout: Duration,
    mut while_waiting: impl FnMut() -> Option<T>,
) -> Result<AcquireOutcome<T>> {
    let deadline = Instant::now() + acquire_timeout;
    loop {
        if let Some(guard) = lock.try_acquire(name, ttl).await? {
            return Ok(AcquireOutcome::Acquired(guard));
        }
        if let Some(settled) = while_waiting() {
            return Ok(AcquireOutcome::Settled(settled));
        }
        if Instant::now() + ACQUIRE_BACKOFF >= deadline {
            return Ok(AcquireOutcome::TimedOut);
        }
        tokio::time::sleep(ACQUIRE_BACKOFF).await;
    }
}

// =============================================================================
// Local Lock
// =============================================================================

/// Process-local lock table; the single-fill guarantee only spans this
/// process. Used with the memory and file backends.
#[derive(Debug, Default)]
pub struct LocalFillLock {
    held: DashMap<String, (String, Instant)>,
}

impl LocalFillLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FillLock for LocalFillLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let holder = new_holder_id();
        let now = Instant::now();

        let mut entry = self
            .held
            .entry(name.to_string())
            .or_insert_with(|| (holder.clone(), now + ttl));

        if entry.value().0 == holder {
            // We inserted it: lock taken
            return Ok(Some(LockGuard {
                name: name.to_string(),
                holder,
            }));
        }
        if now > entry.value().1 {
            // Previous holder's TTL lapsed; steal
            *entry.value_mut() = (holder.clone(), now + ttl);
            return Ok(Some(LockGuard {
                name: name.to_string(),
                holder,
            }));
        }
        Ok(None)
    }

    async fn release(&self, guard: LockGuard) -> Result<()> {
        self.held
            .remove_if(&guard.name, |_, value| value.0 == guard.holder);
        Ok(())
    }
}

// =============================================================================
// Redis Lock
// =============================================================================

/// Compare-and-delete so a holder can only release its own lock
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Fleet-wide lock on Redis: `SET name holder NX PX ttl`.
pub struct RedisFillLock {
    manager: ConnectionManager,
    release: Script,
}

impl RedisFillLock {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl FillLock for RedisFillLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let holder = new_holder_id();
        let mut conn = self.manager.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "lock-acquire", name))?;

        Ok(acquired.map(|_| LockGuard {
            name: name.to_string(),
            holder,
        }))
    }

    async fn release(&self, guard: LockGuard) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = self
            .release
            .key(&guard.name)
            .arg(&guard.holder)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "lock-release", &guard.name))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
