//! Cachestor - Two-Tier Memoization Cache
//!
//! Memoizes the result of a user-supplied computation under a stable key,
//! storing encoded bytes in an in-process L1 (byte-bounded, TTL-aware,
//! LRU, stale-while-revalidate) and a pluggable L2 (Redis by default).
//! A distributed lock keeps recomputation to a single process across a
//! fleet; a circuit breaker, adaptive timeout, and admission control wrap
//! every L2 call; optional AES-256-GCM means the L2 store only ever sees
//! authenticated ciphertext.
//!
//! # Architecture
//!
//! ```text
//! read:  key -> L1 -> [reliability envelope] -> L2 -> decrypt ->
//!        unframe -> verify checksum -> deserialize -> value
//! fill:  distributed lock -> double-check -> loader() -> serialize ->
//!        compress -> checksum -> encrypt -> L2 set -> L1 put -> release
//! ```
//!
//! Invalidation fans out across processes on a pub/sub bus and clears L1
//! entries by key or namespace.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cachestor::{CacheConfig, Cachestor, Value};
//!
//! # async fn run() -> cachestor::Result<()> {
//! let cache = Cachestor::new(
//!     CacheConfig::production().with_env_overrides()?,
//! )
//! .await?;
//!
//! let user = cache
//!     .get_or_compute("users.load", &[Value::Int(7)], || async {
//!         Ok(Value::map([("id".to_string(), Value::Int(7))]))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`backend`] - L2 contract plus memory, file, and Redis stores
//! - [`bus`] - cross-process invalidation fan-out
//! - [`cache`] - the process-wide orchestrator and builder
//! - [`config`] - presets, environment overlay, validation
//! - [`encryption`] - AEAD wrapper and per-namespace key derivation
//! - [`envelope`] - compressed + checksummed byte framing
//! - [`error`] - error taxonomy
//! - [`handler`] - read/write pipeline and SWR scheduling
//! - [`key`] - deterministic key fingerprints
//! - [`l1`] - the in-process byte store
//! - [`lock`] - distributed single-fill lock
//! - [`metrics`] - counters and latency tracking
//! - [`reliability`] - breaker, adaptive timeout, admission control
//! - [`serializer`] - value codecs (MessagePack, JSON, columnar, raw)
//! - [`value`] - the semantic container model

pub mod backend;
pub mod bus;
pub mod cache;
pub mod config;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod key;
pub mod l1;
pub mod lock;
pub mod metrics;
mod properties;
pub mod reliability;
pub mod serializer;
pub mod value;

// Re-export the types most integrations touch
pub use backend::{CacheBackend, FileBackend, MemoryBackend, RedisBackend};
pub use bus::{InvalidationBus, InvalidationEvent, InvalidationKind, LocalBus, RedisBus};
pub use cache::{Cachestor, CachestorBuilder, HealthReport};
pub use config::{CacheConfig, EncryptionConfig, FallbackPolicy, LockConfig};
pub use encryption::MasterKey;
pub use error::{Error, Result};
pub use handler::{BoxError, CacheHandler};
pub use key::{CacheKey, KeyGenerator};
pub use l1::{Freshness, L1Config, L1Store, Lookup};
pub use lock::{FillLock, LocalFillLock, RedisFillLock};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use reliability::{CircuitState, OpClass};
pub use serializer::{Serializer, SerializerKind};
pub use value::Value;
