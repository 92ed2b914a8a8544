//! Cachestor - Process-Wide Orchestrator
//!
//! Binds user computations to the cache handler: generates keys from a
//! stable function identity and arguments, dispatches `read_or_fill`, and
//! exposes invalidation, health, metrics, and teardown. Constructed from a
//! [`CacheConfig`] preset via the builder; construction has no side
//! effects beyond connecting the configured collaborators.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{CacheBackend, RedisBackend};
use crate::bus::{InvalidationBus, RedisBus};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::handler::{BoxError, CacheHandler};
use crate::key::{CacheKey, KeyGenerator};
use crate::l1::L1Stats;
use crate::lock::{FillLock, LocalFillLock, RedisFillLock};
use crate::metrics::MetricsSnapshot;
use crate::reliability::{CircuitState, OpClass};
use crate::value::Value;

/// Redis pub/sub channel carrying invalidation events
const INVALIDATION_CHANNEL: &str = "cachestor:invalidation";

/// Front door over one configured cache pipeline.
///
/// Cheap to clone behind `Arc`; all state lives in the handler.
pub struct Cachestor {
    handler: Arc<CacheHandler>,
    keygen: KeyGenerator,
    namespace: String,
}

/// Assembles a [`Cachestor`] from configuration plus optional injected
/// collaborators. Anything not injected is derived from the config: a
/// `redis_url` yields the Redis backend, lock, and bus; no URL and no
/// backend yields an L1-only cache with a process-local lock.
pub struct CachestorBuilder {
    config: CacheConfig,
    backend: Option<Arc<dyn CacheBackend>>,
    lock: Option<Arc<dyn FillLock>>,
    bus: Option<Arc<dyn InvalidationBus>>,
}

impl CachestorBuilder {
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn FillLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn build(self) -> Result<Cachestor> {
        let CachestorBuilder {
            config,
            mut backend,
            mut lock,
            mut bus,
        } = self;
        config.validate()?;

        if backend.is_none() {
            if let Some(url) = config.redis_url.as_deref() {
                let client = redis::Client::open(url)
                    .map_err(|e| Error::Config(format!("invalid redis URL: {e}")))?;
                let manager = redis::aio::ConnectionManager::new(client.clone())
                    .await
                    .map_err(|e| Error::Connection {
                        operation: "connect",
                        key_hint: String::new(),
                        reason: e.to_string(),
                    })?;
                backend = Some(Arc::new(RedisBackend::from_manager(manager.clone())));
                if lock.is_none() && config.lock.enabled {
                    lock = Some(Arc::new(RedisFillLock::new(manager)));
                }
                if bus.is_none() && config.invalidation_enabled {
                    bus = Some(Arc::new(RedisBus::new(client, INVALIDATION_CHANNEL)));
                }
            }
        }

        if lock.is_none() && config.lock.enabled {
            // Without a shared transport the single-fill guarantee shrinks
            // to this process
            lock = Some(Arc::new(LocalFillLock::new()));
        }

        let namespace = config.namespace.clone();
        let handler = CacheHandler::new(config, backend, lock, bus).await?;
        Ok(Cachestor {
            handler,
            keygen: KeyGenerator::new(),
            namespace,
        })
    }
}

impl Cachestor {
    /// Start assembling a cache from a configuration preset.
    pub fn builder(config: CacheConfig) -> CachestorBuilder {
        CachestorBuilder {
            config,
            backend: None,
            lock: None,
            bus: None,
        }
    }

    /// Shorthand: configuration only, collaborators derived from it.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    // =========================================================================
    // Memoization
    // =========================================================================

    /// Memoize `loader` under `(identity, args)` in the configured
    /// namespace with the configured TTL.
    ///
    /// `identity` must be stable across runs and deployments; it is part
    /// of the key.
    pub async fn get_or_compute<L, Fut>(
        &self,
        identity: &str,
        args: &[Value],
        loader: L,
    ) -> Result<Value>
    where
        L: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        let key = self.key_for(identity, args, &BTreeMap::new(), None)?;
        self.handler.read_or_fill(&key, None, loader).await
    }

    /// Full-control variant: named arguments, per-call TTL, and a
    /// namespace override.
    pub async fn get_or_compute_full<L, Fut>(
        &self,
        identity: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        ttl: Option<Duration>,
        namespace: Option<&str>,
        loader: L,
    ) -> Result<Value>
    where
        L: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        let key = self.key_for(identity, args, kwargs, namespace)?;
        self.handler.read_or_fill(&key, ttl, loader).await
    }

    /// Run the pipeline under a caller-managed key.
    pub async fn read_or_fill<L, Fut>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        loader: L,
    ) -> Result<Value>
    where
        L: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        self.handler.read_or_fill(key, ttl, loader).await
    }

    /// The composite key `get_or_compute` would use.
    pub fn key_for(
        &self,
        identity: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        namespace: Option<&str>,
    ) -> Result<CacheKey> {
        self.keygen.generate(
            identity,
            args,
            kwargs,
            Some(namespace.unwrap_or(&self.namespace)),
            true,
            self.handler.serializer().code(),
        )
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Invalidate one memoized call.
    pub async fn invalidate(&self, identity: &str, args: &[Value]) -> Result<bool> {
        let key = self.key_for(identity, args, &BTreeMap::new(), None)?;
        self.handler.invalidate(&key).await
    }

    /// Invalidate a pre-generated key.
    pub async fn invalidate_key(&self, key: &CacheKey) -> Result<bool> {
        self.handler.invalidate(key).await
    }

    /// Invalidate every local entry in a namespace and broadcast.
    pub async fn invalidate_namespace(&self, namespace: &str) -> usize {
        self.handler.invalidate_namespace(namespace).await
    }

    /// Drop the local tier entirely and broadcast.
    pub async fn clear(&self) -> usize {
        self.handler.invalidate_all().await
    }

    // =========================================================================
    // Introspection / lifecycle
    // =========================================================================

    /// Point-in-time health: L1 stats, a live backend probe, and every
    /// circuit's state.
    pub async fn health(&self) -> HealthReport {
        let backend_alive = match self.handler.backend() {
            Some(backend) => {
                let probe = self
                    .handler
                    .reliability()
                    .call(
                        &self.namespace,
                        OpClass::Read,
                        "exists",
                        backend.exists("cachestor:health:probe"),
                    )
                    .await;
                Some(probe.is_ok())
            }
            None => None,
        };

        HealthReport {
            l1: self.handler.l1().map(|l1| l1.stats()),
            backend_name: self.handler.backend().map(|b| b.name()),
            backend_alive,
            circuits: self.handler.reliability().circuit_states(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.handler.metrics().snapshot()
    }

    /// Direct handler access for embedding layers.
    pub fn handler(&self) -> &Arc<CacheHandler> {
        &self.handler
    }

    /// Stop the bus subscription and drain background refreshes.
    pub async fn shutdown(&self) {
        self.handler.shutdown().await;
    }
}

/// Snapshot returned by [`Cachestor::health`]
#[derive(Debug)]
pub struct HealthReport {
    pub l1: Option<L1Stats>,
    pub backend_name: Option<&'static str>,
    /// `None` when running L1-only
    pub backend_alive: Option<bool>,
    pub circuits: Vec<(String, OpClass, CircuitState)>,
}

impl HealthReport {
    /// Healthy means the backend (if any) answers and no circuit is open.
    pub fn is_healthy(&self) -> bool {
        self.backend_alive.unwrap_or(true)
            && self
                .circuits
                .iter()
                .all(|(_, _, state)| *state != CircuitState::Open)
    }
}

// =============================================================================
// Tests
// =============================================================================
