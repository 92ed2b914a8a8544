//! Cache Handler - Read/Write Orchestration
//!
//! Drives the full pipeline for one configured namespace: L1 lookup with
//! freshness handling, reliability-wrapped L2 traffic, the distributed
//! single-fill lock, the byte pipeline (serialize, envelope, encrypt), SWR
//! background refresh on a bounded worker pool, and the configured
//! degradation policy when the L2 tier fails.
//!
//! The handler moves opaque envelope bytes between tiers; decoding happens
//! at the edge, right before a value is returned. Bad cached bytes
//! (integrity, decryption, serializer mismatch, size guards) are treated
//! as misses on the read path and never poison L1.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::backend::CacheBackend;
use crate::bus::{InvalidationBus, InvalidationEvent, InvalidationKind};
use crate::config::{CacheConfig, FallbackPolicy};
use crate::encryption::Encryptor;
use crate::envelope::EnvelopeCodec;
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::l1::{Freshness, L1Store, Lookup};
use crate::lock::{acquire_with_timeout, AcquireOutcome, FillLock};
use crate::metrics::{CacheMetrics, LatencyTracker};
use crate::reliability::{OpClass, ReliabilityEnvelope};
use crate::serializer::Serializer;
use crate::value::Value;

/// Error type surfaced by user loaders
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type LoaderFuture = futures::future::BoxFuture<'static, std::result::Result<Value, BoxError>>;

/// Reusable loader handle; background refresh re-invokes it
type SharedLoader = Arc<dyn Fn() -> LoaderFuture + Send + Sync>;

/// Orchestrates the two-tier read/write pipeline.
pub struct CacheHandler {
    l1: Option<Arc<L1Store>>,
    backend: Option<Arc<dyn CacheBackend>>,
    reliability: ReliabilityEnvelope,
    serializer: Arc<dyn Serializer>,
    codec: EnvelopeCodec,
    encryptor: Option<Encryptor>,
    lock: Option<Arc<dyn FillLock>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    /// Bounded SWR refresh pool; a saturated pool skips the refresh
    refresh_gate: Arc<Semaphore>,
    refresh_workers: usize,
    metrics: Arc<CacheMetrics>,
    config: CacheConfig,
    /// Identifies this process on the invalidation bus
    source_id: String,
    subscription: Mutex<Option<JoinHandle<()>>>,
    /// Handle to ourselves for spawned tasks (set by `Arc::new_cyclic`)
    self_ref: Weak<CacheHandler>,
}

impl CacheHandler {
    /// Build a handler and, when a bus is attached and enabled, start its
    /// invalidation subscription.
    pub async fn new(
        config: CacheConfig,
        backend: Option<Arc<dyn CacheBackend>>,
        lock: Option<Arc<dyn FillLock>>,
        bus: Option<Arc<dyn InvalidationBus>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let mut id_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id_bytes);

        let handler = Arc::new_cyclic(|weak| Self {
            l1: config
                .l1_enabled
                .then(|| Arc::new(L1Store::with_config(config.l1.clone()))),
            backend,
            reliability: ReliabilityEnvelope::new(config.reliability.clone(), Arc::clone(&metrics)),
            serializer: config.serializer.build(),
            codec: EnvelopeCodec::new(),
            encryptor: config
                .encryption
                .as_ref()
                .map(|enc| Encryptor::new(enc.master_key.clone(), enc.rotated_keys.clone())),
            lock,
            bus: bus.clone(),
            refresh_gate: Arc::new(Semaphore::new(config.refresh_workers)),
            refresh_workers: config.refresh_workers,
            metrics,
            source_id: hex::encode(id_bytes),
            subscription: Mutex::new(None),
            self_ref: weak.clone(),
            config,
        });

        if handler.config.invalidation_enabled {
            if let Some(bus) = bus {
                handler.start_subscription(bus).await?;
            }
        }

        Ok(handler)
    }

    /// Serializer in use (for key metadata).
    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer.as_ref()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn l1(&self) -> Option<&L1Store> {
        self.l1.as_deref()
    }

    pub fn reliability(&self) -> &ReliabilityEnvelope {
        &self.reliability
    }

    pub fn backend(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.backend.as_ref()
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Return the cached value for `key`, or compute, store, and return it.
    ///
    /// `ttl` overrides the configured default. Loader errors propagate
    /// unchanged and are never cached; cache-layer failures follow the
    /// configured fallback policy.
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
        let loader: SharedLoader = Arc::new(move || Box::pin(loader()));
        let ttl = ttl.unwrap_or(self.config.ttl);
        let now = Instant::now();

        // L1 first
        if let Some(l1) = &self.l1 {
            let tracker = LatencyTracker::start();
            match l1.get(key.as_str(), now) {
                Lookup::Hit {
                    bytes,
                    freshness: Freshness::Fresh,
                    ..
                } => {
                    self.metrics.record_l1_read_latency(tracker.elapsed());
                    match self.decode(&bytes, key) {
                        Ok(value) => {
                            self.metrics.record_l1_hit();
                            return Ok(value);
                        }
                        Err(e) if e.is_decode_failure() => {
                            self.note_decode_failure(key, &e);
                            l1.invalidate(key.as_str());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Lookup::Hit {
                    bytes,
                    freshness: Freshness::Stale,
                    version,
                } if self.config.l1.swr_enabled => {
                    self.metrics.record_l1_read_latency(tracker.elapsed());
                    match self.decode(&bytes, key) {
                        Ok(value) => {
                            self.metrics.record_l1_stale_hit();
                            if l1.mark_refreshing(key.as_str(), version) {
                                self.spawn_refresh(key.clone(), ttl, version, Arc::clone(&loader));
                            }
                            // The caller never blocks on the refresh
                            return Ok(value);
                        }
                        Err(e) if e.is_decode_failure() => {
                            self.note_decode_failure(key, &e);
                            l1.invalidate(key.as_str());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Lookup::Hit { .. } => {
                    // Stale with SWR disabled: treated as a miss; the entry
                    // stays available for stale_on_error
                }
                Lookup::Miss => {}
            }
            self.metrics.record_l1_miss();
        }

        self.fill(key, ttl, &loader).await
    }

    /// L2 lookup and, on miss, the lock-protected fill.
    async fn fill(&self, key: &CacheKey, ttl: Duration, loader: &SharedLoader) -> Result<Value> {
        // L2 get
        match self.l2_get(key).await {
            Ok(Some(bytes)) => {
                self.metrics.record_l2_hit();
                match self.decode(&bytes, key) {
                    Ok(value) => {
                        self.l1_put(key, bytes, ttl);
                        return Ok(value);
                    }
                    Err(e) if e.is_decode_failure() => {
                        // Bad cached bytes: fall through to recompute
                        self.note_decode_failure(key, &e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(None) => {
                if self.backend.is_some() {
                    self.metrics.record_l2_miss();
                }
            }
            Err(e) if e.is_cache_layer() => {
                return self.apply_fallback(e, key, loader).await;
            }
            Err(e) => return Err(e),
        }

        // Still missing: single-fill under the distributed lock. While
        // polling for it, a waiter watches L1; the moment the current
        // holder's fill lands, it settles without ever taking the lock.
        let guard = match (&self.lock, self.config.lock.enabled) {
            (Some(lock), true) => {
                let outcome = acquire_with_timeout(
                    lock.as_ref(),
                    &key.lock_name(),
                    self.config.lock.ttl,
                    self.config.lock.acquire_timeout,
                    || self.l1_fresh_value(key).transpose(),
                )
                .await;
                match outcome {
                    Ok(AcquireOutcome::Acquired(guard)) => {
                        self.metrics.record_lock_acquisition();
                        Some(guard)
                    }
                    Ok(AcquireOutcome::Settled(result)) => return result,
                    Ok(AcquireOutcome::TimedOut) => {
                        // Documented degradation: a stampede window is
                        // accepted rather than failing the request
                        self.metrics.record_lock_timeout();
                        tracing::warn!(key = key.hint(), "fill lock timed out; filling unlocked");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(
                            key = key.hint(),
                            error = %e,
                            "fill lock unavailable; filling unlocked"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let result = self.locked_fill(key, ttl, loader, guard.is_some()).await;

        if let (Some(lock), Some(guard)) = (&self.lock, guard) {
            if let Err(e) = lock.release(guard).await {
                tracing::debug!(key = key.hint(), error = %e, "lock release failed; TTL will reap it");
            }
        }

        result
    }

    /// Double-check both tiers, then run the loader and store the result.
    async fn locked_fill(
        &self,
        key: &CacheKey,
        ttl: Duration,
        loader: &SharedLoader,
        locked: bool,
    ) -> Result<Value> {
        // Another holder may have filled the cache while we waited
        if locked {
            if let Some(value) = self.l1_fresh_value(key)? {
                return Ok(value);
            }
            match self.l2_get(key).await {
                Ok(Some(bytes)) => {
                    self.metrics.record_l2_hit();
                    match self.decode(&bytes, key) {
                        Ok(value) => {
                            self.l1_put(key, bytes, ttl);
                            return Ok(value);
                        }
                        Err(e) if e.is_decode_failure() => {
                            // Recompute below; the fresh fill overwrites
                            // the bad L2 copy
                            self.note_decode_failure(key, &e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_cache_layer() => {
                    return self.apply_fallback(e, key, loader).await;
                }
                Err(e) => return Err(e),
            }
        }

        // Invoke the user computation; its errors pass through unchanged
        let value = self.run_loader(loader).await?;

        let bytes = self.encode(&value, key)?;
        if let Err(e) = self.l2_set(key, bytes.clone(), ttl).await {
            if matches!(self.config.fallback, FallbackPolicy::FailClosed) && e.is_cache_layer() {
                return Err(e);
            }
            tracing::warn!(key = key.hint(), error = %e, "L2 write failed; serving computed value");
        }
        self.l1_put(key, bytes, ttl);
        Ok(value)
    }

    /// Degradation policy for cache-layer failures on the L2 path.
    async fn apply_fallback(
        &self,
        error: Error,
        key: &CacheKey,
        loader: &SharedLoader,
    ) -> Result<Value> {
        match self.config.fallback {
            FallbackPolicy::FailClosed => Err(error),
            FallbackPolicy::StaleOnError => {
                // Any not-yet-expired L1 entry (stale included) is better
                // than failing or recomputing
                if let Some(l1) = &self.l1 {
                    if let Lookup::Hit { bytes, .. } = l1.get(key.as_str(), Instant::now()) {
                        if let Ok(value) = self.decode(&bytes, key) {
                            self.metrics.record_stale_served_on_error();
                            tracing::warn!(
                                key = key.hint(),
                                error = %error,
                                "L2 unavailable; serving stale L1 entry"
                            );
                            return Ok(value);
                        }
                    }
                }
                self.fail_open(error, key, loader).await
            }
            FallbackPolicy::FailOpen => self.fail_open(error, key, loader).await,
        }
    }

    /// Compute without caching; cache failures never break callers.
    async fn fail_open(
        &self,
        error: Error,
        key: &CacheKey,
        loader: &SharedLoader,
    ) -> Result<Value> {
        self.metrics.record_fail_open_load();
        tracing::warn!(
            key = key.hint(),
            error = %error,
            "cache layer unavailable; executing loader uncached"
        );
        self.run_loader(loader).await
    }

    async fn run_loader(&self, loader: &SharedLoader) -> Result<Value> {
        let tracker = LatencyTracker::start();
        self.metrics.record_load();
        match loader().await {
            Ok(value) => {
                self.metrics.record_load_latency(tracker.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.metrics.record_load_failure();
                Err(Error::Application(e))
            }
        }
    }

    // =========================================================================
    // Background refresh
    // =========================================================================

    /// Re-execute the fill off the caller's path. The refresh result only
    /// lands if the entry still carries the captured version.
    fn spawn_refresh(&self, key: CacheKey, ttl: Duration, version: u64, loader: SharedLoader) {
        let Ok(permit) = Arc::clone(&self.refresh_gate).try_acquire_owned() else {
            // Pool saturated (or shutting down): the stale read stands
            self.metrics.record_refresh_skip();
            if let Some(l1) = &self.l1 {
                l1.clear_refreshing(key.as_str(), version);
            }
            return;
        };

        let Some(handler) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let _permit = permit;

            let value = match loader().await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(key = key.hint(), error = %e, "background refresh loader failed");
                    handler.metrics.record_load_failure();
                    if let Some(l1) = &handler.l1 {
                        l1.clear_refreshing(key.as_str(), version);
                    }
                    return;
                }
            };

            let bytes = match handler.encode(&value, &key) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(key = key.hint(), error = %e, "background refresh encode failed");
                    if let Some(l1) = &handler.l1 {
                        l1.clear_refreshing(key.as_str(), version);
                    }
                    return;
                }
            };

            // Refresh updates L2 too; an L2 failure does not waste the
            // freshly computed content locally
            if let Err(e) = handler.l2_set(&key, bytes.clone(), ttl).await {
                tracing::warn!(key = key.hint(), error = %e, "background refresh L2 write failed");
            }

            if let Some(l1) = &handler.l1 {
                if l1.complete_refresh(key.as_str(), version, bytes, ttl, Instant::now()) {
                    handler.metrics.record_refresh();
                } else {
                    // A concurrent write advanced the version; discard
                    handler.metrics.record_refresh_discard();
                }
            }
        });
    }

    // =========================================================================
    // Byte pipeline
    // =========================================================================

    /// serialize -> envelope -> (encrypt): the bytes stored in both tiers.
    fn encode(&self, value: &Value, key: &CacheKey) -> Result<Bytes> {
        let payload = self.serializer.serialize(value)?;
        let envelope = self
            .codec
            .store(&payload.bytes, self.serializer.format_tag(), payload.compressible)?;
        match &self.encryptor {
            Some(enc) => enc.encrypt(&envelope, key.namespace(), key.as_str()),
            None => Ok(envelope),
        }
    }

    /// (decrypt) -> unframe -> check tag -> deserialize.
    fn decode(&self, bytes: &Bytes, key: &CacheKey) -> Result<Value> {
        let envelope = match &self.encryptor {
            Some(enc) => enc.decrypt(bytes, key.namespace(), key.as_str())?,
            None => bytes.clone(),
        };
        let (plaintext, format_tag) = self.codec.retrieve(&envelope)?;
        if format_tag != self.serializer.format_tag() {
            return Err(Error::SerializerMismatch {
                expected: self.serializer.format_tag().to_string(),
                found: format_tag,
            });
        }
        self.serializer.deserialize(&plaintext)
    }

    /// Fresh-hit L1 lookup plus decode, shared by the lock-wait poll and
    /// the post-acquire double-check. A poisoned entry (decode failure) is
    /// counted, logged, and evicted instead of being silently re-decoded
    /// until its TTL runs out.
    fn l1_fresh_value(&self, key: &CacheKey) -> Result<Option<Value>> {
        let Some(l1) = &self.l1 else {
            return Ok(None);
        };
        let Lookup::Hit {
            bytes,
            freshness: Freshness::Fresh,
            ..
        } = l1.get(key.as_str(), Instant::now())
        else {
            return Ok(None);
        };
        match self.decode(&bytes, key) {
            Ok(value) => {
                self.metrics.record_l1_hit();
                Ok(Some(value))
            }
            Err(e) if e.is_decode_failure() => {
                self.note_decode_failure(key, &e);
                l1.invalidate(key.as_str());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn note_decode_failure(&self, key: &CacheKey, error: &Error) {
        self.metrics.record_decode_failure();
        tracing::warn!(
            key = key.hint(),
            error = %error,
            "cached bytes failed to decode; treating as miss"
        );
    }

    // =========================================================================
    // L2 plumbing
    // =========================================================================

    async fn l2_get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let tracker = LatencyTracker::start();
        let result = self
            .reliability
            .call(key.namespace(), OpClass::Read, "get", backend.get(key.as_str()))
            .await;
        if result.is_ok() {
            self.metrics.record_l2_read_latency(tracker.elapsed());
        }
        result
    }

    async fn l2_set(&self, key: &CacheKey, bytes: Bytes, ttl: Duration) -> Result<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let tracker = LatencyTracker::start();
        let result = self
            .reliability
            .call(
                key.namespace(),
                OpClass::Write,
                "set",
                backend.set(key.as_str(), bytes, Some(ttl)),
            )
            .await;
        if result.is_ok() {
            self.metrics.record_l2_write_latency(tracker.elapsed());
        }
        result
    }

    fn l1_put(&self, key: &CacheKey, bytes: Bytes, ttl: Duration) {
        if let Some(l1) = &self.l1 {
            l1.put(key.as_str(), key.namespace(), bytes, ttl, Instant::now());
        }
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove `key` from L1 and L2 and broadcast the event.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let mut existed = false;
        if let Some(l1) = &self.l1 {
            existed |= l1.invalidate(key.as_str());
        }
        if let Some(backend) = &self.backend {
            existed |= self
                .reliability
                .call(
                    key.namespace(),
                    OpClass::Write,
                    "delete",
                    backend.delete(key.as_str()),
                )
                .await?;
        }
        self.metrics.record_local_invalidation();
        self.publish(InvalidationEvent::key(key.as_str(), &self.source_id))
            .await;
        Ok(existed)
    }

    /// Drop every L1 entry in a namespace and broadcast. L2 entries are
    /// left to their TTLs; the shared tier has no namespace scan.
    pub async fn invalidate_namespace(&self, namespace: &str) -> usize {
        let count = self
            .l1
            .as_ref()
            .map(|l1| l1.invalidate_namespace(namespace))
            .unwrap_or(0);
        self.metrics.record_local_invalidation();
        self.publish(InvalidationEvent::namespace(namespace, &self.source_id))
            .await;
        count
    }

    /// Drop the entire L1 tier and broadcast.
    pub async fn invalidate_all(&self) -> usize {
        let count = self.l1.as_ref().map(|l1| l1.invalidate_all()).unwrap_or(0);
        self.metrics.record_local_invalidation();
        self.publish(InvalidationEvent::all(&self.source_id)).await;
        count
    }

    async fn publish(&self, event: InvalidationEvent) {
        if !self.config.invalidation_enabled {
            return;
        }
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish(event).await {
                // Best-effort: peers converge by TTL if the bus is down
                tracing::warn!(error = %e, "invalidation publish failed");
            }
        }
    }

    async fn start_subscription(&self, bus: Arc<dyn InvalidationBus>) -> Result<()> {
        let mut rx = bus.subscribe().await?;
        // The task holds a weak handle so a dropped handler shuts it down
        let weak = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(handler) = weak.upgrade() else { break };
                if event.source_id == handler.source_id {
                    continue;
                }
                let Some(l1) = &handler.l1 else { continue };
                match event.kind {
                    InvalidationKind::Key => {
                        l1.invalidate(&event.target);
                    }
                    InvalidationKind::Namespace => {
                        l1.invalidate_namespace(&event.target);
                    }
                    InvalidationKind::All => {
                        l1.invalidate_all();
                    }
                }
                handler.metrics.record_remote_invalidation();
                tracing::debug!(?event.kind, target = %event.target, "applied remote invalidation");
            }
        });
        *self.subscription.lock() = Some(handle);
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop the bus subscription and drain in-flight background refreshes.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
        }
        // Collecting every worker permit waits out running refreshes and
        // starves future ones
        let _drained = self
            .refresh_gate
            .acquire_many(self.refresh_workers as u32)
            .await;
        self.refresh_gate.close();
    }
}


// =============================================================================
// Tests
// =============================================================================
