//! Cachestor Integration Tests
//!
//! End-to-end flows through the full pipeline:
//! - cold/warm reads and single-fill coordination
//! - stale-while-revalidate refresh semantics
//! - envelope and encryption defenses against bad cached bytes
//! - circuit breaker behavior and degradation policies
//! - cross-handler invalidation over the bus

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use cachestor::{
    BoxError, CacheBackend, CacheConfig, CacheKey, Cachestor, Error, FallbackPolicy, LocalBus,
    MasterKey, MemoryBackend, SerializerKind, Value,
};

// =============================================================================
// Test helpers
// =============================================================================

/// Backend wrapper that injects transient failures on demand.
struct FlakyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
}

impl FlakyBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &'static str) -> cachestor::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Connection {
                operation,
                key_hint: String::new(),
                reason: "injected failure".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn get(&self, key: &str) -> cachestor::Result<Option<Bytes>> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> cachestor::Result<()> {
        self.check("set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> cachestor::Result<bool> {
        self.check("delete")?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> cachestor::Result<bool> {
        self.check("exists")?;
        self.inner.exists(key).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

fn counting_loader(
    calls: Arc<AtomicU32>,
    value: Value,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Value, BoxError>> + Send + Sync + Clone + 'static
{
    move || {
        let calls = Arc::clone(&calls);
        let value = value.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }
}

/// Deterministic SWR timing: 400ms TTL, stale at 200ms, no jitter.
fn swr_config() -> CacheConfig {
    let mut config = CacheConfig::test();
    config.ttl = Duration::from_millis(400);
    config.l1.swr_ratio = 0.5;
    config.l1.swr_jitter = 0.0;
    config
}

// =============================================================================
// Cold/warm and single-fill
// =============================================================================

#[tokio::test]
async fn test_cold_then_warm_end_to_end() {
    let cache = Cachestor::builder(CacheConfig::test())
        .backend(Arc::new(MemoryBackend::new()))
        .build()
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let loader = counting_loader(
        Arc::clone(&calls),
        Value::map([("id".to_string(), Value::Int(7))]),
    );

    let first = cache
        .get_or_compute("users.load", &[Value::str("u:7")], loader.clone())
        .await
        .unwrap();
    assert_eq!(first, Value::map([("id".to_string(), Value::Int(7))]));

    let second = cache
        .get_or_compute("users.load", &[Value::str("u:7")], loader)
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "loader must run once");

    let snapshot = cache.metrics();
    assert_eq!(snapshot.loads, 1);
    assert_eq!(snapshot.l1_hits, 1);
}

#[tokio::test]
async fn test_concurrent_cold_reads_invoke_loader_once() {
    let cache = Arc::new(
        Cachestor::builder(CacheConfig::test())
            .backend(Arc::new(MemoryBackend::new()))
            .build()
            .await
            .unwrap(),
    );
    let calls = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute("slow.compute", &[Value::Int(1)], move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Value::Int(42))
                    }
                })
                .await
                .unwrap()
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), Value::Int(42));
    }
    // acquire_timeout (500ms) exceeds loader latency (100ms): single fill
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_process_reads_through_l2() {
    let backend = Arc::new(MemoryBackend::new());

    let writer = Cachestor::builder(CacheConfig::test())
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    writer
        .get_or_compute(
            "report.build",
            &[],
            counting_loader(Arc::clone(&calls), Value::str("rendered")),
        )
        .await
        .unwrap();

    // A second orchestrator with a cold L1 sees the L2 copy
    let reader = Cachestor::builder(CacheConfig::test())
        .backend(backend)
        .build()
        .await
        .unwrap();
    let value = reader
        .get_or_compute(
            "report.build",
            &[],
            counting_loader(Arc::clone(&calls), Value::str("recomputed")),
        )
        .await
        .unwrap();

    assert_eq!(value, Value::str("rendered"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(reader.metrics().l2_hits, 1);
}

// =============================================================================
// Stale-while-revalidate
// =============================================================================

#[tokio::test]
async fn test_stale_read_serves_old_value_and_refreshes() {
    let cache = Cachestor::builder(swr_config())
        .backend(Arc::new(MemoryBackend::new()))
        .build()
        .await
        .unwrap();

    let generation = Arc::new(AtomicU32::new(0));
    let loader = {
        let generation = Arc::clone(&generation);
        move || {
            let generation = Arc::clone(&generation);
            async move { Ok(Value::Int(generation.fetch_add(1, Ordering::SeqCst) as i64)) }
        }
    };

    // Fill: generation 0
    let first = cache
        .get_or_compute("feed.load", &[], loader.clone())
        .await
        .unwrap();
    assert_eq!(first, Value::Int(0));

    // Enter the stale window (stale at 200ms, expiry at 400ms)
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Stale read returns the OLD value immediately and kicks a refresh
    let stale = cache
        .get_or_compute("feed.load", &[], loader.clone())
        .await
        .unwrap();
    assert_eq!(stale, Value::Int(0), "stale read must not block on refresh");

    // Let the background refresh land
    tokio::time::sleep(Duration::from_millis(100)).await;
    let refreshed = cache
        .get_or_compute("feed.load", &[], loader.clone())
        .await
        .unwrap();
    assert_eq!(refreshed, Value::Int(1), "refresh output must be visible");

    let snapshot = cache.metrics();
    assert_eq!(snapshot.refreshes, 1);
    assert_eq!(snapshot.l1_stale_hits, 1);
}

#[tokio::test]
async fn test_refresh_does_not_extend_expiry() {
    let cache = Cachestor::builder(swr_config())
        .backend(Arc::new(MemoryBackend::new()))
        .build()
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let loader = counting_loader(Arc::clone(&calls), Value::str("content"));

    cache.get_or_compute("doc.load", &[], loader.clone()).await.unwrap();

    // Trigger a refresh inside the stale window
    tokio::time::sleep(Duration::from_millis(250)).await;
    cache.get_or_compute("doc.load", &[], loader.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2, "one fill plus one refresh");

    // The refresh renewed content but not the hard expiry: past the
    // original 400ms deadline the L1 entry must be gone
    tokio::time::sleep(Duration::from_millis(150)).await;
    let l1 = cache.handler().l1().unwrap();
    let lookup = l1.get(
        cache
            .key_for("doc.load", &[], &BTreeMap::new(), None)
            .unwrap()
            .as_str(),
        std::time::Instant::now(),
    );
    assert!(matches!(lookup, cachestor::Lookup::Miss));
}

#[tokio::test]
async fn test_only_one_refresh_per_stale_window() {
    let cache = Arc::new(
        Cachestor::builder(swr_config())
            .backend(Arc::new(MemoryBackend::new()))
            .build()
            .await
            .unwrap(),
    );

    let calls = Arc::new(AtomicU32::new(0));
    let loader = counting_loader(Arc::clone(&calls), Value::Int(1));

    cache.get_or_compute("hot.key", &[], loader.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // A burst of stale readers
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let loader = loader.clone();
        tasks.push(tokio::spawn(async move {
            cache.get_or_compute("hot.key", &[], loader).await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), Value::Int(1));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    // One fill plus exactly one background refresh
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Bad cached bytes
// =============================================================================

#[tokio::test]
async fn test_decompression_bomb_from_l2_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = Cachestor::builder(CacheConfig::test())
        .backend(backend.clone())
        .build()
        .await
        .unwrap();

    let key = cache
        .key_for("bomb.target", &[], &BTreeMap::new(), None)
        .unwrap();

    // Hand-built envelope declaring 2 GiB behind 4 payload bytes
    let payload = [0u8; 4];
    let mut bomb = vec![0x01];
    bomb.push(7); // fmt_len varint
    bomb.extend_from_slice(b"msgpack");
    bomb.extend_from_slice(&xxhash_rust::xxh3::xxh3_64(&payload).to_le_bytes());
    bomb.extend_from_slice(&(2u32.pow(31)).to_le_bytes());
    bomb.extend_from_slice(&payload);
    backend
        .set(key.as_str(), Bytes::from(bomb), None)
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let value = cache
        .read_or_fill(&key, None, counting_loader(Arc::clone(&calls), Value::Int(5)))
        .await
        .unwrap();

    // Treated as a miss: recomputed, bomb never admitted to L1
    assert_eq!(value, Value::Int(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().decode_failures, 1);
}

#[tokio::test]
async fn test_tampered_ciphertext_recomputes() {
    let backend = Arc::new(MemoryBackend::new());
    let master = MasterKey::from_bytes(vec![0x42u8; 32]).unwrap();

    let mut config = CacheConfig::secure(master.clone());
    config.l1.swr_jitter = 0.0;
    let writer = Cachestor::builder(config)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    writer
        .get_or_compute(
            "secrets.load",
            &[],
            counting_loader(Arc::clone(&calls), Value::str("classified")),
        )
        .await
        .unwrap();

    // Flip one bit of the stored ciphertext
    let key = writer
        .key_for("secrets.load", &[], &BTreeMap::new(), None)
        .unwrap();
    let mut stored = backend.get(key.as_str()).await.unwrap().unwrap().to_vec();
    let mid = stored.len() / 2;
    stored[mid] ^= 0x01;
    backend
        .set(key.as_str(), Bytes::from(stored), None)
        .await
        .unwrap();

    // A cold reader sees the tamper, treats it as a miss, repopulates
    let mut config = CacheConfig::secure(master);
    config.l1.swr_jitter = 0.0;
    let reader = Cachestor::builder(config)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let value = reader
        .get_or_compute(
            "secrets.load",
            &[],
            counting_loader(Arc::clone(&calls), Value::str("classified")),
        )
        .await
        .unwrap();

    assert_eq!(value, Value::str("classified"));
    assert_eq!(calls.load(Ordering::SeqCst), 2, "tamper must force recompute");

    // And the repopulated entry decrypts cleanly again
    let value = reader
        .get_or_compute(
            "secrets.load",
            &[],
            counting_loader(Arc::clone(&calls), Value::str("classified")),
        )
        .await
        .unwrap();
    assert_eq!(value, Value::str("classified"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_encrypted_backend_never_sees_plaintext() {
    let backend = Arc::new(MemoryBackend::new());
    let config = CacheConfig::secure(MasterKey::from_bytes(vec![0x11u8; 32]).unwrap());
    let cache = Cachestor::builder(config)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();

    let secret = "very-recognizable-secret-material";
    cache
        .get_or_compute("vault.read", &[], {
            let secret = secret.to_string();
            move || {
                let secret = secret.clone();
                async move { Ok(Value::Str(secret)) }
            }
        })
        .await
        .unwrap();

    let key = cache
        .key_for("vault.read", &[], &BTreeMap::new(), None)
        .unwrap();
    let stored = backend.get(key.as_str()).await.unwrap().unwrap();
    let needle = secret.as_bytes();
    let leaked = stored
        .windows(needle.len())
        .any(|window| window == needle);
    assert!(!leaked, "plaintext leaked into the L2 store");
}

#[tokio::test]
async fn test_serializer_mismatch_treated_as_miss() {
    let backend = Arc::new(MemoryBackend::new());
    let shared_key = CacheKey::raw("func:mismatch.demo:args:fixed:1s", "default");

    let msgpack_cache = Cachestor::builder(CacheConfig::test())
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    msgpack_cache
        .read_or_fill(
            &shared_key,
            None,
            counting_loader(Arc::clone(&calls), Value::Int(1)),
        )
        .await
        .unwrap();

    // Same raw key read by a JSON-configured cache: tag mismatch, miss
    let mut json_config = CacheConfig::test();
    json_config.serializer = SerializerKind::Json;
    let json_cache = Cachestor::builder(json_config)
        .backend(backend)
        .build()
        .await
        .unwrap();
    let value = json_cache
        .read_or_fill(
            &shared_key,
            None,
            counting_loader(Arc::clone(&calls), Value::Int(2)),
        )
        .await
        .unwrap();

    assert_eq!(value, Value::Int(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(json_cache.metrics().decode_failures, 1);
}

// =============================================================================
// Breaker and degradation
// =============================================================================

#[tokio::test]
async fn test_breaker_trips_and_recovers() {
    let backend = Arc::new(FlakyBackend::new());
    let mut config = CacheConfig::test();
    config.fallback = FallbackPolicy::FailClosed;
    config.reliability.breaker.failure_threshold = 5;
    config.reliability.breaker.recovery_timeout = Duration::from_millis(100);
    config.lock.enabled = false;

    let cache = Cachestor::builder(config)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let loader = || async { Ok(Value::Int(1)) };

    backend.set_failing(true);

    // Five transient failures feed the breaker
    for i in 0..5 {
        let result = cache
            .get_or_compute("flaky.op", &[Value::Int(i)], loader)
            .await;
        assert!(matches!(result, Err(Error::Connection { .. })), "call {i}");
    }

    // Sixth call short-circuits
    let result = cache.get_or_compute("flaky.op", &[Value::Int(9)], loader).await;
    assert!(matches!(result, Err(Error::CircuitOpen { .. })));

    // After the cooldown, a healed backend closes the circuit via a probe
    backend.set_failing(false);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let value = cache
        .get_or_compute("flaky.op", &[Value::Int(10)], loader)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(1));

    let value = cache
        .get_or_compute("flaky.op", &[Value::Int(11)], loader)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(1));
}

#[tokio::test]
async fn test_fail_open_returns_computed_value() {
    let backend = Arc::new(FlakyBackend::new());
    backend.set_failing(true);

    // Default policy: fail open
    let cache = Cachestor::builder(CacheConfig::test())
        .backend(backend)
        .build()
        .await
        .unwrap();

    let value = cache
        .get_or_compute("resilient.op", &[], || async { Ok(Value::Int(7)) })
        .await
        .unwrap();
    assert_eq!(value, Value::Int(7));
    assert!(cache.metrics().fail_open_loads >= 1);
}

#[tokio::test]
async fn test_stale_on_error_serves_l1_leftovers() {
    let backend = Arc::new(FlakyBackend::new());
    let mut config = swr_config();
    config.fallback = FallbackPolicy::StaleOnError;
    // With SWR off, a stale entry routes through the miss path, which is
    // where the fallback kicks in when L2 is down
    config.l1.swr_enabled = false;
    config.l1.swr_ratio = 0.5;

    let cache = Cachestor::builder(config)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    cache
        .get_or_compute(
            "fragile.op",
            &[],
            counting_loader(Arc::clone(&calls), Value::str("cached")),
        )
        .await
        .unwrap();

    // Backend dies; the entry crosses into its stale window (200ms) while
    // still inside the hard TTL (400ms)
    backend.set_failing(true);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let value = cache
        .get_or_compute(
            "fragile.op",
            &[],
            counting_loader(Arc::clone(&calls), Value::str("fresh")),
        )
        .await
        .unwrap();
    assert_eq!(value, Value::str("cached"), "stale L1 copy expected");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.metrics().stale_served_on_error >= 1);
}

#[tokio::test]
async fn test_application_errors_bypass_fallback() {
    let backend = Arc::new(FlakyBackend::new());
    backend.set_failing(true);

    let cache = Cachestor::builder(CacheConfig::test())
        .backend(backend)
        .build()
        .await
        .unwrap();

    // Even with the cache failing open, loader errors surface unchanged
    let result = cache
        .get_or_compute("broken.op", &[], || async {
            Err::<Value, BoxError>("domain failure".into())
        })
        .await;
    match result {
        Err(Error::Application(e)) => assert_eq!(e.to_string(), "domain failure"),
        other => panic!("expected Application error, got {other:?}"),
    }
}

// =============================================================================
// Invalidation fan-out
// =============================================================================

#[tokio::test]
async fn test_cross_handler_invalidation_over_bus() {
    let backend = Arc::new(MemoryBackend::new());
    let bus = Arc::new(LocalBus::new());

    let process_a = Cachestor::builder(CacheConfig::test())
        .backend(backend.clone())
        .bus(bus.clone())
        .build()
        .await
        .unwrap();
    let process_b = Cachestor::builder(CacheConfig::test())
        .backend(backend.clone())
        .bus(bus.clone())
        .build()
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let loader = counting_loader(Arc::clone(&calls), Value::str("v1"));

    // A writes, B warms its own L1 from L2
    process_a
        .get_or_compute("shared.doc", &[], loader.clone())
        .await
        .unwrap();
    process_b
        .get_or_compute("shared.doc", &[], loader.clone())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A invalidates; the event fans out to B
    process_a.invalidate("shared.doc", &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B's next read misses both tiers and recomputes
    process_b
        .get_or_compute("shared.doc", &[], loader)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(process_b.metrics().invalidations_remote >= 1);
}

#[tokio::test]
async fn test_namespace_invalidation_spares_other_namespaces() {
    let bus = Arc::new(LocalBus::new());
    let backend = Arc::new(MemoryBackend::new());

    let cache = Cachestor::builder(CacheConfig::test())
        .backend(backend)
        .bus(bus)
        .build()
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let loader = counting_loader(Arc::clone(&calls), Value::Int(1));
    cache
        .get_or_compute_full("f", &[], &BTreeMap::new(), None, Some("alpha"), loader.clone())
        .await
        .unwrap();
    cache
        .get_or_compute_full("f", &[], &BTreeMap::new(), None, Some("beta"), loader.clone())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert_eq!(cache.invalidate_namespace("alpha").await, 1);

    // alpha recomputes; beta still hits
    cache
        .get_or_compute_full("f", &[], &BTreeMap::new(), None, Some("beta"), loader.clone())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Serializer strategies end to end
// =============================================================================

#[tokio::test]
async fn test_columnar_table_roundtrip_through_cache() {
    let mut config = CacheConfig::test();
    config.serializer = SerializerKind::Columnar;
    let cache = Cachestor::builder(config)
        .backend(Arc::new(MemoryBackend::new()))
        .build()
        .await
        .unwrap();

    let table = Value::Seq(
        (0..100)
            .map(|i| {
                Value::map([
                    ("id".to_string(), Value::Int(i)),
                    ("score".to_string(), Value::Float(i as f64 * 0.5)),
                ])
            })
            .collect(),
    );

    let stored = {
        let table = table.clone();
        cache
            .get_or_compute("table.load", &[], move || {
                let table = table.clone();
                async move { Ok(table) }
            })
            .await
            .unwrap()
    };
    assert_eq!(stored, table);

    // Warm read decodes the columnar bytes
    let warm = cache
        .get_or_compute("table.load", &[], || async {
            panic!("loader must not run on a warm read")
        })
        .await
        .unwrap();
    assert_eq!(warm, table);
}

#[tokio::test]
async fn test_raw_numeric_roundtrip_through_cache() {
    let mut config = CacheConfig::test();
    config.serializer = SerializerKind::RawNumeric;
    let cache = Cachestor::builder(config)
        .backend(Arc::new(MemoryBackend::new()))
        .build()
        .await
        .unwrap();

    let array = Value::F64Array((0..10_000).map(|i| i as f64 * 0.25).collect());
    let stored = {
        let array = array.clone();
        cache
            .get_or_compute("embedding.load", &[Value::Int(3)], move || {
                let array = array.clone();
                async move { Ok(array) }
            })
            .await
            .unwrap()
    };
    assert_eq!(stored, array);

    let warm = cache
        .get_or_compute("embedding.load", &[Value::Int(3)], || async {
            panic!("loader must not run on a warm read")
        })
        .await
        .unwrap();
    assert_eq!(warm, array);
}
