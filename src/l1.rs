//! L1 Store - In-Process Byte Cache
//!
//! Bounded per-process map of opaque envelope bytes with TTL, freshness
//! state for stale-while-revalidate, strict-LRU eviction to a low-water
//! mark, and an optional namespace index for O(|namespace|) invalidation.
//!
//! All operations serialize through one mutex and never touch I/O; the
//! store always answers in bounded time. Byte-budget eviction is the only
//! operation that is not O(1) amortized.
//!
//! Entries store exactly the bytes written to the L2 tier (encrypted when
//! encryption is on), never decoded domain values.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;

/// L1 store configuration
#[derive(Debug, Clone)]
pub struct L1Config {
    /// Maximum total payload bytes held by this process
    pub max_bytes: u64,
    /// Eviction target as a fraction of `max_bytes`
    pub low_watermark: f64,
    /// Serve-stale-and-refresh behavior (consumed by the handler; the
    /// store tracks freshness either way)
    pub swr_enabled: bool,
    /// Fraction of TTL at which an entry turns stale (0.1 - 1.0)
    pub swr_ratio: f64,
    /// Relative jitter applied to the freshness deadline (0.1 = +/-10%);
    /// 0.0 disables jitter (tests rely on this)
    pub swr_jitter: f64,
    /// Maintain the namespace -> keys index. Disabling saves memory and
    /// makes namespace invalidation O(|cache|) instead of O(|namespace|).
    pub namespace_index: bool,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024,
            low_watermark: 0.70,
            swr_enabled: true,
            swr_ratio: 0.5,
            swr_jitter: 0.1,
            namespace_index: true,
        }
    }
}

/// Freshness of a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within the freshness window; serve as-is
    Fresh,
    /// Past `fresh_until` but before expiry; servable with background refresh
    Stale,
}

/// Result of an L1 lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit {
        bytes: Bytes,
        freshness: Freshness,
        version: u64,
    },
    Miss,
}

struct EntryState {
    bytes: Bytes,
    size: u64,
    expires_at: Instant,
    fresh_until: Instant,
    refreshing: bool,
    version: u64,
    namespace: Arc<str>,
    last_access: u64,
}

struct L1Inner {
    map: HashMap<Arc<str>, EntryState>,
    /// namespace -> live keys, maintained only when configured
    ns_index: Option<HashMap<Arc<str>, HashSet<Arc<str>>>>,
    /// Lazy-deletion expiry queue: (deadline, key). Records for replaced
    /// entries are skipped on pop by re-checking the live deadline.
    expiry: BinaryHeap<Reverse<(Instant, Arc<str>)>>,
    total_bytes: u64,
    access_clock: u64,
    /// Store-global version source. Versions never repeat, so a refresher
    /// that captured a version from an expired-and-recreated entry can
    /// never land on the new incarnation.
    version_clock: u64,
}

/// In-process byte cache with TTL, SWR freshness, and LRU eviction.
pub struct L1Store {
    inner: Mutex<L1Inner>,
    config: L1Config,
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl L1Store {
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    pub fn with_config(config: L1Config) -> Self {
        Self {
            inner: Mutex::new(L1Inner {
                map: HashMap::new(),
                ns_index: config.namespace_index.then(HashMap::new),
                expiry: BinaryHeap::new(),
                total_bytes: 0,
                access_clock: 0,
                version_clock: 0,
            }),
            config,
            hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up an entry. An entry past its hard expiry is removed and
    /// reported as a miss.
    pub fn get(&self, key: &str, now: Instant) -> Lookup {
        let mut inner = self.inner.lock();

        let Some(entry) = inner.map.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };

        if now > entry.expires_at {
            let key: Arc<str> = inner
                .map
                .get_key_value(key)
                .map(|(k, _)| Arc::clone(k))
                .unwrap_or_else(|| Arc::from(key));
            remove_entry(&mut inner, &key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        }

        inner.access_clock += 1;
        let clock = inner.access_clock;
        let entry = inner.map.get_mut(key).expect("entry checked above");
        entry.last_access = clock;

        let freshness = if now > entry.fresh_until {
            self.stale_hits.fetch_add(1, Ordering::Relaxed);
            Freshness::Stale
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Freshness::Fresh
        };

        Lookup::Hit {
            bytes: entry.bytes.clone(),
            freshness,
            version: entry.version,
        }
    }

    /// Insert or replace an entry, returning its new version.
    ///
    /// Entries that cannot fit the byte budget at all are refused with
    /// `None`; the caller still has the value in hand. Expired entries are
    /// reaped before the write completes, and LRU victims are evicted down
    /// to the low-water mark when the budget overflows.
    pub fn put(
        &self,
        key: &str,
        namespace: &str,
        bytes: Bytes,
        ttl: Duration,
        now: Instant,
    ) -> Option<u64> {
        let size = bytes.len() as u64;
        if size > self.config.max_bytes {
            tracing::debug!(key, size, "payload exceeds the entire L1 budget; not admitted");
            return None;
        }

        let expires_at = now + ttl;
        let fresh_until = self.freshness_deadline(now, ttl, expires_at);

        let mut inner = self.inner.lock();
        self.reap_expired(&mut inner, now);

        inner.access_clock += 1;
        let clock = inner.access_clock;
        inner.version_clock += 1;
        let version = inner.version_clock;

        let key: Arc<str> = match inner.map.get_key_value(key) {
            Some((existing, _)) => Arc::clone(existing),
            None => Arc::from(key),
        };

        let ns: Arc<str> = Arc::from(namespace);
        let previous = inner.map.insert(
            Arc::clone(&key),
            EntryState {
                bytes,
                size,
                expires_at,
                fresh_until,
                refreshing: false,
                version,
                namespace: Arc::clone(&ns),
                last_access: clock,
            },
        );

        inner.total_bytes += size;
        if let Some(old) = previous {
            inner.total_bytes -= old.size;
            if old.namespace != ns {
                if let Some(index) = inner.ns_index.as_mut() {
                    if let Some(keys) = index.get_mut(&old.namespace) {
                        keys.remove(&key);
                    }
                }
            }
        }
        if let Some(index) = inner.ns_index.as_mut() {
            index.entry(ns).or_default().insert(Arc::clone(&key));
        }
        inner.expiry.push(Reverse((expires_at, Arc::clone(&key))));

        if inner.total_bytes > self.config.max_bytes {
            self.evict(&mut inner, now);
        }

        Some(version)
    }

    /// Atomically claim the refresh slot for (key, version). Exactly one
    /// caller wins per version.
    pub fn mark_refreshing(&self, key: &str, version: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.get_mut(key) {
            Some(entry) if entry.version == version && !entry.refreshing => {
                entry.refreshing = true;
                true
            }
            _ => false,
        }
    }

    /// Release the refresh slot without replacing content (refresh failed
    /// or was skipped).
    pub fn clear_refreshing(&self, key: &str, version: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.get_mut(key) {
            if entry.version == version {
                entry.refreshing = false;
            }
        }
    }

    /// Install the result of a background refresh.
    ///
    /// The refresh only lands if the entry still carries the version
    /// captured at `mark_refreshing`; a concurrent write wins and the
    /// refresh result is discarded. A landed refresh replaces content and
    /// renews freshness but never extends the hard expiry.
    pub fn complete_refresh(
        &self,
        key: &str,
        version: u64,
        bytes: Bytes,
        ttl: Duration,
        now: Instant,
    ) -> bool {
        let new_size = bytes.len() as u64;
        if new_size > self.config.max_bytes {
            return false;
        }

        let mut inner = self.inner.lock();

        match inner.map.get(key) {
            Some(entry) if entry.version == version && now <= entry.expires_at => {}
            _ => return false,
        }

        inner.version_clock += 1;
        let new_version = inner.version_clock;

        let entry = inner.map.get_mut(key).expect("entry checked above");
        let old_size = entry.size;
        let expires_at = entry.expires_at;
        entry.bytes = bytes;
        entry.size = new_size;
        entry.version = new_version;
        entry.refreshing = false;
        entry.fresh_until = self.freshness_deadline(now, ttl, expires_at);

        inner.total_bytes = inner.total_bytes + new_size - old_size;
        if inner.total_bytes > self.config.max_bytes {
            self.evict(&mut inner, now);
        }
        true
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some((key, _)) = inner.map.get_key_value(key) else {
            return false;
        };
        let key = Arc::clone(key);
        remove_entry(&mut inner, &key);
        true
    }

    /// Remove every entry in a namespace. O(|namespace|) with the index,
    /// O(|cache|) without.
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        let mut inner = self.inner.lock();

        let victims: Vec<Arc<str>> = match inner.ns_index.as_ref() {
            Some(index) => index
                .get(namespace)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
            None => inner
                .map
                .iter()
                .filter(|(_, e)| e.namespace.as_ref() == namespace)
                .map(|(k, _)| Arc::clone(k))
                .collect(),
        };

        for key in &victims {
            remove_entry(&mut inner, key);
        }
        victims.len()
    }

    /// Drop everything.
    pub fn invalidate_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.map.len();
        inner.map.clear();
        inner.expiry.clear();
        if let Some(index) = inner.ns_index.as_mut() {
            index.clear();
        }
        inner.total_bytes = 0;
        count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }

    /// Snapshot of counters for the metrics sink.
    pub fn stats(&self) -> L1Stats {
        let inner = self.inner.lock();
        L1Stats {
            entries: inner.map.len(),
            total_bytes: inner.total_bytes,
            max_bytes: self.config.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Freshness deadline: `now + ttl * swr_ratio * jitter`, clamped to the
    /// hard expiry. Always tracked; whether a stale hit is served (SWR) or
    /// treated as a miss is the handler's call.
    fn freshness_deadline(&self, now: Instant, ttl: Duration, expires_at: Instant) -> Instant {
        let jitter = if self.config.swr_jitter > 0.0 {
            rand::thread_rng()
                .gen_range(1.0 - self.config.swr_jitter..=1.0 + self.config.swr_jitter)
        } else {
            1.0
        };
        let fresh = now + ttl.mul_f64(self.config.swr_ratio * jitter);
        fresh.min(expires_at)
    }

    /// Reap entries whose hard expiry has passed. Runs on every write via
    /// the lazy expiry queue, so each record is popped at most once.
    fn reap_expired(&self, inner: &mut L1Inner, now: Instant) {
        while let Some(Reverse((deadline, _))) = inner.expiry.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, key))) = inner.expiry.pop() else {
                break;
            };
            // A replaced entry leaves a stale record behind; only remove
            // entries that are expired by their live deadline.
            let expired = matches!(
                inner.map.get(&key),
                Some(entry) if now > entry.expires_at
            );
            if expired {
                remove_entry(inner, &key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Evict strict-LRU victims until the low-water mark is reached.
    /// O(n log n) in the number of live entries, entered only on overflow.
    fn evict(&self, inner: &mut L1Inner, now: Instant) {
        let target = (self.config.max_bytes as f64 * self.config.low_watermark) as u64;

        let mut candidates: Vec<(u64, Arc<str>)> = inner
            .map
            .iter()
            .map(|(k, e)| {
                // Expired entries go first regardless of recency
                let rank = if now > e.expires_at { 0 } else { e.last_access };
                (rank, Arc::clone(k))
            })
            .collect();
        candidates.sort_unstable_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        // The most recent entry (the write that triggered this pass) is
        // never its own victim; a put followed by a get must hit.
        if !candidates.is_empty() {
            candidates.pop();
        }

        for (_, key) in candidates {
            if inner.total_bytes <= target {
                break;
            }
            remove_entry(inner, &key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for L1Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove an entry and fix the accounting and index.
fn remove_entry(inner: &mut L1Inner, key: &Arc<str>) {
    if let Some(entry) = inner.map.remove(key) {
        inner.total_bytes -= entry.size;
        if let Some(index) = inner.ns_index.as_mut() {
            if let Some(keys) = index.get_mut(&entry.namespace) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(&entry.namespace);
                }
            }
        }
    }
}

/// L1 statistics snapshot
#[derive(Debug, Clone)]
pub struct L1Stats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn store_with(max_bytes: u64) -> L1Store {
        L1Store::with_config(L1Config {
            max_bytes,
            swr_jitter: 0.0,
            ..L1Config::default()
        })
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![0xabu8; len])
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = store_with(1024);
        let now = Instant::now();

        let version = store.put("k1", "ns", payload(10), TTL, now).unwrap();
        assert_eq!(version, 1);

        match store.get("k1", now) {
            Lookup::Hit {
                bytes,
                freshness,
                version,
            } => {
                assert_eq!(bytes.len(), 10);
                assert_eq!(freshness, Freshness::Fresh);
                assert_eq!(version, 1);
            }
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[test]
    fn test_miss_on_absent_key() {
        let store = store_with(1024);
        assert!(matches!(store.get("nope", Instant::now()), Lookup::Miss));
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_version_increments_on_rewrite() {
        let store = store_with(1024);
        let now = Instant::now();
        assert_eq!(store.put("k", "ns", payload(5), TTL, now), Some(1));
        assert_eq!(store.put("k", "ns", payload(6), TTL, now), Some(2));
        assert_eq!(store.put("k", "ns", payload(7), TTL, now), Some(3));
    }

    #[test]
    fn test_expired_entry_is_miss_and_removed() {
        let store = store_with(1024);
        let now = Instant::now();
        store.put("k", "ns", payload(10), Duration::from_secs(1), now);

        let later = now + Duration::from_secs(2);
        assert!(matches!(store.get("k", later), Lookup::Miss));
        assert!(!store.contains("k"));
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn test_expired_entries_reaped_on_write() {
        let store = store_with(1024);
        let now = Instant::now();
        store.put("old", "ns", payload(10), Duration::from_secs(1), now);

        let later = now + Duration::from_secs(5);
        store.put("new", "ns", payload(10), TTL, later);

        assert!(!store.contains("old"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 10);
    }

    #[test]
    fn test_capacity_bound_holds() {
        let store = store_with(1000);
        let now = Instant::now();
        for i in 0..50 {
            store.put(&format!("k{i}"), "ns", payload(100), TTL, now);
            assert!(store.total_bytes() <= 1000, "budget exceeded");
        }
        assert!(store.stats().evictions > 0);
    }

    #[test]
    fn test_eviction_to_low_watermark() {
        let store = store_with(1000);
        let now = Instant::now();
        for i in 0..11 {
            store.put(&format!("k{i}"), "ns", payload(100), TTL, now);
        }
        // The overflowing put drains to 70% of the bound
        assert!(store.total_bytes() <= 700);
    }

    #[test]
    fn test_lru_victim_is_oldest_accessed() {
        let store = store_with(1000);
        let now = Instant::now();
        for i in 0..10 {
            store.put(&format!("k{i}"), "ns", payload(100), TTL, now);
        }
        // Touch k0 so k1 becomes the LRU victim
        store.get("k0", now);

        store.put("overflow", "ns", payload(100), TTL, now);
        assert!(store.contains("k0"), "recently read entry was evicted");
        assert!(!store.contains("k1"), "LRU entry survived");
    }

    #[test]
    fn test_oversized_payload_refused() {
        let store = store_with(100);
        let now = Instant::now();
        assert_eq!(store.put("big", "ns", payload(200), TTL, now), None);
        assert!(!store.contains("big"));
    }

    #[test]
    fn test_freshness_transitions_to_stale() {
        let store = store_with(1024);
        let now = Instant::now();
        store.put("k", "ns", payload(10), Duration::from_secs(60), now);

        // swr_ratio 0.5, jitter disabled: stale at 30s
        let at_29 = now + Duration::from_secs(29);
        assert!(matches!(
            store.get("k", at_29),
            Lookup::Hit {
                freshness: Freshness::Fresh,
                ..
            }
        ));

        let at_31 = now + Duration::from_secs(31);
        assert!(matches!(
            store.get("k", at_31),
            Lookup::Hit {
                freshness: Freshness::Stale,
                ..
            }
        ));
    }

    #[test]
    fn test_freshness_tracked_even_with_swr_off() {
        // The store always reports staleness; treating a stale hit as a
        // miss when SWR is off happens a level up
        let store = L1Store::with_config(L1Config {
            max_bytes: 1024,
            swr_enabled: false,
            swr_jitter: 0.0,
            ..L1Config::default()
        });
        let now = Instant::now();
        store.put("k", "ns", payload(10), Duration::from_secs(60), now);

        let at_59 = now + Duration::from_secs(59);
        assert!(matches!(
            store.get("k", at_59),
            Lookup::Hit {
                freshness: Freshness::Stale,
                ..
            }
        ));
    }

    #[test]
    fn test_jittered_freshness_stays_within_expiry() {
        let store = L1Store::with_config(L1Config {
            max_bytes: 1024,
            swr_ratio: 1.0,
            swr_jitter: 0.1,
            ..L1Config::default()
        });
        let now = Instant::now();
        // ratio 1.0 with +10% jitter would overshoot; the deadline clamps
        store.put("k", "ns", payload(10), Duration::from_secs(10), now);
        let at_expiry = now + Duration::from_secs(10);
        assert!(matches!(store.get("k", at_expiry), Lookup::Hit { .. }));
        assert!(matches!(
            store.get("k", at_expiry + Duration::from_millis(10)),
            Lookup::Miss
        ));
    }

    #[test]
    fn test_mark_refreshing_single_winner() {
        let store = store_with(1024);
        let now = Instant::now();
        let version = store.put("k", "ns", payload(10), TTL, now).unwrap();

        assert!(store.mark_refreshing("k", version));
        assert!(!store.mark_refreshing("k", version), "second claim won");
        assert!(!store.mark_refreshing("k", version + 1), "wrong version won");
    }

    #[test]
    fn test_clear_refreshing_reopens_slot() {
        let store = store_with(1024);
        let now = Instant::now();
        let version = store.put("k", "ns", payload(10), TTL, now).unwrap();

        assert!(store.mark_refreshing("k", version));
        store.clear_refreshing("k", version);
        assert!(store.mark_refreshing("k", version));
    }

    #[test]
    fn test_complete_refresh_replaces_content_not_expiry() {
        let store = store_with(1024);
        let now = Instant::now();
        let version = store
            .put("k", "ns", payload(10), Duration::from_secs(60), now)
            .unwrap();
        assert!(store.mark_refreshing("k", version));

        let refresh_at = now + Duration::from_secs(45);
        assert!(store.complete_refresh(
            "k",
            version,
            Bytes::from_static(b"new content"),
            Duration::from_secs(60),
            refresh_at,
        ));

        // New content visible
        match store.get("k", refresh_at) {
            Lookup::Hit { bytes, version, .. } => {
                assert_eq!(bytes.as_ref(), b"new content");
                assert_eq!(version, 2);
            }
            Lookup::Miss => panic!("expected hit"),
        }

        // Hard expiry unchanged: still dies at the original 60s deadline
        let past_expiry = now + Duration::from_secs(61);
        assert!(matches!(store.get("k", past_expiry), Lookup::Miss));
    }

    #[test]
    fn test_stale_refresh_discarded_after_concurrent_write() {
        let store = store_with(1024);
        let now = Instant::now();
        let version = store.put("k", "ns", payload(10), TTL, now).unwrap();
        assert!(store.mark_refreshing("k", version));

        // A direct write lands while the refresh is in flight
        store.put("k", "ns", Bytes::from_static(b"direct"), TTL, now);

        assert!(!store.complete_refresh(
            "k",
            version,
            Bytes::from_static(b"stale refresh"),
            TTL,
            now
        ));
        match store.get("k", now) {
            Lookup::Hit { bytes, .. } => assert_eq!(bytes.as_ref(), b"direct"),
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[test]
    fn test_invalidate_key() {
        let store = store_with(1024);
        let now = Instant::now();
        store.put("k", "ns", payload(10), TTL, now);

        assert!(store.invalidate("k"));
        assert!(matches!(store.get("k", now), Lookup::Miss));
        assert!(!store.invalidate("k"));
    }

    #[test]
    fn test_invalidate_namespace_with_index() {
        let store = store_with(4096);
        let now = Instant::now();
        for i in 0..5 {
            store.put(&format!("a{i}"), "alpha", payload(10), TTL, now);
            store.put(&format!("b{i}"), "beta", payload(10), TTL, now);
        }

        assert_eq!(store.invalidate_namespace("alpha"), 5);
        assert_eq!(store.len(), 5);
        assert!(store.contains("b0"));
        assert!(!store.contains("a0"));
    }

    #[test]
    fn test_invalidate_namespace_without_index() {
        let store = L1Store::with_config(L1Config {
            max_bytes: 4096,
            namespace_index: false,
            swr_jitter: 0.0,
            ..L1Config::default()
        });
        let now = Instant::now();
        for i in 0..5 {
            store.put(&format!("a{i}"), "alpha", payload(10), TTL, now);
            store.put(&format!("b{i}"), "beta", payload(10), TTL, now);
        }

        assert_eq!(store.invalidate_namespace("alpha"), 5);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_invalidate_all() {
        let store = store_with(4096);
        let now = Instant::now();
        for i in 0..10 {
            store.put(&format!("k{i}"), "ns", payload(10), TTL, now);
        }
        assert_eq!(store.invalidate_all(), 10);
        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn test_namespace_move_updates_index() {
        let store = store_with(1024);
        let now = Instant::now();
        store.put("k", "alpha", payload(10), TTL, now);
        store.put("k", "beta", payload(10), TTL, now);

        assert_eq!(store.invalidate_namespace("alpha"), 0);
        assert!(store.contains("k"));
        assert_eq!(store.invalidate_namespace("beta"), 1);
        assert!(!store.contains("k"));
    }

    #[test]
    fn test_concurrent_put_get() {
        use std::thread;

        let store = Arc::new(store_with(10 * 1024 * 1024));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let now = Instant::now();
                    for i in 0..500 {
                        let key = format!("k-{t}-{i}");
                        store.put(&key, "ns", payload(64), TTL, now);
                        assert!(matches!(store.get(&key, now), Lookup::Hit { .. }));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 4000);
    }
}
