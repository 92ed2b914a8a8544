//! Cache Metrics Collection
//!
//! Counters and latency tracking for monitoring cache health. The snapshot
//! is the exposition contract; wiring it to Prometheus or another sink is
//! the embedding application's concern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Smoothing factor for the exponential moving averages (1/8)
const EMA_SHIFT: u32 = 3;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Tier hit/miss counters
    l1_hits: AtomicU64,
    l1_stale_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,

    // Fill path
    loads: AtomicU64,
    load_failures: AtomicU64,
    refreshes: AtomicU64,
    refresh_discards: AtomicU64,
    refresh_skips: AtomicU64,

    // Degradation
    stale_served_on_error: AtomicU64,
    fail_open_loads: AtomicU64,
    decode_failures: AtomicU64,
    backend_errors: AtomicU64,

    // Reliability envelope
    circuit_opens: AtomicU64,
    circuit_short_circuits: AtomicU64,
    backpressure_rejections: AtomicU64,
    timeouts: AtomicU64,

    // Distributed lock
    lock_acquisitions: AtomicU64,
    lock_timeouts: AtomicU64,

    // Invalidation
    invalidations_local: AtomicU64,
    invalidations_remote: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    l1_read_latency_us: AtomicU64,
    l2_read_latency_us: AtomicU64,
    l2_write_latency_us: AtomicU64,
    load_latency_us: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_l1_hit, l1_hits, l1_hits);
    counter!(record_l1_stale_hit, l1_stale_hits, l1_stale_hits);
    counter!(record_l1_miss, l1_misses, l1_misses);
    counter!(record_l2_hit, l2_hits, l2_hits);
    counter!(record_l2_miss, l2_misses, l2_misses);
    counter!(record_load, loads, loads);
    counter!(record_load_failure, load_failures, load_failures);
    counter!(record_refresh, refreshes, refreshes);
    counter!(record_refresh_discard, refresh_discards, refresh_discards);
    counter!(record_refresh_skip, refresh_skips, refresh_skips);
    counter!(
        record_stale_served_on_error,
        stale_served_on_error,
        stale_served_on_error
    );
    counter!(record_fail_open_load, fail_open_loads, fail_open_loads);
    counter!(record_decode_failure, decode_failures, decode_failures);
    counter!(record_backend_error, backend_errors, backend_errors);
    counter!(record_circuit_open, circuit_opens, circuit_opens);
    counter!(
        record_circuit_short_circuit,
        circuit_short_circuits,
        circuit_short_circuits
    );
    counter!(
        record_backpressure_rejection,
        backpressure_rejections,
        backpressure_rejections
    );
    counter!(record_timeout, timeouts, timeouts);
    counter!(record_lock_acquisition, lock_acquisitions, lock_acquisitions);
    counter!(record_lock_timeout, lock_timeouts, lock_timeouts);
    counter!(
        record_local_invalidation,
        invalidations_local,
        invalidations_local
    );
    counter!(
        record_remote_invalidation,
        invalidations_remote,
        invalidations_remote
    );

    pub fn record_l1_read_latency(&self, latency: Duration) {
        update_ema(&self.l1_read_latency_us, latency);
    }

    pub fn record_l2_read_latency(&self, latency: Duration) {
        update_ema(&self.l2_read_latency_us, latency);
    }

    pub fn record_l2_write_latency(&self, latency: Duration) {
        update_ema(&self.l2_write_latency_us, latency);
    }

    pub fn record_load_latency(&self, latency: Duration) {
        update_ema(&self.load_latency_us, latency);
    }

    /// Overall hit ratio across both tiers.
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.l1_hits() + self.l1_stale_hits() + self.l2_hits()) as f64;
        let total = hits + self.loads() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            l1_hits: self.l1_hits(),
            l1_stale_hits: self.l1_stale_hits(),
            l1_misses: self.l1_misses(),
            l2_hits: self.l2_hits(),
            l2_misses: self.l2_misses(),
            loads: self.loads(),
            load_failures: self.load_failures(),
            refreshes: self.refreshes(),
            refresh_discards: self.refresh_discards(),
            refresh_skips: self.refresh_skips(),
            stale_served_on_error: self.stale_served_on_error(),
            fail_open_loads: self.fail_open_loads(),
            decode_failures: self.decode_failures(),
            backend_errors: self.backend_errors(),
            circuit_opens: self.circuit_opens(),
            circuit_short_circuits: self.circuit_short_circuits(),
            backpressure_rejections: self.backpressure_rejections(),
            timeouts: self.timeouts(),
            lock_acquisitions: self.lock_acquisitions(),
            lock_timeouts: self.lock_timeouts(),
            invalidations_local: self.invalidations_local(),
            invalidations_remote: self.invalidations_remote(),
            hit_ratio: self.hit_ratio(),
            l1_read_latency_us: self.l1_read_latency_us.load(Ordering::Relaxed),
            l2_read_latency_us: self.l2_read_latency_us.load(Ordering::Relaxed),
            l2_write_latency_us: self.l2_write_latency_us.load(Ordering::Relaxed),
            load_latency_us: self.load_latency_us.load(Ordering::Relaxed),
        }
    }
}

fn update_ema(slot: &AtomicU64, latency: Duration) {
    let sample = latency.as_micros() as u64;
    let current = slot.load(Ordering::Relaxed);
    let next = if current == 0 {
        sample
    } else {
        current - (current >> EMA_SHIFT) + (sample >> EMA_SHIFT)
    };
    slot.store(next, Ordering::Relaxed);
}

/// Timer for latency measurements
#[derive(Debug)]
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Point-in-time metrics copy
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub l1_hits: u64,
    pub l1_stale_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub refreshes: u64,
    pub refresh_discards: u64,
    pub refresh_skips: u64,
    pub stale_served_on_error: u64,
    pub fail_open_loads: u64,
    pub decode_failures: u64,
    pub backend_errors: u64,
    pub circuit_opens: u64,
    pub circuit_short_circuits: u64,
    pub backpressure_rejections: u64,
    pub timeouts: u64,
    pub lock_acquisitions: u64,
    pub lock_timeouts: u64,
    pub invalidations_local: u64,
    pub invalidations_remote: u64,
    pub hit_ratio: f64,
    pub l1_read_latency_us: u64,
    pub l2_read_latency_us: u64,
    pub l2_write_latency_us: u64,
    pub load_latency_us: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = CacheMetrics::new();
        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_l2_hit();
        metrics.record_load();

        let snap = metrics.snapshot();
        assert_eq!(snap.l1_hits, 2);
        assert_eq!(snap.l2_hits, 1);
        assert_eq!(snap.loads, 1);
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_l1_hit();
        metrics.record_load();

        assert!((metrics.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_ema_seeds_from_first_sample() {
        let metrics = CacheMetrics::new();
        metrics.record_l2_read_latency(Duration::from_micros(800));
        let snap = metrics.snapshot();
        assert_eq!(snap.l2_read_latency_us, 800);

        metrics.record_l2_read_latency(Duration::from_micros(800));
        let snap = metrics.snapshot();
        assert!(snap.l2_read_latency_us > 0);
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(1));
        assert!(tracker.elapsed() >= Duration::from_millis(1));
    }
}
