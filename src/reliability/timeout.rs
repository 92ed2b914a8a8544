//! Adaptive Timeout
//!
//! Per operation-class deadline derived from observed latency: the p99 of
//! a rolling window of the last ~1000 samples, scaled by a multiplier and
//! clamped between the base and maximum timeouts. The effective value is
//! recomputed every ~100 samples; reads in between are a single atomic
//! load.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Rolling window size
const WINDOW_CAPACITY: usize = 1000;

/// Samples between re-evaluations
const REEVALUATE_EVERY: u64 = 100;

/// Latency percentile driving the deadline
const TARGET_PERCENTILE: f64 = 0.99;

/// Adaptive timeout tuning
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub enabled: bool,
    /// Starting deadline, also the floor of the adaptive range
    pub base: Duration,
    /// Multiplier applied to the observed p99
    pub multiplier: f64,
    /// Ceiling of the adaptive range
    pub max: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        }
    }
}

/// Rolling-percentile timeout source for one operation class.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    window: Mutex<VecDeque<u64>>,
    effective_us: AtomicU64,
    samples: AtomicU64,
    config: TimeoutConfig,
}

impl AdaptiveTimeout {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
            effective_us: AtomicU64::new(config.base.as_micros() as u64),
            samples: AtomicU64::new(0),
            config,
        }
    }

    /// The deadline to apply to the next call, or `None` when timeouts are
    /// disabled.
    pub fn current(&self) -> Option<Duration> {
        if !self.config.enabled {
            return None;
        }
        Some(Duration::from_micros(
            self.effective_us.load(Ordering::Relaxed),
        ))
    }

    /// Record an observed latency (successful calls only; timeouts would
    /// teach the window to wait longer for a dead backend).
    pub fn record(&self, latency: Duration) {
        if !self.config.enabled {
            return;
        }

        {
            let mut window = self.window.lock();
            if window.len() == WINDOW_CAPACITY {
                window.pop_front();
            }
            window.push_back(latency.as_micros() as u64);
        }

        let count = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        if count % REEVALUATE_EVERY == 0 {
            self.reevaluate();
        }
    }

    fn reevaluate(&self) {
        let p99_us = {
            let window = self.window.lock();
            if window.is_empty() {
                return;
            }
            let mut sorted: Vec<u64> = window.iter().copied().collect();
            sorted.sort_unstable();
            let rank = ((sorted.len() as f64 - 1.0) * TARGET_PERCENTILE).round() as usize;
            sorted[rank]
        };

        let scaled = (p99_us as f64 * self.config.multiplier) as u64;
        let clamped = scaled.clamp(
            self.config.base.as_micros() as u64,
            self.config.max.as_micros() as u64,
        );
        self.effective_us.store(clamped, Ordering::Relaxed);
        tracing::debug!(p99_us, effective_us = clamped, "adaptive timeout re-evaluated");
    }
}

// =============================================================================
// Tests
// =============================================================================
