//! Circuit Breaker
//!
//! Per-(namespace, operation-class) breaker guarding L2 calls. State
//! machine: `CLOSED -> OPEN` after N consecutive transient failures,
//! `OPEN -> HALF_OPEN` after a cooldown admits one probe,
//! `HALF_OPEN -> CLOSED` on probe success, `HALF_OPEN -> OPEN` on probe
//! failure. Only transient failures advance the counter; permanent and
//! application errors pass through without touching it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Circuit breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Consecutive transient failures before the circuit opens
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits a probe
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Breaker phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    /// One probe is in flight; everyone else short-circuits
    HalfOpen,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the call
    Allow,
    /// Short-circuit; retry after the embedded hint
    Reject { retry_after: Duration },
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    phase: Mutex<Phase>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            phase: Mutex::new(Phase::Closed {
                consecutive_failures: 0,
            }),
            config,
        }
    }

    /// Check admission. An open circuit past its cooldown transitions to
    /// half-open and admits exactly one probe.
    pub fn admit(&self, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allow;
        }
        let mut phase = self.phase.lock();
        match &*phase {
            Phase::Closed { .. } => Admission::Allow,
            Phase::Open { since } => {
                let elapsed = now.saturating_duration_since(*since);
                if elapsed >= self.config.recovery_timeout {
                    *phase = Phase::HalfOpen;
                    Admission::Allow
                } else {
                    Admission::Reject {
                        retry_after: self.config.recovery_timeout - elapsed,
                    }
                }
            }
            Phase::HalfOpen => Admission::Reject {
                retry_after: self.config.recovery_timeout,
            },
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut phase = self.phase.lock();
        *phase = Phase::Closed {
            consecutive_failures: 0,
        };
    }

    /// Record a transient failure; may trip the circuit. Returns true when
    /// this failure opened the circuit.
    pub fn on_transient_failure(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    *phase = Phase::Open { since: now };
                    return true;
                }
                false
            }
            Phase::HalfOpen => {
                // Probe failed; back to open with a fresh cooldown
                *phase = Phase::Open { since: now };
                true
            }
            Phase::Open { .. } => false,
        }
    }

    /// Current state, for health reporting.
    pub fn state(&self) -> CircuitState {
        match &*self.phase.lock() {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
