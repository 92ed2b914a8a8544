//! Reliability Envelope
//!
//! Composition of admission control, circuit breaking, and adaptive
//! timeouts around every L2 call. One lane exists per (namespace,
//! operation-class); all callers of a namespace share its breaker state
//! and latency window.
//!
//! Call sequence: admission (fail fast over the concurrency cap), breaker
//! check (fail fast while open, one probe after cooldown), deadline from
//! the adaptive window, invoke, classify the outcome. Each of the three
//! guards can be disabled independently.

mod backpressure;
mod breaker;
mod timeout;

pub use backpressure::{AdmissionGate, BackpressureConfig};
pub use breaker::{Admission, BreakerConfig, CircuitBreaker, CircuitState};
pub use timeout::{AdaptiveTimeout, TimeoutConfig};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;

/// Operation classes with independent breaker and latency state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Read,
    Write,
}

impl std::fmt::Display for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpClass::Read => write!(f, "read"),
            OpClass::Write => write!(f, "write"),
        }
    }
}

/// Combined reliability tuning
#[derive(Debug, Clone, Default)]
pub struct ReliabilityConfig {
    pub breaker: BreakerConfig,
    pub timeout: TimeoutConfig,
    pub backpressure: BackpressureConfig,
}

struct Lane {
    breaker: CircuitBreaker,
    timeout: AdaptiveTimeout,
    gate: AdmissionGate,
}

/// Shared guard registry wrapping every backend call.
pub struct ReliabilityEnvelope {
    lanes: DashMap<(String, OpClass), Arc<Lane>>,
    config: ReliabilityConfig,
    metrics: Arc<CacheMetrics>,
}

impl ReliabilityEnvelope {
    pub fn new(config: ReliabilityConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            lanes: DashMap::new(),
            config,
            metrics,
        }
    }

    fn lane(&self, namespace: &str, class: OpClass) -> Arc<Lane> {
        if let Some(lane) = self.lanes.get(&(namespace.to_string(), class)) {
            return Arc::clone(&lane);
        }
        Arc::clone(
            &self
                .lanes
                .entry((namespace.to_string(), class))
                .or_insert_with(|| {
                    Arc::new(Lane {
                        breaker: CircuitBreaker::new(self.config.breaker.clone()),
                        timeout: AdaptiveTimeout::new(self.config.timeout.clone()),
                        gate: AdmissionGate::new(self.config.backpressure.clone()),
                    })
                }),
        )
    }

    /// Run `fut` under the namespace's guards and classify the outcome.
    pub async fn call<T, F>(
        &self,
        namespace: &str,
        class: OpClass,
        operation: &'static str,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lane = self.lane(namespace, class);

        let _permit = match lane.gate.try_admit(operation) {
            Ok(permit) => permit,
            Err(e) => {
                self.metrics.record_backpressure_rejection();
                return Err(e);
            }
        };

        match lane.breaker.admit(Instant::now()) {
            Admission::Allow => {}
            Admission::Reject { retry_after } => {
                self.metrics.record_circuit_short_circuit();
                return Err(Error::CircuitOpen {
                    namespace: namespace.to_string(),
                    operation,
                    retry_after_ms: retry_after.as_millis() as u64,
                });
            }
        }

        let started = Instant::now();
        let outcome = match lane.timeout.current() {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation,
                    timeout_ms: deadline.as_millis() as u64,
                }),
            },
            None => fut.await,
        };

        match &outcome {
            Ok(_) => {
                lane.timeout.record(started.elapsed());
                lane.breaker.on_success();
            }
            Err(e) if e.feeds_breaker() => {
                if matches!(e, Error::Timeout { .. }) {
                    self.metrics.record_timeout();
                }
                self.metrics.record_backend_error();
                if lane.breaker.on_transient_failure(Instant::now()) {
                    self.metrics.record_circuit_open();
                    tracing::warn!(
                        namespace,
                        %class,
                        operation,
                        "circuit opened after consecutive transient failures"
                    );
                }
            }
            Err(_) => {
                // Permanent failures surface without advancing the breaker
                self.metrics.record_backend_error();
            }
        }

        outcome
    }

    /// Breaker states across all lanes, for health reporting.
    pub fn circuit_states(&self) -> Vec<(String, OpClass, CircuitState)> {
        self.lanes
            .iter()
            .map(|entry| {
                let (ns, class) = entry.key();
                (ns.clone(), *class, entry.value().breaker.state())
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
