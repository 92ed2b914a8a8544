//! Backpressure Admission Control
//!
//! Caps in-flight L2 calls per (namespace, operation-class). Callers over
//! the cap fail fast instead of queueing; a cache that queues under an
//! overloaded backend amplifies the overload.

use std::sync::Arc;

use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::{Error, Result};

/// Admission control tuning
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub enabled: bool,
    /// Maximum concurrent calls before rejection
    pub max_concurrent: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 64,
        }
    }
}

/// Fail-fast concurrency gate.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    config: BackpressureConfig,
}

/// Held for the duration of an admitted call.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl AdmissionGate {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        }
    }

    /// Admit or reject immediately; never waits.
    pub fn try_admit(&self, operation: &'static str) -> Result<AdmissionPermit> {
        if !self.config.enabled {
            return Ok(AdmissionPermit { _permit: None });
        }
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit {
                _permit: Some(permit),
            }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(Error::BackpressureRejected {
                    operation,
                    in_flight: self.config.max_concurrent,
                })
            }
        }
    }

    /// Calls currently admitted.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }
}

// =============================================================================
// Tests
// =============================================================================
