//! Configuration
//!
//! One config struct consumed by the orchestrator, built by named preset
//! constructors. Presets produce coherent combinations; `validate` rejects
//! invalid ones at construction time, never at request time. Process-wide
//! defaults can be overlaid from `CACHESTOR_*` environment variables, with
//! explicit configuration taking precedence.

use std::time::Duration;

use crate::encryption::MasterKey;
use crate::error::{Error, Result};
use crate::l1::L1Config;
use crate::reliability::{BackpressureConfig, BreakerConfig, ReliabilityConfig, TimeoutConfig};
use crate::serializer::SerializerKind;

/// What the handler does when the cache layer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Run the loader and return its result uncached; cache failures never
    /// break callers (default)
    #[default]
    FailOpen,
    /// Propagate the cache error
    FailClosed,
    /// Serve stale L1 data when present, otherwise behave like fail-open
    StaleOnError,
}

/// Envelope encryption settings
#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub master_key: MasterKey,
    /// Retired master keys still accepted on decrypt (rotation list)
    pub rotated_keys: Vec<MasterKey>,
}

impl EncryptionConfig {
    pub fn new(master_key: MasterKey) -> Self {
        Self {
            master_key,
            rotated_keys: Vec::new(),
        }
    }
}

/// Distributed fill-lock settings
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub enabled: bool,
    /// Lock TTL; must exceed expected loader latency plus a margin
    pub ttl: Duration,
    /// How long a caller polls before falling through without the lock
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Key prefix and invalidation / breaker scope
    pub namespace: String,
    /// Default entry TTL (L2 expiry and basis for L1 deadlines)
    pub ttl: Duration,
    /// Serializer strategy, also stamped into stored envelopes
    pub serializer: SerializerKind,
    /// Disable the in-process tier entirely
    pub l1_enabled: bool,
    pub l1: L1Config,
    pub reliability: ReliabilityConfig,
    pub lock: LockConfig,
    /// `Some` enables AEAD envelope wrapping
    pub encryption: Option<EncryptionConfig>,
    pub fallback: FallbackPolicy,
    /// Publish/subscribe invalidation events when a bus is attached
    pub invalidation_enabled: bool,
    /// Bounded worker pool for SWR background refreshes
    pub refresh_workers: usize,
    /// L2 connection URL consumed by the builder (`None`: L1-only unless a
    /// backend is injected directly)
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            ttl: Duration::from_secs(300),
            serializer: SerializerKind::Standard,
            l1_enabled: true,
            l1: L1Config::default(),
            reliability: ReliabilityConfig::default(),
            lock: LockConfig::default(),
            encryption: None,
            fallback: FallbackPolicy::FailOpen,
            invalidation_enabled: true,
            refresh_workers: 4,
            redis_url: None,
        }
    }
}

impl CacheConfig {
    // =========================================================================
    // Presets
    // =========================================================================

    /// Smallest useful setup: L1 only, no guards, no background machinery.
    pub fn minimal() -> Self {
        Self {
            l1: L1Config {
                max_bytes: 16 * 1024 * 1024,
                swr_enabled: false,
                namespace_index: false,
                ..L1Config::default()
            },
            reliability: ReliabilityConfig {
                breaker: BreakerConfig {
                    enabled: false,
                    ..BreakerConfig::default()
                },
                timeout: TimeoutConfig {
                    enabled: false,
                    ..TimeoutConfig::default()
                },
                backpressure: BackpressureConfig {
                    enabled: false,
                    ..BackpressureConfig::default()
                },
            },
            lock: LockConfig {
                enabled: false,
                ..LockConfig::default()
            },
            invalidation_enabled: false,
            refresh_workers: 1,
            ..Self::default()
        }
    }

    /// Local development: everything on, forgiving timeouts.
    pub fn dev() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            reliability: ReliabilityConfig {
                timeout: TimeoutConfig {
                    base: Duration::from_secs(2),
                    max: Duration::from_secs(30),
                    ..TimeoutConfig::default()
                },
                ..ReliabilityConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production defaults: full reliability envelope, SWR, invalidation.
    pub fn production() -> Self {
        Self::default()
    }

    /// Production plus authenticated encryption of every stored envelope.
    pub fn secure(master_key: MasterKey) -> Self {
        Self {
            encryption: Some(EncryptionConfig::new(master_key)),
            ..Self::production()
        }
    }

    /// Deterministic test setup: tiny budgets, no jitter, fast lock
    /// timeouts, no background refresh concurrency.
    pub fn test() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            l1: L1Config {
                max_bytes: 1024 * 1024,
                swr_jitter: 0.0,
                ..L1Config::default()
            },
            lock: LockConfig {
                enabled: true,
                ttl: Duration::from_secs(2),
                acquire_timeout: Duration::from_millis(500),
            },
            refresh_workers: 1,
            ..Self::default()
        }
    }

    // =========================================================================
    // Environment overlay
    // =========================================================================

    /// Overlay process-wide defaults from the environment:
    ///
    /// - `CACHESTOR_REDIS_URL` - L2 connection URL
    /// - `CACHESTOR_DEFAULT_TTL_SECS` - default TTL
    /// - `CACHESTOR_L1_MAX_MB` - L1 byte budget
    /// - `CACHESTOR_MASTER_KEY` - hex-encoded master secret
    ///
    /// Values already set explicitly win over the environment only for the
    /// master key (an env key never replaces a configured one).
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("CACHESTOR_REDIS_URL") {
            if !url.is_empty() {
                self.redis_url = Some(url);
            }
        }
        if let Ok(raw) = std::env::var("CACHESTOR_DEFAULT_TTL_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                Error::Config(format!("CACHESTOR_DEFAULT_TTL_SECS is not a number: {raw}"))
            })?;
            self.ttl = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("CACHESTOR_L1_MAX_MB") {
            let mb: u64 = raw.parse().map_err(|_| {
                Error::Config(format!("CACHESTOR_L1_MAX_MB is not a number: {raw}"))
            })?;
            self.l1.max_bytes = mb * 1024 * 1024;
        }
        if self.encryption.is_none() {
            if let Ok(raw) = std::env::var("CACHESTOR_MASTER_KEY") {
                if !raw.is_empty() {
                    self.encryption = Some(EncryptionConfig::new(MasterKey::from_hex(&raw)?));
                }
            }
        }
        Ok(self)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Reject invalid combinations before any cache traffic runs.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".into()));
        }
        if self.ttl.is_zero() {
            return Err(Error::Config("ttl must be positive".into()));
        }
        if self.l1_enabled {
            if self.l1.max_bytes == 0 {
                return Err(Error::Config("l1.max_bytes must be positive".into()));
            }
            if !(0.0..1.0).contains(&self.l1.low_watermark) {
                return Err(Error::Config(format!(
                    "l1.low_watermark must be in [0, 1), got {}",
                    self.l1.low_watermark
                )));
            }
            if self.l1.swr_enabled && !(0.1..=1.0).contains(&self.l1.swr_ratio) {
                return Err(Error::Config(format!(
                    "l1.swr_ratio must be in [0.1, 1.0], got {}",
                    self.l1.swr_ratio
                )));
            }
            if !(0.0..1.0).contains(&self.l1.swr_jitter) {
                return Err(Error::Config(format!(
                    "l1.swr_jitter must be in [0, 1), got {}",
                    self.l1.swr_jitter
                )));
            }
        }
        if self.reliability.timeout.enabled {
            let t = &self.reliability.timeout;
            if t.multiplier <= 0.0 {
                return Err(Error::Config("timeout.multiplier must be positive".into()));
            }
            if t.max < t.base {
                return Err(Error::Config(
                    "timeout.max must be at least timeout.base".into(),
                ));
            }
        }
        if self.reliability.backpressure.enabled && self.reliability.backpressure.max_concurrent == 0
        {
            return Err(Error::Config(
                "backpressure.max_concurrent must be positive".into(),
            ));
        }
        if self.reliability.breaker.enabled && self.reliability.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be positive".into(),
            ));
        }
        if self.lock.enabled && self.lock.ttl.is_zero() {
            return Err(Error::Config("lock.ttl must be positive".into()));
        }
        if self.refresh_workers == 0 {
            return Err(Error::Config("refresh_workers must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
