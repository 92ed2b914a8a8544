//! Error types for the cachestor runtime

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the cache pipeline
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Backend / Transport Errors
    // =========================================================================
    /// Connection-level backend failure (transient, feeds the circuit breaker)
    #[error("backend connection failed during {operation} for '{key_hint}': {reason}")]
    Connection {
        operation: &'static str,
        key_hint: String,
        reason: String,
    },

    /// Backend call exceeded its effective timeout (transient, feeds the breaker)
    #[error("backend {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Admission control rejected the call before it reached the backend
    #[error("backpressure rejected {operation}: {in_flight} calls already in flight")]
    BackpressureRejected {
        operation: &'static str,
        in_flight: usize,
    },

    /// Circuit breaker is open; the call was short-circuited
    #[error("circuit open for namespace '{namespace}' ({operation}); retry after {retry_after_ms}ms")]
    CircuitOpen {
        namespace: String,
        operation: &'static str,
        retry_after_ms: u64,
    },

    /// Non-retryable backend failure (auth, protocol); surfaced as-is
    #[error("backend {operation} failed permanently: {reason}")]
    PermanentBackend {
        operation: &'static str,
        reason: String,
    },

    // =========================================================================
    // Envelope / Pipeline Errors
    // =========================================================================
    /// Envelope could not be parsed (unknown version, truncation, type confusion)
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Declared decompressed size or compression ratio exceeds the configured bounds
    #[error("envelope size limit exceeded: declared {declared} bytes, limit {limit} bytes")]
    SizeLimitExceeded { declared: u64, limit: u64 },

    /// Checksum over the compressed payload did not match
    #[error("envelope integrity failure: checksum {actual:#018x} != expected {expected:#018x}")]
    Integrity { expected: u64, actual: u64 },

    /// Decompression failed after the envelope guards passed
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// AEAD open failed (tag mismatch, truncated ciphertext, wrong key or AAD)
    #[error("decryption failed for '{key_hint}': {reason}")]
    Decryption { key_hint: String, reason: String },

    /// Envelope's format tag does not match the configured serializer
    #[error("serializer mismatch: envelope carries '{found}', configured serializer is '{expected}'")]
    SerializerMismatch { expected: String, found: String },

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Input value is outside the serializer's supported container model
    #[error("unsupported value for {serializer} serializer: {reason}")]
    UnsupportedValue {
        serializer: &'static str,
        reason: String,
    },

    /// Encoding or decoding failed inside a serializer
    #[error("serialization failed ({serializer}): {reason}")]
    Serialization {
        serializer: &'static str,
        reason: String,
    },

    /// Cache key could not be generated from the given arguments
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    // =========================================================================
    // Configuration / Lifecycle Errors
    // =========================================================================
    /// Invalid configuration detected at construction time
    #[error("configuration error: {0}")]
    Config(String),

    /// The user-supplied loader failed; propagated unchanged and never cached
    #[error("loader failed: {0}")]
    Application(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// I/O error (file backend)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this failure should advance the circuit breaker.
    ///
    /// Only transport-level transient failures count. Rejections
    /// (backpressure, open circuit), permanent backend faults, pipeline
    /// faults, and application errors never trip the breaker.
    pub fn feeds_breaker(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Timeout { .. })
    }

    /// Whether this error came from the cache layer (as opposed to the
    /// user's loader). Cache-layer errors are subject to the configured
    /// fallback policy; application errors always propagate.
    pub fn is_cache_layer(&self) -> bool {
        !matches!(self, Error::Application(_))
    }

    /// Whether a read-path decode failure should be handled as a miss
    /// (bad cached bytes are re-fetched or recomputed, never served).
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            Error::MalformedEnvelope(_)
                | Error::SizeLimitExceeded { .. }
                | Error::Integrity { .. }
                | Error::Decompression(_)
                | Error::Decryption { .. }
                | Error::SerializerMismatch { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
