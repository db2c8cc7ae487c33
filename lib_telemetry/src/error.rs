//! # Fan-out Error Types
//!
//! A single error enum for every fallible operation in the core. Rate-limit
//! and store failures travel back to the ingestion caller; flush-time failures
//! are logged inside the scheduler and never surface here.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the telemetry fan-out core.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The origin exceeded one of its admission windows.
    #[error("Admission denied for origin {origin}; retry after {retry_after}")]
    AdmissionDenied {
        /// The rate-limited device identity.
        origin: String,
        /// Start of the next whole minute, when the caller may try again.
        retry_after: DateTime<Utc>,
    },

    /// The ephemeral store could not complete an operation. Ingestion fails
    /// closed on this error rather than proceeding unmetered.
    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// The status provider could not compute a snapshot.
    #[error("Status provider failure: {0}")]
    StatusProvider(String),

    /// A reading failed validation before it reached the rate limiter.
    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    /// Configuration values violate an invariant.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The addressed transport connection is not registered.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),
}

#[cfg(feature = "connections")]
impl From<redis::RedisError> for FanoutError {
    fn from(err: redis::RedisError) -> Self {
        FanoutError::BackingStoreUnavailable(err.to_string())
    }
}

/// Result type for fan-out operations.
pub type Result<T> = std::result::Result<T, FanoutError>;
