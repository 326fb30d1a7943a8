//! Error types for claw-swarm.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in swarm coordination.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// A telemetry query against a single device failed.
    #[error("telemetry query failed for device {device_index}: {reason}")]
    Query {
        /// Device index that was queried.
        device_index: u32,
        /// Backend-specific failure description.
        reason: String,
    },

    /// Device enumeration failed.
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    /// The circuit breaker is open; the call was rejected without contacting the source.
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Remaining cooldown before a trial call is admitted.
        retry_after: Duration,
    },

    /// Discovery did not succeed after all retries.
    #[error("discovery failed after {attempts} attempts: {reason}")]
    Discovery {
        /// Number of enumeration attempts made.
        attempts: u32,
        /// Last enumeration failure.
        reason: String,
    },

    /// Gossip delivery to a peer failed.
    #[error("gossip delivery to {peer} failed: {reason}")]
    GossipDelivery {
        /// Target peer endpoint.
        peer: String,
        /// Transport failure description.
        reason: String,
    },

    /// An argument was outside its accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Returns true if a retry policy may attempt the operation again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Query { .. } | Self::Enumeration(_) | Self::GossipDelivery { .. } | Self::Io(_)
        )
    }

    /// Returns true if this failure counts towards tripping a circuit breaker.
    #[must_use]
    pub const fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::CircuitOpen { .. })
    }
}

/// Result type for swarm operations.
pub type Result<T> = std::result::Result<T, SwarmError>;
