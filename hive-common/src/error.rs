//! # Error Kinds
//!
//! Purpose: Define the typed failures shared by client, host, and manager.
//!
//! ## Design Principles
//! 1. **Miss Is Not An Error**: absent keys surface as `Option::None` slots,
//!    never through this enum.
//! 2. **Fail Fast**: framing and encoding violations close the affected
//!    connection immediately.
//! 3. **Caller-Facing**: every variant here is meaningful to application
//!    code; connection-level retries stay inside the reconnect machinery.

use thiserror::Error;

/// Result type used across the workspace.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the cache system.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No reachable host exists for the routed key set.
    #[error("no cache hosts available")]
    NoHostsAvailable,

    /// A send/receive deadline elapsed before the peer responded.
    #[error("request timed out")]
    Timeout,

    /// A frame exceeded the configured maximum message size.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversize { size: usize, limit: usize },

    /// A payload cannot fit the cache memory ceiling at all.
    #[error("payload of {requested} bytes cannot fit within the {limit} byte cache budget")]
    OutOfMemory { requested: usize, limit: usize },

    /// Initial configuration failed validation; the process must refuse to start.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Unexpected protocol or encoding failure; the affected connection is closed.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Builds a protocol error from any displayable detail.
    pub fn protocol(detail: impl Into<String>) -> Self {
        CacheError::Protocol(detail.into())
    }

    /// Returns true when the failure should tear down the connection it
    /// occurred on and hand control to the reconnect state machine.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::Timeout | CacheError::Protocol(_) | CacheError::Io(_) | CacheError::Oversize { .. }
        )
    }
}
