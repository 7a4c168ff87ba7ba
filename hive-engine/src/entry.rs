//! # Entry Model
//!
//! Expiration modes, per-write options, and removal event types for the
//! storage engine.

use std::time::{Duration, SystemTime};

/// Expiration mode of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// Entry never expires on its own.
    #[default]
    None,
    /// Entry expires at a wall-clock instant.
    Absolute(SystemTime),
    /// Entry expires after going unread for the window.
    Sliding(Duration),
}

/// Per-write options for `add_or_update`.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Expiration mode. Ignored for interned entries, which never expire.
    pub expiration: Expiration,
    /// Optional tag; a key carries at most one.
    pub tag: Option<String>,
    /// Exempt from expiration and eviction; removed only explicitly.
    pub interned: bool,
    /// Emit a removal event when the entry disappears for any reason.
    pub notify_removed: bool,
}

impl AddOptions {
    /// Options with only an expiration set.
    pub fn expiring(expiration: Expiration) -> Self {
        AddOptions {
            expiration,
            ..AddOptions::default()
        }
    }
}

/// Why an entry disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Explicit remove request.
    Removed,
    /// Expiration sweep or expired-on-access.
    Expired,
    /// Evicted to fit the memory budget.
    Evicted,
    /// Cache clear.
    Cleared,
}

/// Best-effort notification that a notify-flagged entry disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalEvent {
    pub key: String,
    pub cause: RemovalCause,
}
