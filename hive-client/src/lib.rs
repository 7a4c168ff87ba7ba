//! # HiveCache Client
//!
//! Provide the application-facing library: consistent-hash routing to cache
//! hosts, persistent per-host connections with reconnect, batched dispatch
//! with caller-order responses, and an optional near-cache.

pub mod client;
pub mod host_pool;
pub mod membership;

pub use client::{CacheClient, PutOptions};
pub use host_pool::{ClientEvent, HostConn, HostPool};
pub use membership::{fetch_membership, MembershipPoller};

// Re-export the shared surface applications need.
pub use hive_common::config::{ClientConfig, WritePolicy};
pub use hive_common::error::{CacheError, CacheResult};
pub use hive_common::message::Expiry;
