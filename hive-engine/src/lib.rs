//! # HiveCache Storage Engine
//!
//! Provide the in-memory cache backend with per-entry expirations, a
//! secondary tag index, payload transforms, and byte-budgeted eviction.

mod cache;
mod entry;
mod tags;
mod transform;

pub use cache::{MemCache, MemCacheConfig, SweeperHandle};
pub use entry::{AddOptions, Expiration, RemovalCause, RemovalEvent};
pub use tags::{glob_match, TagTable};
pub use transform::{transform_for, GzipTransform, PayloadTransform, PlainTransform};
