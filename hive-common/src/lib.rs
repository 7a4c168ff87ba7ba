// hive-common - Shared wire protocol, routing, and configuration for HiveCache
//
// This crate defines everything client, host, and manager must agree on:
// the length-prefixed framing, the message encoding, the consistent-hash
// ring, the error kinds, and the configuration surface.

pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod perf;
pub mod ring;

// Re-export for convenience
pub use config::{ClientConfig, HostConfig, ManagerConfig, StorageProvider, WritePolicy};
pub use error::{CacheError, CacheResult};
pub use frame::{read_frame, write_frame, FrameParser, LENGTH_PREFIX_BYTES};
pub use message::{EntryFlags, Expiry, HostRequest, HostResponse, ManagerFrame};
pub use perf::{ClusterSnapshot, HostCounters, HostInfo};
pub use ring::{route_hash, Bucket, BucketOwner, Ring, RoutingTable};
