//! # HiveCache Host
//!
//! Serve one partition of the key space: the wire protocol over TCP, the
//! persistent link to the manager, and the 1 Hz performance sampler.

pub mod manager_link;
pub mod perf;
pub mod service;

pub use manager_link::{LinkEvent, ManagerLink};
pub use perf::PerfCounters;
pub use service::{HostContext, HostService};
