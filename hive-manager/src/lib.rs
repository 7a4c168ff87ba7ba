//! # HiveCache Manager
//!
//! Own the authoritative membership list: hosts register here, membership
//! changes fan out to every host, and observers poll cluster snapshots.

pub mod registry;
pub mod service;

pub use registry::{RegisterOutcome, Registry};
pub use service::{ManagerContext, ManagerService};
