//! # Performance Counter Types
//!
//! Snapshot structs shared between hosts (which sample them), the manager
//! (which aggregates them), and observers (which poll them). Kept decoupled
//! from the hot path; sampling policy lives with the host.

use serde::{Deserialize, Serialize};

/// Point-in-time performance counters for one cache host.
///
/// Rates are per-second values computed by the host's 1 Hz sampler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCounters {
    /// Number of objects currently cached.
    pub cached_objects: u64,
    /// Memory used by cached payloads, in megabytes.
    pub memory_usage_mb: f64,
    /// Memory used as a percentage of the configured cache limit.
    pub memory_usage_percent: f64,
    /// All operations per second.
    pub total_rate: f64,
    /// Add/update operations per second.
    pub add_rate: f64,
    /// Get operations per second.
    pub get_rate: f64,
    /// Remove operations per second.
    pub remove_rate: f64,
}

/// One host's entry in the cluster snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Host address as `host:port`.
    pub address: String,
    /// Ordinal assigned at registration, in ring order.
    pub ordinal: usize,
    /// Whether the most recent poll reached the host.
    pub live: bool,
    /// Most recently reported counters.
    pub counters: HostCounters,
}

/// What the manager returns to observers: every known host with its most
/// recent counters. Rebuilt on every poll; never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub hosts: Vec<HostInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_json_roundtrip() {
        let snapshot = ClusterSnapshot {
            hosts: vec![HostInfo {
                address: "10.0.0.1:33333".into(),
                ordinal: 0,
                live: true,
                counters: HostCounters {
                    cached_objects: 3,
                    memory_usage_mb: 0.5,
                    memory_usage_percent: 4.2,
                    total_rate: 9.0,
                    add_rate: 3.0,
                    get_rate: 5.0,
                    remove_rate: 1.0,
                },
            }],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: ClusterSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);
    }
}
