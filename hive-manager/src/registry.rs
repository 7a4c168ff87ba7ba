//! # Membership Registry
//!
//! Purpose: Hold the ordered host descriptor list that defines every ring in
//! the cluster, plus the outbound channel used to push frames to each host.
//!
//! ## Design Principles
//! 1. **One Critical Section**: the descriptor list lives under a single
//!    reader/writer lock; fan-out IO happens outside it on snapshots.
//! 2. **Dense Ordinals**: a host's ordinal is its index in registration
//!    order; departures compact the list so every node derives the same
//!    shifted ordinals from its own membership copy.
//! 3. **Rebuilt Snapshots**: cluster snapshots are constructed fresh per
//!    request and never mutated in place.

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use hive_common::message::ManagerFrame;
use hive_common::perf::{ClusterSnapshot, HostCounters, HostInfo};

/// One registered host and its push channel.
struct HostSlot {
    address: String,
    counters: HostCounters,
    live: bool,
    failed_polls: u32,
    poll_pending: bool,
    outbox: UnboundedSender<ManagerFrame>,
}

/// Result of a registration, snapshotted for fan-out outside the lock.
pub struct RegisterOutcome {
    /// Ordinal assigned to the registering host.
    pub ordinal: usize,
    /// Full membership in ordinal order, the new host included.
    pub members: Vec<String>,
    /// Every other host's address and outbox, for fan-out.
    pub peers: Vec<(String, UnboundedSender<ManagerFrame>)>,
    /// Membership size after registration.
    pub total: usize,
}

/// The authoritative, ordinal-ordered membership list.
pub struct Registry {
    slots: RwLock<Vec<HostSlot>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Registers a host, assigning it the next ordinal.
    ///
    /// A host re-registering after a reconnect keeps its slot and ordinal;
    /// only its channel and counters are replaced.
    pub fn register(
        &self,
        address: String,
        object_count: u64,
        outbox: UnboundedSender<ManagerFrame>,
    ) -> RegisterOutcome {
        let mut slots = self.slots.write();

        let ordinal = match slots.iter().position(|slot| slot.address == address) {
            Some(existing) => {
                let slot = &mut slots[existing];
                slot.outbox = outbox;
                slot.live = true;
                slot.failed_polls = 0;
                slot.poll_pending = false;
                existing
            }
            None => {
                slots.push(HostSlot {
                    address: address.clone(),
                    counters: HostCounters {
                        cached_objects: object_count,
                        ..HostCounters::default()
                    },
                    live: true,
                    failed_polls: 0,
                    poll_pending: false,
                    outbox,
                });
                slots.len() - 1
            }
        };

        RegisterOutcome {
            ordinal,
            members: slots.iter().map(|slot| slot.address.clone()).collect(),
            peers: slots
                .iter()
                .filter(|slot| slot.address != address)
                .map(|slot| (slot.address.clone(), slot.outbox.clone()))
                .collect(),
            total: slots.len(),
        }
    }

    /// Removes a host and compacts the ordinals.
    ///
    /// Returns the remaining peers to notify, or `None` when the address was
    /// not registered.
    pub fn remove(&self, address: &str) -> Option<Vec<(String, UnboundedSender<ManagerFrame>)>> {
        let mut slots = self.slots.write();
        let index = slots.iter().position(|slot| slot.address == address)?;
        slots.remove(index);
        debug!(%address, remaining = slots.len(), "host deregistered");
        Some(
            slots
                .iter()
                .map(|slot| (slot.address.clone(), slot.outbox.clone()))
                .collect(),
        )
    }

    /// Ordered membership snapshot.
    pub fn members(&self) -> Vec<String> {
        self.slots.read().iter().map(|slot| slot.address.clone()).collect()
    }

    /// Every host's address and outbox, for the poller.
    pub fn outboxes(&self) -> Vec<(String, UnboundedSender<ManagerFrame>)> {
        self.slots
            .read()
            .iter()
            .map(|slot| (slot.address.clone(), slot.outbox.clone()))
            .collect()
    }

    /// Stores a counters report from a host and marks it live.
    pub fn update_counters(&self, address: &str, counters: HostCounters) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.iter_mut().find(|slot| slot.address == address) {
            slot.counters = counters;
            slot.live = true;
            slot.failed_polls = 0;
            slot.poll_pending = false;
        }
    }

    /// Starts a poll round: hosts that never answered the previous round
    /// accrue a failure and drop their liveness flag.
    ///
    /// Returns the addresses that crossed `max_failed_polls` (never any when
    /// the limit is zero, which disables automatic destruction).
    pub fn begin_poll_round(&self, max_failed_polls: u32) -> Vec<String> {
        let mut slots = self.slots.write();
        let mut exceeded = Vec::new();
        for slot in slots.iter_mut() {
            if slot.poll_pending {
                slot.failed_polls += 1;
                slot.live = false;
                if max_failed_polls > 0 && slot.failed_polls >= max_failed_polls {
                    exceeded.push(slot.address.clone());
                }
            }
            slot.poll_pending = true;
        }
        exceeded
    }

    /// True when the host's push channel can no longer deliver, meaning its
    /// link task has exited. `None` for unknown addresses.
    pub fn link_closed(&self, address: &str) -> Option<bool> {
        self.slots
            .read()
            .iter()
            .find(|slot| slot.address == address)
            .map(|slot| slot.outbox.is_closed())
    }

    /// Builds a fresh cluster snapshot for observers.
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            hosts: self
                .slots
                .read()
                .iter()
                .enumerate()
                .map(|(ordinal, slot)| HostInfo {
                    address: slot.address.clone(),
                    ordinal,
                    live: slot.live,
                    counters: slot.counters.clone(),
                })
                .collect(),
        }
    }

    /// Number of registered hosts.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// True when no host is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
