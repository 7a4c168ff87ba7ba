//! # Consistent-Hash Ring
//!
//! Purpose: Map every cache key to exactly one owner, identically on every
//! node that shares the same membership view.
//!
//! ## Design Principles
//! 1. **Deterministic Placement**: the hash function and bucket layout are
//!    fixed by the wire protocol; every node recomputes the same table.
//! 2. **Ordinal Buckets**: the unsigned 32-bit space is cut into
//!    `membership + 1` equal ranges; bucket index equals the owner's
//!    ordinal, and the highest slot is the local sentinel.
//! 3. **Read-Mostly**: lookups take a read lock and binary-search; rebuilds
//!    are rare and exclusive.
//!
//! A lookup that lands outside every bucket is a fatal invariant violation:
//! the ranges tile the space by construction, so a miss means corrupted
//! state, not a routable condition.

use parking_lot::RwLock;

/// Size of the unsigned 32-bit hash space.
const HASH_SPACE: u64 = 1 << 32;

/// Translation from unsigned range boundaries to signed lookup bounds.
const SIGNED_OFFSET: i64 = (1i64 << 31) + 1;

/// Computes the routing hash of a key.
///
/// Starts at 17 and folds each UTF-16 code unit `c` as
/// `h = (h * 23 + c) * c` in wrapping 32-bit arithmetic. The function is
/// deliberately simple; it is part of the protocol and must match on every
/// node.
pub fn route_hash(key: &str) -> i32 {
    let mut hash: i32 = 17;
    for unit in key.encode_utf16() {
        let c = unit as i32;
        hash = hash.wrapping_mul(23).wrapping_add(c).wrapping_mul(c);
    }
    hash
}

/// Owner of one hash range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketOwner {
    /// A cache host, identified by its `host:port` address.
    Host(String),
    /// The local sentinel slot reserved on cache hosts.
    Local,
}

/// One contiguous hash range and its owner.
///
/// Bounds are signed 64-bit so the translated interval edges fit even where
/// they fall outside the 32-bit signed domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub owner: BucketOwner,
    pub min: i64,
    pub max: i64,
}

/// Immutable bucket table for one membership view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ring {
    buckets: Vec<Bucket>,
}

impl Ring {
    /// Builds the ring for an ordinal-ordered membership list.
    ///
    /// `reserve_local` appends the local sentinel in the highest slot; cache
    /// hosts pass true, clients pass false so every key routes to a host.
    pub fn build(members: &[String], reserve_local: bool) -> Ring {
        let count = members.len() + usize::from(reserve_local);
        if count == 0 {
            return Ring::default();
        }

        let n = count as u64;
        let mut buckets = Vec::with_capacity(count);
        for index in 0..count {
            let i = index as u64;
            let unsigned_min = i * (HASH_SPACE / n) + i.min(HASH_SPACE % n);
            let unsigned_max = if index + 1 == count {
                HASH_SPACE - 1
            } else {
                let j = i + 1;
                j * (HASH_SPACE / n) + j.min(HASH_SPACE % n) - 1
            };

            let owner = match members.get(index) {
                Some(address) => BucketOwner::Host(address.clone()),
                None => BucketOwner::Local,
            };
            let max = if index + 1 == count {
                // The translation leaves i32::MAX uncovered; extend the last
                // bucket so the tiling is total.
                i64::from(i32::MAX)
            } else {
                unsigned_max as i64 - SIGNED_OFFSET
            };
            buckets.push(Bucket {
                owner,
                min: unsigned_min as i64 - SIGNED_OFFSET,
                max,
            });
        }

        Ring { buckets }
    }

    /// Returns the bucket table in ascending hash order.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Returns true when the ring has no buckets at all.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Looks up the owner for a precomputed hash.
    ///
    /// Returns `None` only for an empty ring. On a populated ring the
    /// buckets tile the space; not finding one is a fatal invariant
    /// violation.
    pub fn owner_of_hash(&self, hash: i32) -> Option<&BucketOwner> {
        if self.buckets.is_empty() {
            return None;
        }

        let hash = i64::from(hash);
        let idx = self.buckets.partition_point(|bucket| bucket.min <= hash);
        let bucket = idx
            .checked_sub(1)
            .map(|i| &self.buckets[i])
            .filter(|bucket| hash <= bucket.max)
            .unwrap_or_else(|| panic!("routing ring does not cover hash {hash}"));
        Some(&bucket.owner)
    }

    /// Looks up the owner for a key.
    pub fn owner_of(&self, key: &str) -> Option<&BucketOwner> {
        self.owner_of_hash(route_hash(key))
    }
}

/// Shared routing table: the current membership and its ring under one
/// reader/writer lock, with an optional rebalance hook.
///
/// The hook fires once per rebuild that actually changes the membership set,
/// after the write lock is released.
pub struct RoutingTable {
    reserve_local: bool,
    state: RwLock<RingState>,
    rebalance_hook: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

struct RingState {
    members: Vec<String>,
    ring: Ring,
}

impl RoutingTable {
    /// Creates an empty routing table.
    pub fn new(reserve_local: bool) -> Self {
        RoutingTable {
            reserve_local,
            state: RwLock::new(RingState {
                members: Vec::new(),
                ring: Ring::build(&[], reserve_local),
            }),
            rebalance_hook: RwLock::new(None),
        }
    }

    /// Installs the load-balance hook invoked after each effective rebuild.
    pub fn set_rebalance_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.rebalance_hook.write() = Some(Box::new(hook));
    }

    /// Replaces the membership and recomputes the ring.
    ///
    /// Returns true when the membership actually changed.
    pub fn rebuild(&self, members: Vec<String>) -> bool {
        {
            let mut state = self.state.write();
            if state.members == members {
                return false;
            }
            tracing::debug!(total = members.len(), "membership changed; rebuilding ring");
            state.ring = Ring::build(&members, self.reserve_local);
            state.members = members;
        }

        if let Some(hook) = self.rebalance_hook.read().as_ref() {
            hook();
        }
        true
    }

    /// Returns a snapshot of the current ordinal-ordered membership.
    pub fn members(&self) -> Vec<String> {
        self.state.read().members.clone()
    }

    /// Returns the owner for a key under the current ring.
    pub fn owner_of(&self, key: &str) -> Option<BucketOwner> {
        self.state.read().ring.owner_of(key).cloned()
    }

    /// Returns the owner for a precomputed hash under the current ring.
    pub fn owner_of_hash(&self, hash: i32) -> Option<BucketOwner> {
        self.state.read().ring.owner_of_hash(hash).cloned()
    }

    /// Returns true when no host is known.
    pub fn has_hosts(&self) -> bool {
        !self.state.read().members.is_empty()
    }
}
