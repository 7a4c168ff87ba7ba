//! # MemCache Storage Engine
//!
//! Purpose: Provide the memory-bounded key/value store behind every cache
//! host, with per-entry expirations, a tag index, and byte-budgeted
//! eviction.
//!
//! ## Design Principles
//! 1. **One Critical Section**: the map is guarded by a single
//!    reader/writer lock; concurrent reads never block each other.
//! 2. **Lazy Expiry Index**: a min-heap of next-expiry candidates drives the
//!    sweep in amortized O(k); stale candidates are revalidated against the
//!    live entry and dropped or requeued.
//! 3. **Events Outside The Lock**: removal notifications are collected under
//!    the lock and emitted after it is released, so listeners can never
//!    block an operation.
//! 4. **Misses Are Not Errors**: lookups return `None`, removals are
//!    idempotent.
//!
//! ## Structure Overview
//!
//! ```text
//! MemCache
//!   ├── state: RwLock<CacheState>
//!   │     ├── map: HashMap<Arc<str>, Entry>
//!   │     └── expiry_heap: BinaryHeap<Reverse<ExpiryCandidate>>
//!   ├── tags: TagTable            (its own lock, never nested)
//!   ├── transform: Box<dyn PayloadTransform>
//!   └── used/interned byte counters (atomics)
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use hive_common::config::StorageProvider;
use hive_common::error::{CacheError, CacheResult};

use crate::entry::{AddOptions, Expiration, RemovalCause, RemovalEvent};
use crate::tags::{glob_match, TagTable};
use crate::transform::{transform_for, PayloadTransform};

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct MemCacheConfig {
    /// Memory ceiling the limit percentage applies to, in bytes.
    pub memory_ceiling_bytes: usize,
    /// Share of the ceiling the cache may use, in percent.
    pub memory_limit_percent: u8,
    /// How far below the limit an eviction pass drives usage, in percent.
    pub hysteresis_percent: u8,
    /// Background sweep cadence.
    pub sweep_interval: Duration,
    /// Payload storage provider.
    pub storage_provider: StorageProvider,
}

impl Default for MemCacheConfig {
    fn default() -> Self {
        MemCacheConfig {
            memory_ceiling_bytes: 1024 * 1024 * 1024,
            memory_limit_percent: 50,
            hysteresis_percent: 10,
            sweep_interval: Duration::from_millis(250),
            storage_provider: StorageProvider::Plain,
        }
    }
}

impl MemCacheConfig {
    /// Byte budget for non-interned payloads.
    fn limit_bytes(&self) -> usize {
        let limit = self.memory_ceiling_bytes as u128 * u128::from(self.memory_limit_percent) / 100;
        limit.min(usize::MAX as u128) as usize
    }
}

/// One stored entry. Only the engine mutates these.
struct Entry {
    /// Stored (possibly transformed) payload bytes.
    payload: Arc<[u8]>,
    expiration: Expiration,
    /// Milliseconds since the engine epoch; refreshed on sliding GETs.
    last_access_ms: AtomicU64,
    interned: bool,
    notify: bool,
    /// Insertion sequence; eviction tie-break and heap revalidation token.
    seq: u64,
}

/// Expiry candidate in the min-heap; lazily revalidated at sweep time.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryCandidate {
    due_ms: u64,
    seq: u64,
    key: Arc<str>,
}

struct CacheState {
    map: HashMap<Arc<str>, Entry, RandomState>,
    expiry_heap: BinaryHeap<Reverse<ExpiryCandidate>>,
}

/// A removal decided under the lock, finished after it is released.
struct PendingRemoval {
    key: Arc<str>,
    notify: bool,
    cause: RemovalCause,
}

type RemovalListener = Box<dyn Fn(&RemovalEvent) + Send + Sync>;

/// Memory-bounded in-process cache store.
pub struct MemCache {
    state: RwLock<CacheState>,
    tags: TagTable,
    transform: Box<dyn PayloadTransform>,
    /// Non-interned stored payload bytes.
    used_bytes: AtomicUsize,
    /// Interned stored payload bytes, tracked for usage reporting only.
    interned_bytes: AtomicUsize,
    limit_bytes: usize,
    ceiling_bytes: usize,
    memory_limit_percent: u8,
    hysteresis_percent: u8,
    sweep_interval: Duration,
    seq: AtomicU64,
    listeners: RwLock<Vec<RemovalListener>>,
    /// Epoch for millisecond timestamps stored in entries.
    epoch: Instant,
}

impl MemCache {
    /// Creates an engine from its configuration.
    pub fn new(config: MemCacheConfig) -> Self {
        let limit_bytes = config.limit_bytes();
        MemCache {
            state: RwLock::new(CacheState {
                map: HashMap::with_hasher(RandomState::new()),
                expiry_heap: BinaryHeap::new(),
            }),
            tags: TagTable::new(),
            transform: transform_for(config.storage_provider),
            used_bytes: AtomicUsize::new(0),
            interned_bytes: AtomicUsize::new(0),
            limit_bytes,
            ceiling_bytes: config.memory_ceiling_bytes,
            memory_limit_percent: config.memory_limit_percent,
            hysteresis_percent: config.hysteresis_percent.min(100),
            sweep_interval: config.sweep_interval,
            seq: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            epoch: Instant::now(),
        }
    }

    /// Registers a removal event listener.
    ///
    /// Listeners run outside the engine lock and must not block; delivery is
    /// best-effort.
    pub fn on_removal(&self, listener: impl Fn(&RemovalEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Looks up a key, refreshing the sliding window on a hit.
    pub fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now_ms = self.now_ms();
        let now_wall = SystemTime::now();

        let outcome = {
            let state = self.state.read();
            match state.map.get(key) {
                None => return Ok(None),
                Some(entry) if entry_expired(entry, now_wall, now_ms) => None,
                Some(entry) => {
                    if matches!(entry.expiration, Expiration::Sliding(_)) {
                        entry.last_access_ms.store(now_ms, Ordering::Relaxed);
                    }
                    Some(Arc::clone(&entry.payload))
                }
            }
        };

        match outcome {
            Some(stored) => Ok(Some(self.transform.decode(&stored)?)),
            None => {
                // Expired on access: take the write lock, re-check, remove.
                let pending = {
                    let mut state = self.state.write();
                    let still_expired = state
                        .map
                        .get(key)
                        .map(|entry| entry_expired(entry, SystemTime::now(), self.now_ms()))
                        .unwrap_or(false);
                    if still_expired {
                        self.remove_locked(&mut state, key, RemovalCause::Expired)
                    } else {
                        None
                    }
                };
                self.finish_removals(pending.into_iter().collect());
                Ok(None)
            }
        }
    }

    /// Order-preserving batch lookup; a `None` slot is a miss.
    pub fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Returns every live payload under a tag at call time.
    pub fn get_tagged(&self, tag: &str) -> CacheResult<Vec<Vec<u8>>> {
        let keys = self.tags.keys_for(tag);
        let now_ms = self.now_ms();
        let now_wall = SystemTime::now();

        let stored: Vec<Arc<[u8]>> = {
            let state = self.state.read();
            keys.iter()
                .filter_map(|key| state.map.get(key.as_str()))
                .filter(|entry| !entry_expired(entry, now_wall, now_ms))
                .map(|entry| Arc::clone(&entry.payload))
                .collect()
        };

        stored.iter().map(|payload| self.transform.decode(payload)).collect()
    }

    /// Returns the live keys carrying a tag.
    pub fn tagged_keys(&self, tag: &str) -> Vec<String> {
        let keys = self.tags.keys_for(tag);
        let now_ms = self.now_ms();
        let now_wall = SystemTime::now();

        let state = self.state.read();
        keys.into_iter()
            .filter(|key| {
                state
                    .map
                    .get(key.as_str())
                    .map(|entry| !entry_expired(entry, now_wall, now_ms))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Inserts or replaces an entry.
    ///
    /// A key already carrying a different tag loses the old linkage first.
    /// Interned entries never carry an expiration.
    pub fn add_or_update(&self, key: &str, value: &[u8], options: &AddOptions) -> CacheResult<()> {
        let stored: Arc<[u8]> = self.transform.encode(value)?.into();
        let expiration = if options.interned { Expiration::None } else { options.expiration };
        let budget = if options.interned { self.ceiling_bytes } else { self.limit_bytes };
        if stored.len() > budget {
            return Err(CacheError::OutOfMemory {
                requested: stored.len(),
                limit: budget,
            });
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let now_ms = self.now_ms();
        let now_wall = SystemTime::now();

        {
            let mut state = self.state.write();
            let key_arc: Arc<str> = match state.map.get_key_value(key) {
                Some((existing, _)) => Arc::clone(existing),
                None => Arc::from(key),
            };

            let entry = Entry {
                payload: Arc::clone(&stored),
                expiration,
                last_access_ms: AtomicU64::new(now_ms),
                interned: options.interned,
                notify: options.notify_removed,
                seq,
            };
            let due = due_ms(&expiration, now_ms, now_ms, now_wall);

            if let Some(old) = state.map.insert(Arc::clone(&key_arc), entry) {
                self.debit(&old);
            }
            self.credit(options.interned, stored.len());

            if let Some(due_ms) = due {
                state.expiry_heap.push(Reverse(ExpiryCandidate {
                    due_ms,
                    seq,
                    key: key_arc,
                }));
            }
        }

        self.tags.set_tag(key, options.tag.as_deref());
        self.evict_if_needed();
        Ok(())
    }

    /// Batch upsert with the same options applied uniformly.
    pub fn add_or_update_many(&self, pairs: &[(String, Vec<u8>)], options: &AddOptions) -> CacheResult<()> {
        for (key, value) in pairs {
            self.add_or_update(key, value, options)?;
        }
        Ok(())
    }

    /// Removes a key. Returns true when a live entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        let pending = {
            let mut state = self.state.write();
            self.remove_locked(&mut state, key, RemovalCause::Removed)
        };
        let removed = pending.is_some();
        self.finish_removals(pending.into_iter().collect());
        removed
    }

    /// Removes a batch of keys; missing keys are ignored.
    pub fn remove_many(&self, keys: &[String]) -> usize {
        let pendings: Vec<PendingRemoval> = {
            let mut state = self.state.write();
            keys.iter()
                .filter_map(|key| self.remove_locked(&mut state, key, RemovalCause::Removed))
                .collect()
        };
        let removed = pendings.len();
        self.finish_removals(pendings);
        removed
    }

    /// Removes every key under a tag, optionally narrowed by a `'*'` glob.
    pub fn remove_tagged(&self, tag: &str, pattern: Option<&str>) -> usize {
        let keys = self.tags.keys_for(tag);
        let matched: Vec<String> = match pattern {
            Some(pattern) => keys.into_iter().filter(|key| glob_match(pattern, key)).collect(),
            None => keys,
        };

        let pendings: Vec<PendingRemoval> = {
            let mut state = self.state.write();
            matched
                .iter()
                .filter_map(|key| self.remove_locked(&mut state, key, RemovalCause::Removed))
                .collect()
        };
        let removed = pendings.len();
        self.finish_removals(pendings);
        removed
    }

    /// Drops every entry, interned ones included.
    pub fn clear(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            for (key, entry) in state.map.drain() {
                if entry.notify {
                    events.push(RemovalEvent {
                        key: key.to_string(),
                        cause: RemovalCause::Cleared,
                    });
                }
            }
            state.expiry_heap.clear();
            self.used_bytes.store(0, Ordering::Relaxed);
            self.interned_bytes.store(0, Ordering::Relaxed);
        }
        self.tags.clear();
        self.emit(events);
    }

    /// Returns the live keys matching a `'*'` glob pattern.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let now_ms = self.now_ms();
        let now_wall = SystemTime::now();
        let state = self.state.read();
        state
            .map
            .iter()
            .filter(|(key, entry)| {
                !entry_expired(entry, now_wall, now_ms) && glob_match(pattern, key)
            })
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Number of stored entries.
    pub fn count(&self) -> usize {
        self.state.read().map.len()
    }

    /// Configured share of the memory ceiling, in percent.
    pub fn memory_limit_percent(&self) -> u8 {
        self.memory_limit_percent
    }

    /// Stored payload bytes, interned entries included.
    pub fn current_usage_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed) + self.interned_bytes.load(Ordering::Relaxed)
    }

    /// Byte budget for non-interned payloads.
    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Removes due expired entries and, if needed, evicts to fit the budget.
    ///
    /// Returns the number of entries removed. Intended for the background
    /// sweeper but safe to call directly.
    pub fn sweep(&self) -> usize {
        let now_ms = self.now_ms();
        let now_wall = SystemTime::now();
        let mut pendings = Vec::new();

        {
            let mut state = self.state.write();
            loop {
                match state.expiry_heap.peek() {
                    Some(Reverse(candidate)) if candidate.due_ms <= now_ms => {}
                    _ => break,
                }
                let Reverse(candidate) = state.expiry_heap.pop().expect("peeked candidate exists");

                enum Action {
                    Drop,
                    Remove,
                    Requeue(u64),
                }
                let action = match state.map.get(candidate.key.as_ref()) {
                    Some(entry) if entry.seq == candidate.seq => {
                        if entry_expired(entry, now_wall, now_ms) {
                            Action::Remove
                        } else {
                            let access = entry.last_access_ms.load(Ordering::Relaxed);
                            match due_ms(&entry.expiration, access, now_ms, now_wall) {
                                // A touched sliding entry comes back later.
                                Some(due) => Action::Requeue(due.max(now_ms + 1)),
                                None => Action::Drop,
                            }
                        }
                    }
                    _ => Action::Drop,
                };

                match action {
                    Action::Drop => {}
                    Action::Remove => {
                        if let Some(pending) =
                            self.remove_locked(&mut state, candidate.key.as_ref(), RemovalCause::Expired)
                        {
                            pendings.push(pending);
                        }
                    }
                    Action::Requeue(due_ms) => {
                        state.expiry_heap.push(Reverse(ExpiryCandidate {
                            due_ms,
                            seq: candidate.seq,
                            key: candidate.key,
                        }));
                    }
                }
            }
        }

        let expired = pendings.len();
        self.finish_removals(pendings);
        expired + self.evict_if_needed()
    }

    /// Starts a background thread that sweeps at the configured interval.
    ///
    /// The returned handle must be stopped to avoid leaking the thread.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let interval = if self.sweep_interval.is_zero() {
            Duration::from_millis(1)
        } else {
            self.sweep_interval
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let cache = Arc::clone(self);

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, "sweep removed entries");
                }
            }
        });

        SweeperHandle {
            stop,
            join: Some(join),
        }
    }

    /// Milliseconds since the engine epoch.
    fn now_ms(&self) -> u64 {
        millis_u64(self.epoch.elapsed())
    }

    fn credit(&self, interned: bool, bytes: usize) {
        if interned {
            self.interned_bytes.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.used_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn debit(&self, entry: &Entry) {
        if entry.interned {
            self.interned_bytes.fetch_sub(entry.payload.len(), Ordering::Relaxed);
        } else {
            self.used_bytes.fetch_sub(entry.payload.len(), Ordering::Relaxed);
        }
    }

    /// Removes a key under the already-held write lock.
    fn remove_locked(
        &self,
        state: &mut CacheState,
        key: &str,
        cause: RemovalCause,
    ) -> Option<PendingRemoval> {
        let (key, entry) = state.map.remove_entry(key)?;
        self.debit(&entry);
        Some(PendingRemoval {
            key,
            notify: entry.notify,
            cause,
        })
    }

    /// Tag cleanup and event emission for removals, after the lock is gone.
    fn finish_removals(&self, pendings: Vec<PendingRemoval>) {
        if pendings.is_empty() {
            return;
        }
        let mut events = Vec::new();
        for pending in &pendings {
            self.tags.remove_key(&pending.key);
            if pending.notify {
                events.push(RemovalEvent {
                    key: pending.key.to_string(),
                    cause: pending.cause,
                });
            }
        }
        self.emit(events);
    }

    fn emit(&self, events: Vec<RemovalEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read();
        for event in &events {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    /// Evicts non-interned entries until usage drops through the hysteresis
    /// band. Eviction order is ascending last-access, ties by insertion.
    fn evict_if_needed(&self) -> usize {
        if self.used_bytes.load(Ordering::Relaxed) <= self.limit_bytes {
            return 0;
        }
        let target = (self.limit_bytes as u128 * (100 - u128::from(self.hysteresis_percent)) / 100) as usize;

        let pendings: Vec<PendingRemoval> = {
            let mut state = self.state.write();
            if self.used_bytes.load(Ordering::Relaxed) <= self.limit_bytes {
                return 0;
            }

            let mut candidates: Vec<(u64, u64, Arc<str>)> = state
                .map
                .iter()
                .filter(|(_, entry)| !entry.interned)
                .map(|(key, entry)| {
                    (
                        entry.last_access_ms.load(Ordering::Relaxed),
                        entry.seq,
                        Arc::clone(key),
                    )
                })
                .collect();
            candidates.sort_unstable();

            let mut removed = Vec::new();
            for (_, _, key) in candidates {
                if self.used_bytes.load(Ordering::Relaxed) <= target {
                    break;
                }
                if let Some(pending) = self.remove_locked(&mut state, key.as_ref(), RemovalCause::Evicted) {
                    removed.push(pending);
                }
            }
            removed
        };

        let count = pendings.len();
        if count > 0 {
            debug!(evicted = count, "evicted entries to fit the memory budget");
        }
        self.finish_removals(pendings);
        count
    }
}

/// Handle for the background expiration sweeper.
///
/// Call `stop` to signal shutdown and join the thread.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stops the sweeper and waits for the thread to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Returns true when the entry is expired at the given clocks.
///
/// Interned entries never expire.
fn entry_expired(entry: &Entry, now_wall: SystemTime, now_ms: u64) -> bool {
    if entry.interned {
        return false;
    }
    match entry.expiration {
        Expiration::None => false,
        Expiration::Absolute(at) => now_wall >= at,
        Expiration::Sliding(window) => {
            let idle = now_ms.saturating_sub(entry.last_access_ms.load(Ordering::Relaxed));
            idle >= millis_u64(window)
        }
    }
}

/// Next-expiry instant in engine milliseconds, or `None` for non-expiring
/// entries.
fn due_ms(expiration: &Expiration, last_access_ms: u64, now_ms: u64, now_wall: SystemTime) -> Option<u64> {
    match expiration {
        Expiration::None => None,
        Expiration::Absolute(at) => Some(match at.duration_since(now_wall) {
            Ok(remaining) => now_ms.saturating_add(millis_u64(remaining)),
            Err(_) => now_ms,
        }),
        Expiration::Sliding(window) => Some(last_access_ms.saturating_add(millis_u64(*window))),
    }
}

fn millis_u64(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn cache() -> MemCache {
        MemCache::new(MemCacheConfig::default())
    }

    fn small_cache(ceiling: usize, percent: u8) -> MemCache {
        MemCache::new(MemCacheConfig {
            memory_ceiling_bytes: ceiling,
            memory_limit_percent: percent,
            hysteresis_percent: 10,
            ..MemCacheConfig::default()
        })
    }

    #[test]
    fn add_get_roundtrip() {
        let cache = cache();
        cache.add_or_update("alpha", b"value", &AddOptions::default()).unwrap();
        assert_eq!(cache.get("alpha").unwrap().unwrap(), b"value");
    }

    #[test]
    fn remove_then_get_misses() {
        let cache = cache();
        cache.add_or_update("alpha", b"value", &AddOptions::default()).unwrap();
        assert!(cache.remove("alpha"));
        assert!(cache.get("alpha").unwrap().is_none());
        // Removals are idempotent.
        assert!(!cache.remove("alpha"));
    }

    #[test]
    fn overwrite_returns_latest() {
        let cache = cache();
        cache.add_or_update("alpha", b"v1", &AddOptions::default()).unwrap();
        cache.add_or_update("alpha", b"v2", &AddOptions::default()).unwrap();
        assert_eq!(cache.get("alpha").unwrap().unwrap(), b"v2");
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn get_many_preserves_order() {
        let cache = cache();
        cache.add_or_update("a", b"1", &AddOptions::default()).unwrap();
        cache.add_or_update("c", b"3", &AddOptions::default()).unwrap();

        let slots = cache
            .get_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(slots[0].as_deref(), Some(&b"1"[..]));
        assert_eq!(slots[1], None);
        assert_eq!(slots[2].as_deref(), Some(&b"3"[..]));
    }

    #[test]
    fn absolute_expiry_hides_value() {
        let cache = cache();
        let options = AddOptions::expiring(Expiration::Absolute(
            SystemTime::now() + Duration::from_millis(30),
        ));
        cache.add_or_update("alpha", b"value", &options).unwrap();
        assert!(cache.get("alpha").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("alpha").unwrap().is_none());
        // Expired-on-access removal frees the slot.
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn sliding_expiry_refreshes_on_get() {
        let cache = cache();
        let options = AddOptions::expiring(Expiration::Sliding(Duration::from_millis(200)));
        cache.add_or_update("alpha", b"value", &options).unwrap();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(100));
            assert!(cache.get("alpha").unwrap().is_some(), "read within the window keeps the entry");
        }

        std::thread::sleep(Duration::from_millis(300));
        assert!(cache.get("alpha").unwrap().is_none());
    }

    #[test]
    fn sweep_removes_due_entries() {
        let cache = cache();
        let options = AddOptions::expiring(Expiration::Absolute(
            SystemTime::now() + Duration::from_millis(10),
        ));
        cache.add_or_update("alpha", b"value", &options).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn sweeper_thread_clears_expired() {
        let cache = Arc::new(MemCache::new(MemCacheConfig {
            sweep_interval: Duration::from_millis(10),
            ..MemCacheConfig::default()
        }));
        let options = AddOptions::expiring(Expiration::Absolute(
            SystemTime::now() + Duration::from_millis(20),
        ));
        cache.add_or_update("alpha", b"value", &options).unwrap();

        let handle = cache.start_sweeper();
        std::thread::sleep(Duration::from_millis(100));
        handle.stop();

        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn sliding_entry_survives_sweep_after_touch() {
        let cache = cache();
        let options = AddOptions::expiring(Expiration::Sliding(Duration::from_millis(150)));
        cache.add_or_update("alpha", b"value", &options).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.get("alpha").unwrap().is_some());
        // The original candidate is due, but the touch pushed the deadline.
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.sweep(), 0);
        assert!(cache.get("alpha").unwrap().is_some());
    }

    #[test]
    fn interned_entries_never_expire_or_evict() {
        let cache = small_cache(200, 50);
        cache
            .add_or_update(
                "pinned",
                &[b'p'; 40],
                &AddOptions {
                    // The expiration is discarded for interned entries.
                    expiration: Expiration::Absolute(SystemTime::now() + Duration::from_millis(5)),
                    interned: true,
                    ..AddOptions::default()
                },
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        cache.sweep();
        assert!(cache.get("pinned").unwrap().is_some());

        // Flood the budget; only non-interned entries are evicted.
        for i in 0..30 {
            cache.add_or_update(&format!("k{i}"), &[b'x'; 10], &AddOptions::default()).unwrap();
        }
        assert!(cache.get("pinned").unwrap().is_some());
        assert!(cache.current_usage_bytes() - 40 <= cache.limit_bytes());
    }

    #[test]
    fn eviction_converges_below_limit_oldest_first() {
        // ceiling 200 at 50% -> limit 100, target 90 after hysteresis.
        let cache = small_cache(200, 50);
        for i in 0..20 {
            cache.add_or_update(&format!("k{i}"), &[b'x'; 10], &AddOptions::default()).unwrap();
        }

        assert!(cache.current_usage_bytes() <= 100);
        assert!(cache.current_usage_bytes() > 0);
        // The earliest-inserted entries go first.
        assert!(cache.get("k0").unwrap().is_none());
        assert!(cache.get("k19").unwrap().is_some());
    }

    #[test]
    fn oversize_payload_is_a_typed_failure() {
        let cache = small_cache(200, 50);
        let err = cache
            .add_or_update("big", &[b'x'; 500], &AddOptions::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::OutOfMemory { requested: 500, limit: 100 }));
    }

    #[test]
    fn removal_events_fire_for_notify_entries_only() {
        let cache = cache();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        cache.on_removal(move |event| sink.lock().push(event.clone()));

        cache
            .add_or_update(
                "loud",
                b"value",
                &AddOptions {
                    notify_removed: true,
                    ..AddOptions::default()
                },
            )
            .unwrap();
        cache.add_or_update("quiet", b"value", &AddOptions::default()).unwrap();

        cache.remove("loud");
        cache.remove("quiet");

        let events = events.lock();
        assert_eq!(
            *events,
            vec![RemovalEvent {
                key: "loud".to_string(),
                cause: RemovalCause::Removed,
            }]
        );
    }

    #[test]
    fn expired_event_carries_expired_cause() {
        let cache = cache();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        cache.on_removal(move |event| sink.lock().push(event.clone()));

        cache
            .add_or_update(
                "alpha",
                b"value",
                &AddOptions {
                    expiration: Expiration::Absolute(SystemTime::now() + Duration::from_millis(10)),
                    notify_removed: true,
                    ..AddOptions::default()
                },
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        cache.sweep();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cause, RemovalCause::Expired);
    }

    #[test]
    fn tagged_key_visible_through_tag_and_key() {
        let cache = cache();
        cache
            .add_or_update(
                "alpha",
                b"value",
                &AddOptions {
                    tag: Some("news".to_string()),
                    ..AddOptions::default()
                },
            )
            .unwrap();

        assert_eq!(cache.tagged_keys("news"), vec!["alpha".to_string()]);
        assert_eq!(cache.get_tagged("news").unwrap(), vec![b"value".to_vec()]);

        cache.remove("alpha");
        assert!(cache.tagged_keys("news").is_empty());
        assert!(cache.get_tagged("news").unwrap().is_empty());
    }

    #[test]
    fn retag_moves_key_between_tags() {
        let cache = cache();
        let tagged = |tag: &str| AddOptions {
            tag: Some(tag.to_string()),
            ..AddOptions::default()
        };
        cache.add_or_update("alpha", b"value", &tagged("t1")).unwrap();
        cache.add_or_update("alpha", b"value", &tagged("t2")).unwrap();

        assert!(cache.tagged_keys("t1").is_empty());
        assert_eq!(cache.tagged_keys("t2"), vec!["alpha".to_string()]);
    }

    #[test]
    fn remove_tagged_honors_glob_pattern() {
        let cache = cache();
        let tagged = AddOptions {
            tag: Some("sessions".to_string()),
            ..AddOptions::default()
        };
        cache.add_or_update("user:1", b"a", &tagged).unwrap();
        cache.add_or_update("user:2", b"b", &tagged).unwrap();
        cache.add_or_update("admin:1", b"c", &tagged).unwrap();

        assert_eq!(cache.remove_tagged("sessions", Some("user:*")), 2);
        assert!(cache.get("user:1").unwrap().is_none());
        assert!(cache.get("admin:1").unwrap().is_some());

        assert_eq!(cache.remove_tagged("sessions", Some("*")), 1);
        assert!(cache.get("admin:1").unwrap().is_none());
    }

    #[test]
    fn clear_empties_everything() {
        let cache = cache();
        cache
            .add_or_update(
                "alpha",
                b"value",
                &AddOptions {
                    tag: Some("news".to_string()),
                    interned: true,
                    ..AddOptions::default()
                },
            )
            .unwrap();
        cache.add_or_update("beta", b"value", &AddOptions::default()).unwrap();

        cache.clear();
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.current_usage_bytes(), 0);
        assert!(cache.tagged_keys("news").is_empty());
    }

    #[test]
    fn keys_filters_by_pattern() {
        let cache = cache();
        cache.add_or_update("user:1", b"a", &AddOptions::default()).unwrap();
        cache.add_or_update("user:2", b"b", &AddOptions::default()).unwrap();
        cache.add_or_update("other", b"c", &AddOptions::default()).unwrap();

        let mut keys = cache.keys("user:*");
        keys.sort();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
        assert_eq!(cache.keys("*").len(), 3);
    }

    #[test]
    fn gzip_provider_roundtrips_through_engine() {
        let cache = MemCache::new(MemCacheConfig {
            storage_provider: StorageProvider::Gzip,
            ..MemCacheConfig::default()
        });
        let value = vec![b'v'; 2048];
        cache.add_or_update("alpha", &value, &AddOptions::default()).unwrap();
        assert_eq!(cache.get("alpha").unwrap().unwrap(), value);
        // Compressed accounting stays below the raw size for repetitive data.
        assert!(cache.current_usage_bytes() < value.len());
    }
}
