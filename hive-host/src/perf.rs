//! # Performance Counters
//!
//! Purpose: Aggregate operation counts cheaply on the request path and turn
//! them into 1 Hz rate gauges for the manager.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: record calls touch relaxed atomics only.
//! 2. **Sampled Gauges**: rates and memory gauges are computed by a 1 Hz
//!    sampler, never on the request path.
//! 3. **Snapshot Access**: observers get plain structs, no locks held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use hive_common::perf::HostCounters;
use hive_engine::MemCache;

/// Thread-safe operation counters for one host.
///
/// `Ordering::Relaxed` is sufficient: the sampler only needs eventually
/// consistent totals, not cross-field ordering.
pub struct PerfCounters {
    adds: AtomicU64,
    gets: AtomicU64,
    removes: AtomicU64,
    window: RwLock<SampleWindow>,
    gauges: RwLock<HostCounters>,
}

struct SampleWindow {
    adds: u64,
    gets: u64,
    removes: u64,
    at: Instant,
}

impl PerfCounters {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        PerfCounters {
            adds: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            window: RwLock::new(SampleWindow {
                adds: 0,
                gets: 0,
                removes: 0,
                at: Instant::now(),
            }),
            gauges: RwLock::new(HostCounters::default()),
        }
    }

    /// Records add/update operations.
    pub fn record_add(&self, count: u64) {
        self.adds.fetch_add(count, Ordering::Relaxed);
    }

    /// Records get operations.
    pub fn record_get(&self, count: u64) {
        self.gets.fetch_add(count, Ordering::Relaxed);
    }

    /// Records remove operations.
    pub fn record_remove(&self, count: u64) {
        self.removes.fetch_add(count, Ordering::Relaxed);
    }

    /// Recomputes the gauges from the deltas since the previous sample.
    pub fn sample(&self, cache: &MemCache) {
        let adds = self.adds.load(Ordering::Relaxed);
        let gets = self.gets.load(Ordering::Relaxed);
        let removes = self.removes.load(Ordering::Relaxed);

        let (add_rate, get_rate, remove_rate) = {
            let mut window = self.window.write();
            let elapsed = window.at.elapsed().as_secs_f64().max(0.001);
            let rates = (
                (adds - window.adds) as f64 / elapsed,
                (gets - window.gets) as f64 / elapsed,
                (removes - window.removes) as f64 / elapsed,
            );
            *window = SampleWindow {
                adds,
                gets,
                removes,
                at: Instant::now(),
            };
            rates
        };

        let usage = cache.current_usage_bytes();
        let limit = cache.limit_bytes().max(1);
        *self.gauges.write() = HostCounters {
            cached_objects: cache.count() as u64,
            memory_usage_mb: usage as f64 / (1024.0 * 1024.0),
            memory_usage_percent: usage as f64 * 100.0 / limit as f64,
            total_rate: add_rate + get_rate + remove_rate,
            add_rate,
            get_rate,
            remove_rate,
        };
    }

    /// Returns the most recently sampled gauges.
    pub fn snapshot(&self) -> HostCounters {
        self.gauges.read().clone()
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        PerfCounters::new()
    }
}

/// Spawns the 1 Hz sampler task. Abort the handle to stop it.
pub fn spawn_sampler(perf: Arc<PerfCounters>, cache: Arc<MemCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            perf.sample(&cache);
        }
    })
}
