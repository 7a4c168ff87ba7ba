//! # Cache Client API
//!
//! Purpose: Expose the application-facing cache operations, routing every
//! key to its owner host, batching per host, and re-merging responses into
//! the caller's order.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `CacheClient` hides the pool, the ring, and the
//!    membership poller.
//! 2. **Caller-Order Batches**: per-host sub-responses are re-merged by the
//!    original slot index, never by host order.
//! 3. **Degrade Predictably**: disconnected hosts read as misses; writes
//!    follow the queue-or-drop policy; a fully unreachable cluster is a
//!    typed error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hive_common::config::ClientConfig;
use hive_common::error::{CacheError, CacheResult};
use hive_common::message::{EntryFlags, Expiry, HostRequest, HostResponse};
use hive_common::ring::{BucketOwner, RoutingTable};
use hive_engine::{AddOptions, Expiration, MemCache, MemCacheConfig};

use crate::host_pool::{ClientEvent, HostConn, HostPool};
use crate::membership::MembershipPoller;

/// Per-write options exposed to applications.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Expiration attached to the write.
    pub expiry: Expiry,
    /// Optional tag; a key carries at most one.
    pub tag: Option<String>,
    /// Exempt from expiration and eviction on the host.
    pub interned: bool,
    /// The host emits a removal event when the entry disappears.
    pub notify_removed: bool,
}

impl PutOptions {
    /// Options with only an expiration set.
    pub fn expiring(expiry: Expiry) -> Self {
        PutOptions {
            expiry,
            ..PutOptions::default()
        }
    }

    fn flags(&self) -> EntryFlags {
        EntryFlags {
            interned: self.interned,
            notify_removed: self.notify_removed,
        }
    }
}

/// Local-only read shortcut backed by the same storage engine.
struct NearCache {
    cache: MemCache,
    ttl: Duration,
}

impl NearCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).ok().flatten()
    }

    fn put(&self, key: &str, value: &[u8]) {
        let options = AddOptions::expiring(Expiration::Absolute(SystemTime::now() + self.ttl));
        let _ = self.cache.add_or_update(key, value, &options);
    }

    fn forget(&self, key: &str) {
        self.cache.remove(key);
    }

    fn clear(&self) {
        self.cache.clear();
    }
}

/// The distributed cache client.
pub struct CacheClient {
    pool: Arc<HostPool>,
    routing: Arc<RoutingTable>,
    poller: Option<MembershipPoller>,
    near: Option<NearCache>,
}

impl CacheClient {
    /// Connects via the manager: membership is fetched immediately and then
    /// polled on the configured interval.
    pub fn connect(config: ClientConfig) -> CacheResult<CacheClient> {
        config.validate()?;
        let routing = Arc::new(RoutingTable::new(false));
        let pool = HostPool::start(config.clone());
        let near = near_cache(&config);
        let poller = MembershipPoller::start(config, Arc::clone(&routing), Arc::clone(&pool));
        Ok(CacheClient {
            pool,
            routing,
            poller: Some(poller),
            near,
        })
    }

    /// Connects against a fixed host list, bypassing the manager.
    pub fn with_static_hosts(config: ClientConfig, hosts: Vec<String>) -> CacheResult<CacheClient> {
        config.validate()?;
        let routing = Arc::new(RoutingTable::new(false));
        let pool = HostPool::start(config.clone());
        routing.rebuild(hosts.clone());
        pool.sync_members(&hosts);
        let near = near_cache(&config);
        Ok(CacheClient {
            pool,
            routing,
            poller: None,
            near,
        })
    }

    /// Registers a connectivity event listener.
    pub fn on_event(&self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) {
        self.pool.on_event(listener);
    }

    /// The current ordinal-ordered host membership.
    pub fn hosts(&self) -> Vec<String> {
        self.routing.members()
    }

    /// Stops the membership poller and the reconnect timer.
    pub fn stop(self) {
        if let Some(poller) = self.poller {
            poller.stop();
        }
        self.pool.stop();
    }

    /// Fetches a value; a disconnected owner host reads as a miss.
    pub fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(near) = &self.near {
            if let Some(hit) = near.get(key) {
                return Ok(Some(hit));
            }
        }
        self.ensure_reachable()?;

        let Some(conn) = self.owner_conn(key)? else {
            return Ok(None);
        };
        let request = HostRequest::Get { key: key.to_string() };
        match self.pool.request(&conn, &request)? {
            None => Ok(None),
            Some(HostResponse::Slots(slots)) => {
                let slot = slots.into_iter().next().unwrap_or_default();
                if slot.is_empty() {
                    Ok(None)
                } else {
                    if let Some(near) = &self.near {
                        near.put(key, &slot);
                    }
                    Ok(Some(slot))
                }
            }
            Some(_) => Err(CacheError::protocol("unexpected response to GET")),
        }
    }

    /// Order-preserving batch read across hosts.
    ///
    /// Keys are bucketed by owner, one batched request goes to each host,
    /// and the sub-responses are re-merged into the caller's slot order.
    pub fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
        let mut outstanding: Vec<usize> = Vec::with_capacity(keys.len());
        if let Some(near) = &self.near {
            for (index, key) in keys.iter().enumerate() {
                match near.get(key) {
                    Some(hit) => slots[index] = Some(hit),
                    None => outstanding.push(index),
                }
            }
            if outstanding.is_empty() {
                return Ok(slots);
            }
        } else {
            outstanding.extend(0..keys.len());
        }
        self.ensure_reachable()?;

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for &index in &outstanding {
            groups.entry(self.owner_addr(&keys[index])?).or_default().push(index);
        }

        for (address, indices) in groups {
            let Some(conn) = self.pool.conn(&address) else {
                continue;
            };
            let batch: Vec<String> = indices.iter().map(|&index| keys[index].clone()).collect();
            match self.pool.request(&conn, &HostRequest::GetMany { keys: batch })? {
                None => {}
                Some(HostResponse::Slots(sub_slots)) => {
                    if sub_slots.len() != indices.len() {
                        return Err(CacheError::protocol("batch slot count mismatch"));
                    }
                    for (slot, &index) in sub_slots.into_iter().zip(&indices) {
                        if !slot.is_empty() {
                            if let Some(near) = &self.near {
                                near.put(&keys[index], &slot);
                            }
                            slots[index] = Some(slot);
                        }
                    }
                }
                Some(_) => return Err(CacheError::protocol("unexpected response to GET_MANY")),
            }
        }

        Ok(slots)
    }

    /// Collects every live payload under a tag across all hosts.
    pub fn get_tagged(&self, tag: &str) -> CacheResult<Vec<Vec<u8>>> {
        self.ensure_reachable()?;
        let mut out = Vec::new();
        for conn in self.pool.conns() {
            let request = HostRequest::GetTagged { tag: tag.to_string() };
            match self.pool.request(&conn, &request)? {
                None => {}
                Some(HostResponse::Slots(slots)) => out.extend(slots),
                Some(_) => return Err(CacheError::protocol("unexpected response to GET_TAGGED")),
            }
        }
        Ok(out)
    }

    /// Writes one entry to its owner host.
    pub fn add_or_update(&self, key: &str, value: &[u8], options: &PutOptions) -> CacheResult<()> {
        self.ensure_reachable()?;
        if let Some(near) = &self.near {
            near.forget(key);
        }

        let Some(conn) = self.owner_conn(key)? else {
            return Ok(());
        };
        let request = match &options.tag {
            None => HostRequest::AddOrUpdate {
                key: key.to_string(),
                payload: value.to_vec(),
                expiry: options.expiry,
                flags: options.flags(),
            },
            Some(tag) => HostRequest::AddOrUpdateTagged {
                tag: tag.clone(),
                key: key.to_string(),
                payload: value.to_vec(),
                expiry: options.expiry,
                flags: options.flags(),
            },
        };
        self.pool.write(&conn, &request)?;
        Ok(())
    }

    /// Batched write; pairs are bucketed by owner host.
    pub fn add_or_update_many(&self, pairs: &[(String, Vec<u8>)], options: &PutOptions) -> CacheResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.ensure_reachable()?;
        if let Some(near) = &self.near {
            for (key, _) in pairs {
                near.forget(key);
            }
        }

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, (key, _)) in pairs.iter().enumerate() {
            groups.entry(self.owner_addr(key)?).or_default().push(index);
        }

        for (address, indices) in groups {
            let Some(conn) = self.pool.conn(&address) else {
                continue;
            };
            let batch: Vec<(String, Vec<u8>)> =
                indices.iter().map(|&index| pairs[index].clone()).collect();
            let request = match &options.tag {
                None => HostRequest::AddOrUpdateMany {
                    pairs: batch,
                    expiry: options.expiry,
                    flags: options.flags(),
                },
                Some(tag) => HostRequest::AddOrUpdateManyTagged {
                    tag: tag.clone(),
                    pairs: batch,
                    expiry: options.expiry,
                    flags: options.flags(),
                },
            };
            self.pool.write(&conn, &request)?;
        }
        Ok(())
    }

    /// Removes one key from its owner host. Idempotent.
    pub fn remove(&self, key: &str) -> CacheResult<()> {
        self.ensure_reachable()?;
        if let Some(near) = &self.near {
            near.forget(key);
        }
        let Some(conn) = self.owner_conn(key)? else {
            return Ok(());
        };
        self.pool.write(&conn, &HostRequest::Remove { key: key.to_string() })?;
        Ok(())
    }

    /// Removes a batch of keys, bucketed by owner host.
    pub fn remove_many(&self, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.ensure_reachable()?;
        if let Some(near) = &self.near {
            for key in keys {
                near.forget(key);
            }
        }

        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            groups.entry(self.owner_addr(key)?).or_default().push(key.clone());
        }
        for (address, batch) in groups {
            let Some(conn) = self.pool.conn(&address) else {
                continue;
            };
            self.pool.write(&conn, &HostRequest::RemoveMany { keys: batch })?;
        }
        Ok(())
    }

    /// Removes every key under a tag on every host, optionally narrowed by
    /// a `'*'` glob pattern.
    pub fn remove_tagged(&self, tag: &str, pattern: Option<&str>) -> CacheResult<()> {
        self.ensure_reachable()?;
        if let Some(near) = &self.near {
            near.clear();
        }
        let request = HostRequest::RemoveTagged {
            tag: tag.to_string(),
            pattern: pattern.map(str::to_string),
        };
        for conn in self.pool.conns() {
            self.pool.write(&conn, &request)?;
        }
        Ok(())
    }

    /// Collects the keys matching a pattern across every host.
    pub fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.ensure_reachable()?;
        let mut out = Vec::new();
        for conn in self.pool.conns() {
            let request = HostRequest::Keys { pattern: pattern.to_string() };
            match self.pool.request(&conn, &request)? {
                None => {}
                Some(HostResponse::Keys(keys)) => out.extend(keys),
                Some(_) => return Err(CacheError::protocol("unexpected response to KEYS")),
            }
        }
        Ok(out)
    }

    /// Clears every host and the near-cache.
    pub fn clear(&self) -> CacheResult<()> {
        self.ensure_reachable()?;
        if let Some(near) = &self.near {
            near.clear();
        }
        for conn in self.pool.conns() {
            self.pool.write(&conn, &HostRequest::Clear)?;
        }
        Ok(())
    }

    /// Fails fast when no host is reachable at all.
    fn ensure_reachable(&self) -> CacheResult<()> {
        if self.pool.any_connected() {
            Ok(())
        } else {
            Err(CacheError::NoHostsAvailable)
        }
    }

    /// Resolves the owner address for a key under the current ring.
    fn owner_addr(&self, key: &str) -> CacheResult<String> {
        match self.routing.owner_of(key) {
            Some(BucketOwner::Host(address)) => Ok(address),
            // The client ring carries no local sentinel.
            Some(BucketOwner::Local) => Err(CacheError::protocol("client ring produced a local owner")),
            None => Err(CacheError::NoHostsAvailable),
        }
    }

    /// Owner connection for a key; `None` when the pool has not caught up
    /// with a just-rebuilt ring.
    fn owner_conn(&self, key: &str) -> CacheResult<Option<Arc<HostConn>>> {
        let address = self.owner_addr(key)?;
        Ok(self.pool.conn(&address))
    }
}

fn near_cache(config: &ClientConfig) -> Option<NearCache> {
    if config.near_cache_enabled {
        Some(NearCache {
            cache: MemCache::new(MemCacheConfig::default()),
            ttl: config.near_cache_ttl(),
        })
    } else {
        None
    }
}
