//! # Configuration Surface
//!
//! Typed configuration for each node role. Loading these from files is the
//! embedding application's business; this module only defines shape,
//! defaults, and `validate()`. A process must refuse to start on a failed
//! validation.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Default cache host port.
pub const DEFAULT_HOST_PORT: u16 = 33333;
/// Default manager port.
pub const DEFAULT_MANAGER_PORT: u16 = 33334;
/// Default dashboard (board) port on the manager.
pub const DEFAULT_BOARD_PORT: u16 = 33335;

/// Hard bounds for the reconnect retry timer, applied by clamping.
pub const RECONNECT_MIN: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Payload storage provider for a cache host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// Store payload bytes as received.
    #[default]
    Plain,
    /// Gzip-compress payloads before storing them.
    Gzip,
}

/// What the client does with writes routed to a disconnected host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Queue writes and flush them when the host reconnects.
    #[default]
    Queue,
    /// Drop writes silently.
    Drop,
}

/// Configuration for one cache host process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address this host binds and advertises, e.g. "10.0.0.1".
    pub address: String,
    /// Port for the cache wire protocol.
    pub port: u16,
    /// Manager address.
    pub manager_address: String,
    /// Manager port.
    pub manager_port: u16,
    /// Maximum concurrently served client connections.
    pub maximum_connections: usize,
    /// Initial receive buffer size per connection, in bytes.
    pub message_buffer_size: usize,
    /// Send/receive/close deadline, in seconds.
    pub communication_timeout_seconds: u64,
    /// Maximum frame size accepted or produced, in bytes.
    pub maximum_message_size: usize,
    /// Share of the memory ceiling the cache may use, in percent.
    pub cache_memory_limit_percentage: u8,
    /// Memory ceiling the percentage applies to, in bytes.
    pub memory_ceiling_bytes: usize,
    /// Payload storage provider.
    pub storage_provider: StorageProvider,
    /// Expiration sweep interval, in milliseconds.
    pub sweep_interval_ms: u64,
    /// Manager reconnect retry interval, in milliseconds.
    pub manager_reconnect_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_HOST_PORT,
            manager_address: "127.0.0.1".to_string(),
            manager_port: DEFAULT_MANAGER_PORT,
            maximum_connections: 20,
            message_buffer_size: 4096,
            communication_timeout_seconds: 15,
            maximum_message_size: 100 * 1024 * 1024,
            cache_memory_limit_percentage: 50,
            memory_ceiling_bytes: 1024 * 1024 * 1024,
            storage_provider: StorageProvider::Plain,
            sweep_interval_ms: 250,
            manager_reconnect_interval_ms: 5000,
        }
    }
}

impl HostConfig {
    /// Validates the configuration; a failed check must prevent startup.
    pub fn validate(&self) -> CacheResult<()> {
        if self.address.is_empty() || self.address.contains(' ') {
            return Err(CacheError::ConfigInvalid("address must be a non-empty host".into()));
        }
        if self.maximum_connections == 0 {
            return Err(CacheError::ConfigInvalid("maximumConnections must be at least 1".into()));
        }
        if !(1024..=4096).contains(&self.message_buffer_size) {
            return Err(CacheError::ConfigInvalid(
                "messageBufferSize must be within [1024, 4096]".into(),
            ));
        }
        if self.communication_timeout_seconds < 5 {
            return Err(CacheError::ConfigInvalid(
                "communicationTimeoutSeconds must be at least 5".into(),
            ));
        }
        if self.maximum_message_size < 100 * 1024 * 1024 {
            return Err(CacheError::ConfigInvalid(
                "maximumMessageSize must be at least 100 MB".into(),
            ));
        }
        if !(5..=90).contains(&self.cache_memory_limit_percentage) {
            return Err(CacheError::ConfigInvalid(
                "cacheMemoryLimitPercentage must be within [5, 90]".into(),
            ));
        }
        if self.memory_ceiling_bytes == 0 {
            return Err(CacheError::ConfigInvalid("memoryCeilingBytes must be non-zero".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(CacheError::ConfigInvalid("sweepIntervalMilliseconds must be non-zero".into()));
        }
        Ok(())
    }

    /// The advertised `host:port` address of this host.
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// The manager's `host:port` address.
    pub fn manager_endpoint(&self) -> String {
        format!("{}:{}", self.manager_address, self.manager_port)
    }

    /// Per-request deadline.
    pub fn communication_timeout(&self) -> Duration {
        Duration::from_secs(self.communication_timeout_seconds)
    }

    /// Retry interval clamped to the allowed band.
    pub fn reconnect_interval(&self) -> Duration {
        clamp_interval(Duration::from_millis(self.manager_reconnect_interval_ms))
    }

    /// Expiration sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Configuration for the manager process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Address the manager binds.
    pub address: String,
    /// Port for host registration and observer queries.
    pub port: u16,
    /// Port for the read-only board endpoint.
    pub board_port: u16,
    /// Host counter polling cadence, in milliseconds.
    pub host_polling_interval_ms: u64,
    /// Deregistration queue drain cadence, in milliseconds.
    pub deregistration_interval_ms: u64,
    /// Consecutive failed polls before a host descriptor is destroyed;
    /// zero disables automatic destruction.
    pub max_failed_polls: u32,
    /// Send/receive deadline for manager-side IO, in seconds.
    pub communication_timeout_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_MANAGER_PORT,
            board_port: DEFAULT_BOARD_PORT,
            host_polling_interval_ms: 1000,
            deregistration_interval_ms: 5000,
            max_failed_polls: 0,
            communication_timeout_seconds: 15,
        }
    }
}

impl ManagerConfig {
    /// Validates the configuration; a failed check must prevent startup.
    pub fn validate(&self) -> CacheResult<()> {
        if self.address.is_empty() || self.address.contains(' ') {
            return Err(CacheError::ConfigInvalid("address must be a non-empty host".into()));
        }
        if self.port == self.board_port {
            return Err(CacheError::ConfigInvalid("port and boardPort must differ".into()));
        }
        if self.host_polling_interval_ms == 0 {
            return Err(CacheError::ConfigInvalid(
                "cacheHostInformationPollingIntervalMilliseconds must be non-zero".into(),
            ));
        }
        if self.deregistration_interval_ms == 0 {
            return Err(CacheError::ConfigInvalid(
                "deregistrationIntervalMilliseconds must be non-zero".into(),
            ));
        }
        if self.communication_timeout_seconds < 5 {
            return Err(CacheError::ConfigInvalid(
                "communicationTimeoutSeconds must be at least 5".into(),
            ));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.host_polling_interval_ms)
    }

    pub fn deregistration_interval(&self) -> Duration {
        Duration::from_millis(self.deregistration_interval_ms)
    }

    pub fn communication_timeout(&self) -> Duration {
        Duration::from_secs(self.communication_timeout_seconds)
    }
}

/// Configuration for the client library.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Manager address.
    pub manager_address: String,
    /// Manager port.
    pub manager_port: u16,
    /// Membership poll cadence, in milliseconds.
    pub membership_poll_interval_ms: u64,
    /// Host reconnect retry interval, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Send/receive deadline, in seconds.
    pub communication_timeout_seconds: u64,
    /// Maximum frame size accepted or produced, in bytes.
    pub maximum_message_size: usize,
    /// What to do with writes routed to a disconnected host.
    pub write_policy: WritePolicy,
    /// Serve reads from a process-local near-cache when possible.
    pub near_cache_enabled: bool,
    /// Lifetime of near-cache entries, in milliseconds.
    pub near_cache_ttl_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            manager_address: "127.0.0.1".to_string(),
            manager_port: DEFAULT_MANAGER_PORT,
            membership_poll_interval_ms: 5000,
            reconnect_interval_ms: 5000,
            communication_timeout_seconds: 15,
            maximum_message_size: 100 * 1024 * 1024,
            write_policy: WritePolicy::Queue,
            near_cache_enabled: false,
            near_cache_ttl_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Validates the configuration; a failed check must prevent startup.
    pub fn validate(&self) -> CacheResult<()> {
        if self.manager_address.is_empty() || self.manager_address.contains(' ') {
            return Err(CacheError::ConfigInvalid("managerAddress must be a non-empty host".into()));
        }
        if !(1000..=60_000).contains(&self.membership_poll_interval_ms) {
            return Err(CacheError::ConfigInvalid(
                "informationPollingIntervalMilliseconds must be within [1000, 60000]".into(),
            ));
        }
        if !(1000..=60_000).contains(&self.reconnect_interval_ms) {
            return Err(CacheError::ConfigInvalid(
                "managerReconnectIntervalMilliseconds must be within [1000, 60000]".into(),
            ));
        }
        if self.communication_timeout_seconds < 5 {
            return Err(CacheError::ConfigInvalid(
                "communicationTimeoutSeconds must be at least 5".into(),
            ));
        }
        if self.near_cache_enabled && self.near_cache_ttl_ms == 0 {
            return Err(CacheError::ConfigInvalid("nearCacheTtlMilliseconds must be non-zero".into()));
        }
        Ok(())
    }

    pub fn manager_endpoint(&self) -> String {
        format!("{}:{}", self.manager_address, self.manager_port)
    }

    pub fn membership_poll_interval(&self) -> Duration {
        Duration::from_millis(self.membership_poll_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        clamp_interval(Duration::from_millis(self.reconnect_interval_ms))
    }

    pub fn communication_timeout(&self) -> Duration {
        Duration::from_secs(self.communication_timeout_seconds)
    }

    pub fn near_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.near_cache_ttl_ms)
    }
}

/// Clamps a retry interval into the allowed [1 s, 60 s] band.
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(RECONNECT_MIN, RECONNECT_MAX)
}
