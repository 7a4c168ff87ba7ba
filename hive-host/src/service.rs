//! # Host TCP Service
//!
//! Accept wire-protocol connections, parse frames, and dispatch requests to
//! the storage engine with minimal overhead. Each request is self-contained;
//! the host holds no per-client session state.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use hive_common::config::HostConfig;
use hive_common::error::{CacheError, CacheResult};
use hive_common::frame::{write_frame, FrameParser, LENGTH_PREFIX_BYTES};
use hive_common::message::{EntryFlags, Expiry, HostRequest, HostResponse};
use hive_common::ring::RoutingTable;
use hive_engine::{AddOptions, Expiration, MemCache};

use crate::perf::PerfCounters;

/// Everything a request handler needs, constructed once at startup and
/// passed explicitly; no process-wide singletons.
pub struct HostContext {
    pub config: HostConfig,
    pub cache: Arc<MemCache>,
    pub perf: Arc<PerfCounters>,
    pub routing: Arc<RoutingTable>,
}

impl HostContext {
    /// Builds a context, validating the configuration first.
    pub fn new(config: HostConfig, cache: Arc<MemCache>) -> CacheResult<Arc<HostContext>> {
        config.validate()?;
        Ok(Arc::new(HostContext {
            config,
            cache,
            perf: Arc::new(PerfCounters::new()),
            // Hosts reserve the local sentinel slot in their ring.
            routing: Arc::new(RoutingTable::new(true)),
        }))
    }
}

/// TCP server speaking the cache wire protocol.
pub struct HostService {
    listener: TcpListener,
    ctx: Arc<HostContext>,
}

impl HostService {
    /// Binds the listener on the configured address and port.
    pub async fn bind(ctx: Arc<HostContext>) -> CacheResult<HostService> {
        let listener = TcpListener::bind((ctx.config.address.as_str(), ctx.config.port)).await?;
        info!(addr = %listener.local_addr()?, "cache host listening");
        Ok(HostService { listener, ctx })
    }

    /// Returns the bound socket address.
    pub fn local_addr(&self) -> CacheResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and serves connections until the task is cancelled.
    ///
    /// Concurrency is bounded by `maximum_connections`; excess connections
    /// wait in the accept backlog.
    pub async fn serve(self) -> CacheResult<()> {
        let permits = Arc::new(Semaphore::new(self.ctx.config.maximum_connections));
        loop {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .expect("connection semaphore never closes");
            let (stream, peer) = self.listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, ctx).await {
                    debug!(%peer, %err, "connection closed on error");
                }
                drop(permit);
            });
        }
    }
}

/// Serves one client connection until EOF or a fatal error.
async fn handle_connection(mut stream: TcpStream, ctx: Arc<HostContext>) -> CacheResult<()> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(ctx.config.message_buffer_size);
    let parser = FrameParser::new(ctx.config.maximum_message_size);
    let deadline = ctx.config.communication_timeout();

    loop {
        // The receive deadline applies once a request has started arriving;
        // an idle persistent connection may wait indefinitely.
        let read = if buffer.is_empty() {
            stream.read_buf(&mut buffer).await?
        } else {
            match tokio::time::timeout(deadline, stream.read_buf(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => return Err(CacheError::Timeout),
            }
        };
        if read == 0 {
            break;
        }

        while let Some(frame) = parser.parse(&mut buffer)? {
            let request = HostRequest::decode(&frame)?;
            let opcode = request.opcode();
            let response = dispatch(&ctx, request)?;

            let payload = response.encode(opcode);
            if payload.len() > ctx.config.maximum_message_size {
                return Err(CacheError::Oversize {
                    size: payload.len(),
                    limit: ctx.config.maximum_message_size,
                });
            }
            let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
            write_frame(&payload, &mut out);
            match tokio::time::timeout(deadline, stream.write_all(&out)).await {
                Ok(result) => result?,
                Err(_) => return Err(CacheError::Timeout),
            }
        }
    }

    Ok(())
}

/// Executes one request against the engine.
///
/// Misses produce zero-length slots; removes always acknowledge. An engine
/// failure (out-of-memory, corrupt stored payload) propagates and closes the
/// connection.
pub fn dispatch(ctx: &HostContext, request: HostRequest) -> CacheResult<HostResponse> {
    let cache = ctx.cache.as_ref();
    match request {
        HostRequest::Get { key } => {
            ctx.perf.record_get(1);
            let slot = cache.get(&key)?.unwrap_or_default();
            Ok(HostResponse::Slots(vec![slot]))
        }
        HostRequest::GetMany { keys } => {
            ctx.perf.record_get(keys.len() as u64);
            let slots = cache
                .get_many(&keys)?
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect();
            Ok(HostResponse::Slots(slots))
        }
        HostRequest::GetTagged { tag } => {
            ctx.perf.record_get(1);
            Ok(HostResponse::Slots(cache.get_tagged(&tag)?))
        }
        HostRequest::AddOrUpdate { key, payload, expiry, flags } => {
            ctx.perf.record_add(1);
            cache.add_or_update(&key, &payload, &to_options(expiry, None, flags))?;
            Ok(HostResponse::Ack)
        }
        HostRequest::AddOrUpdateMany { pairs, expiry, flags } => {
            ctx.perf.record_add(pairs.len() as u64);
            cache.add_or_update_many(&pairs, &to_options(expiry, None, flags))?;
            Ok(HostResponse::Ack)
        }
        HostRequest::AddOrUpdateTagged { tag, key, payload, expiry, flags } => {
            ctx.perf.record_add(1);
            cache.add_or_update(&key, &payload, &to_options(expiry, Some(tag), flags))?;
            Ok(HostResponse::Ack)
        }
        HostRequest::AddOrUpdateManyTagged { tag, pairs, expiry, flags } => {
            ctx.perf.record_add(pairs.len() as u64);
            cache.add_or_update_many(&pairs, &to_options(expiry, Some(tag), flags))?;
            Ok(HostResponse::Ack)
        }
        HostRequest::Remove { key } => {
            ctx.perf.record_remove(1);
            cache.remove(&key);
            Ok(HostResponse::Ack)
        }
        HostRequest::RemoveMany { keys } => {
            ctx.perf.record_remove(keys.len() as u64);
            cache.remove_many(&keys);
            Ok(HostResponse::Ack)
        }
        HostRequest::RemoveTagged { tag, pattern } => {
            ctx.perf.record_remove(1);
            cache.remove_tagged(&tag, pattern.as_deref());
            Ok(HostResponse::Ack)
        }
        HostRequest::Keys { pattern } => Ok(HostResponse::Keys(cache.keys(&pattern))),
        HostRequest::Clear => {
            warn!("cache cleared by request");
            cache.clear();
            Ok(HostResponse::Ack)
        }
    }
}

fn to_options(expiry: Expiry, tag: Option<String>, flags: EntryFlags) -> AddOptions {
    AddOptions {
        expiration: match expiry {
            Expiry::None => Expiration::None,
            Expiry::Absolute(ts) => Expiration::Absolute(Expiry::to_system_time(ts)),
            Expiry::Sliding(window) => Expiration::Sliding(window),
        },
        tag,
        interned: flags.interned,
        notify_removed: flags.notify_removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_engine::MemCacheConfig;

    fn test_ctx() -> Arc<HostContext> {
        let cache = Arc::new(MemCache::new(MemCacheConfig::default()));
        HostContext::new(HostConfig::default(), cache).unwrap()
    }

    fn put(ctx: &HostContext, key: &str, value: &[u8]) {
        let request = HostRequest::AddOrUpdate {
            key: key.to_string(),
            payload: value.to_vec(),
            expiry: Expiry::None,
            flags: EntryFlags::default(),
        };
        assert_eq!(dispatch(ctx, request).unwrap(), HostResponse::Ack);
    }

    #[test]
    fn get_returns_stored_slot() {
        let ctx = test_ctx();
        put(&ctx, "alpha", b"value");

        let response = dispatch(&ctx, HostRequest::Get { key: "alpha".into() }).unwrap();
        assert_eq!(response, HostResponse::Slots(vec![b"value".to_vec()]));
    }

    #[test]
    fn miss_is_a_zero_length_slot() {
        let ctx = test_ctx();
        let response = dispatch(&ctx, HostRequest::Get { key: "missing".into() }).unwrap();
        assert_eq!(response, HostResponse::Slots(vec![Vec::new()]));
    }

    #[test]
    fn get_many_keeps_slot_order() {
        let ctx = test_ctx();
        put(&ctx, "a", b"1");
        put(&ctx, "c", b"3");

        let response = dispatch(
            &ctx,
            HostRequest::GetMany { keys: vec!["a".into(), "b".into(), "c".into()] },
        )
        .unwrap();
        assert_eq!(
            response,
            HostResponse::Slots(vec![b"1".to_vec(), Vec::new(), b"3".to_vec()])
        );
    }

    #[test]
    fn tagged_write_and_read() {
        let ctx = test_ctx();
        let request = HostRequest::AddOrUpdateTagged {
            tag: "news".into(),
            key: "alpha".into(),
            payload: b"value".to_vec(),
            expiry: Expiry::None,
            flags: EntryFlags::default(),
        };
        dispatch(&ctx, request).unwrap();

        let response = dispatch(&ctx, HostRequest::GetTagged { tag: "news".into() }).unwrap();
        assert_eq!(response, HostResponse::Slots(vec![b"value".to_vec()]));

        dispatch(
            &ctx,
            HostRequest::RemoveTagged { tag: "news".into(), pattern: None },
        )
        .unwrap();
        let response = dispatch(&ctx, HostRequest::GetTagged { tag: "news".into() }).unwrap();
        assert_eq!(response, HostResponse::Slots(Vec::new()));
    }

    #[test]
    fn removes_are_idempotent_acks() {
        let ctx = test_ctx();
        assert_eq!(
            dispatch(&ctx, HostRequest::Remove { key: "missing".into() }).unwrap(),
            HostResponse::Ack
        );
        assert_eq!(
            dispatch(&ctx, HostRequest::RemoveMany { keys: vec!["a".into(), "b".into()] }).unwrap(),
            HostResponse::Ack
        );
    }

    #[test]
    fn keys_and_clear_admin_ops() {
        let ctx = test_ctx();
        put(&ctx, "user:1", b"a");
        put(&ctx, "other", b"b");

        let response = dispatch(&ctx, HostRequest::Keys { pattern: "user:*".into() }).unwrap();
        assert_eq!(response, HostResponse::Keys(vec!["user:1".to_string()]));

        dispatch(&ctx, HostRequest::Clear).unwrap();
        let response = dispatch(&ctx, HostRequest::Keys { pattern: "*".into() }).unwrap();
        assert_eq!(response, HostResponse::Keys(Vec::new()));
    }

    #[test]
    fn sliding_expiry_is_applied() {
        let ctx = test_ctx();
        let request = HostRequest::AddOrUpdate {
            key: "alpha".into(),
            payload: b"value".to_vec(),
            expiry: Expiry::Sliding(std::time::Duration::from_secs(1)),
            flags: EntryFlags::default(),
        };
        dispatch(&ctx, request).unwrap();
        // Visible immediately after the write.
        let response = dispatch(&ctx, HostRequest::Get { key: "alpha".into() }).unwrap();
        assert_eq!(response, HostResponse::Slots(vec![b"value".to_vec()]));
    }
}
