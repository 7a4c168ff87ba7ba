//! # Cache-to-Manager Link
//!
//! Purpose: Keep one persistent duplex connection from the host to the
//! manager, re-registering after every reconnect and applying membership
//! fan-out to the local ring.
//!
//! ## State Machine
//!
//! ```text
//! DISCONNECTED ──open ok──▶ CONNECTED ──close/fault──▶ DISCONNECTED
//!       │                       │
//!       └───retry-timer fires───┘
//! ```
//!
//! Disconnected and Reconnected are edge-triggered and fire at most once per
//! transition; a single owner task serializes every reconnect attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_common::error::{CacheError, CacheResult};
use hive_common::frame::{write_frame, FrameParser, LENGTH_PREFIX_BYTES};
use hive_common::message::ManagerFrame;

use crate::service::HostContext;

/// Edge-triggered link transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link to the manager was lost.
    Disconnected,
    /// The link was (re)established and registration completed.
    Reconnected,
}

/// Handle to the background link task.
pub struct ManagerLink {
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ManagerLink {
    /// Starts the link task; it connects, registers, and retries forever.
    pub fn start(
        ctx: Arc<HostContext>,
        on_event: impl Fn(LinkEvent) + Send + Sync + 'static,
    ) -> ManagerLink {
        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        let task = tokio::spawn(async move {
            run_link(ctx, flag, on_event).await;
        });
        ManagerLink { connected, task }
    }

    /// Fast-path connectivity check; the owning task is the source of truth.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Stops the link task. Idempotent via task abort semantics.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// The single owner loop: every (re)connection attempt runs here, so
/// reconnection is serialized by construction.
async fn run_link(
    ctx: Arc<HostContext>,
    connected: Arc<AtomicBool>,
    on_event: impl Fn(LinkEvent) + Send + Sync,
) {
    let retry = ctx.config.reconnect_interval();
    loop {
        match connect_and_register(&ctx).await {
            Ok((stream, members)) => {
                info!(manager = %ctx.config.manager_endpoint(), "registered with manager");
                ctx.routing.rebuild(members);
                connected.store(true, Ordering::Release);
                on_event(LinkEvent::Reconnected);

                if let Err(err) = serve_link(stream, &ctx).await {
                    warn!(%err, "manager link faulted");
                }

                connected.store(false, Ordering::Release);
                on_event(LinkEvent::Disconnected);
            }
            Err(err) => {
                debug!(%err, "manager connection attempt failed");
            }
        }
        tokio::time::sleep(retry).await;
    }
}

/// Opens the TCP link and performs the REGISTER/WELCOME exchange.
async fn connect_and_register(ctx: &HostContext) -> CacheResult<(TcpStream, Vec<String>)> {
    let deadline = ctx.config.communication_timeout();
    let endpoint = ctx.config.manager_endpoint();

    let mut stream = match tokio::time::timeout(deadline, TcpStream::connect(&endpoint)).await {
        Ok(result) => result?,
        Err(_) => return Err(CacheError::Timeout),
    };
    stream.set_nodelay(true)?;

    let register = ManagerFrame::Register {
        address: ctx.config.advertised_address(),
        object_count: ctx.cache.count() as u64,
    };
    send_manager_frame(&mut stream, &ctx.config, &register).await?;

    // The welcome carries our ordinal implicitly via the ordered membership.
    let parser = FrameParser::new(ctx.config.maximum_message_size);
    let mut buffer = BytesMut::with_capacity(ctx.config.message_buffer_size);
    let frame = loop {
        if let Some(frame) = parser.parse(&mut buffer)? {
            break frame;
        }
        let read = match tokio::time::timeout(deadline, stream.read_buf(&mut buffer)).await {
            Ok(result) => result?,
            Err(_) => return Err(CacheError::Timeout),
        };
        if read == 0 {
            return Err(CacheError::protocol("manager closed before welcome"));
        }
    };

    match ManagerFrame::decode(&frame)? {
        ManagerFrame::Welcome { ordinal, members } => {
            debug!(ordinal, total = members.len(), "welcome received");
            Ok((stream, members))
        }
        other => Err(CacheError::Protocol(format!("expected welcome, got {other:?}"))),
    }
}

/// Serves the established duplex link until close or fault.
///
/// This is a long-poll channel: the receive side is unbounded, only writes
/// carry the deadline.
async fn serve_link(mut stream: TcpStream, ctx: &HostContext) -> CacheResult<()> {
    let parser = FrameParser::new(ctx.config.maximum_message_size);
    let mut buffer = BytesMut::with_capacity(ctx.config.message_buffer_size);

    loop {
        let read = stream.read_buf(&mut buffer).await?;
        if read == 0 {
            return Ok(());
        }

        while let Some(frame) = parser.parse(&mut buffer)? {
            match ManagerFrame::decode(&frame)? {
                ManagerFrame::RegisterHost { address, ordinal, total } => {
                    debug!(%address, ordinal, total, "peer registered");
                    let mut members = ctx.routing.members();
                    if !members.iter().any(|member| member == &address) {
                        let at = ordinal.min(members.len());
                        members.insert(at, address);
                        ctx.routing.rebuild(members);
                    }
                }
                ManagerFrame::UnregisterHost { address } => {
                    debug!(%address, "peer departed");
                    let mut members = ctx.routing.members();
                    members.retain(|member| member != &address);
                    ctx.routing.rebuild(members);
                }
                ManagerFrame::Welcome { members, .. } => {
                    ctx.routing.rebuild(members);
                }
                ManagerFrame::Poll => {
                    let reply = ManagerFrame::Counters {
                        address: ctx.config.advertised_address(),
                        counters: ctx.perf.snapshot(),
                    };
                    send_manager_frame(&mut stream, &ctx.config, &reply).await?;
                }
                other => {
                    return Err(CacheError::Protocol(format!(
                        "unexpected frame on manager link: {other:?}"
                    )));
                }
            }
        }
    }
}

async fn send_manager_frame(
    stream: &mut TcpStream,
    config: &hive_common::config::HostConfig,
    frame: &ManagerFrame,
) -> CacheResult<()> {
    let payload = frame.encode()?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    write_frame(&payload, &mut out);
    match tokio::time::timeout(config.communication_timeout(), stream.write_all(&out)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CacheError::Timeout),
    }
}
