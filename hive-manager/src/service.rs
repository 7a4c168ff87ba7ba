//! # Manager TCP Service
//!
//! Purpose: Accept host registrations on the manager port, keep the duplex
//! host links alive, drain the deregistration queue, poll counters, and
//! answer observer queries on both the manager and board ports.
//!
//! ## Connection upgrade
//!
//! A connection stays a one-shot observer channel (membership/snapshot
//! queries) until it sends REGISTER, which upgrades it into a persistent
//! host link. The board port never upgrades; it is read-only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_common::config::ManagerConfig;
use hive_common::error::{CacheError, CacheResult};
use hive_common::frame::{write_frame, FrameParser, LENGTH_PREFIX_BYTES};
use hive_common::message::ManagerFrame;

use crate::registry::Registry;

/// Shared manager state, constructed once at startup.
pub struct ManagerContext {
    pub config: ManagerConfig,
    pub registry: Registry,
    /// Feed of addresses queued for deregistration.
    dereg: UnboundedSender<(String, bool)>,
}

impl ManagerContext {
    /// Marks a host for deregistration after a close or fault; the removal
    /// is skipped if the host re-registers before the drain.
    pub fn enqueue_deregistration(&self, address: String) {
        let _ = self.dereg.send((address, false));
    }

    /// Marks a host for unconditional deregistration (explicit request or
    /// exceeded poll limit).
    pub fn enqueue_forced_deregistration(&self, address: String) {
        let _ = self.dereg.send((address, true));
    }
}

/// The manager service: two listeners plus background workers.
pub struct ManagerService {
    listener: TcpListener,
    board: TcpListener,
    ctx: Arc<ManagerContext>,
    workers: Vec<JoinHandle<()>>,
}

impl ManagerService {
    /// Validates the configuration, binds both ports, and starts the
    /// deregistration worker and the counter poller.
    pub async fn start(config: ManagerConfig) -> CacheResult<ManagerService> {
        config.validate()?;

        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let board = TcpListener::bind((config.address.as_str(), config.board_port)).await?;
        info!(
            addr = %listener.local_addr()?,
            board = %board.local_addr()?,
            "manager listening"
        );

        let (dereg_tx, dereg_rx) = unbounded_channel();
        let ctx = Arc::new(ManagerContext {
            config,
            registry: Registry::new(),
            dereg: dereg_tx,
        });

        let workers = vec![
            tokio::spawn(run_dereg_worker(Arc::clone(&ctx), dereg_rx)),
            tokio::spawn(run_poller(Arc::clone(&ctx))),
        ];

        Ok(ManagerService {
            listener,
            board,
            ctx,
            workers,
        })
    }

    /// Bound manager port address.
    pub fn local_addr(&self) -> CacheResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Bound board port address.
    pub fn board_addr(&self) -> CacheResult<SocketAddr> {
        Ok(self.board.local_addr()?)
    }

    /// Shared context accessor, mainly for tests.
    pub fn context(&self) -> Arc<ManagerContext> {
        Arc::clone(&self.ctx)
    }

    /// Serves both listeners until the task is cancelled.
    pub async fn serve(self) -> CacheResult<()> {
        let manager = accept_loop(self.listener, Arc::clone(&self.ctx), false);
        let board = accept_loop(self.board, Arc::clone(&self.ctx), true);
        let result = tokio::try_join!(manager, board).map(|_| ());
        for worker in self.workers {
            worker.abort();
        }
        result
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ManagerContext>, read_only: bool) -> CacheResult<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, ctx, read_only).await {
                debug!(%peer, %err, "manager connection closed on error");
            }
        });
    }
}

/// Serves one connection: observer queries until a REGISTER upgrade.
async fn handle_connection(stream: TcpStream, ctx: Arc<ManagerContext>, read_only: bool) -> CacheResult<()> {
    stream.set_nodelay(true)?;
    let parser = FrameParser::new(MAX_MANAGER_FRAME);
    let mut buffer = BytesMut::with_capacity(4096);
    let (mut read_half, mut write_half) = stream.into_split();

    loop {
        let frame = match read_frame_async(&mut read_half, &mut buffer, &parser).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        match ManagerFrame::decode(&frame)? {
            ManagerFrame::Register { address, object_count } if !read_only => {
                return host_link(read_half, write_half, buffer, parser, ctx, address, object_count).await;
            }
            ManagerFrame::Deregister { address } if !read_only => {
                ctx.enqueue_forced_deregistration(address);
            }
            ManagerFrame::MembershipRequest => {
                let reply = ManagerFrame::Membership {
                    members: ctx.registry.members(),
                };
                send_manager_frame(&mut write_half, &ctx, &reply).await?;
            }
            ManagerFrame::SnapshotRequest => {
                let reply = ManagerFrame::Snapshot(ctx.registry.snapshot());
                send_manager_frame(&mut write_half, &ctx, &reply).await?;
            }
            other => {
                return Err(CacheError::Protocol(format!(
                    "unexpected frame from observer: {other:?}"
                )));
            }
        }
    }
}

/// The persistent duplex link to one registered host.
///
/// Registration walks the peer list: every existing host learns about the
/// new peer, and the new peer learns every existing one via the welcome. A
/// fan-out failure marks that peer for deregistration but never aborts the
/// registration in progress.
async fn host_link(
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut buffer: BytesMut,
    parser: FrameParser,
    ctx: Arc<ManagerContext>,
    address: String,
    object_count: u64,
) -> CacheResult<()> {
    let (outbox, mut inbox): (UnboundedSender<ManagerFrame>, UnboundedReceiver<ManagerFrame>) =
        unbounded_channel();
    let outcome = ctx.registry.register(address.clone(), object_count, outbox);
    info!(host = %address, ordinal = outcome.ordinal, total = outcome.total, "host registered");

    let welcome = ManagerFrame::Welcome {
        ordinal: outcome.ordinal,
        members: outcome.members,
    };
    send_manager_frame(&mut write_half, &ctx, &welcome).await?;

    let announce = ManagerFrame::RegisterHost {
        address: address.clone(),
        ordinal: outcome.ordinal,
        total: outcome.total,
    };
    for (peer, peer_outbox) in outcome.peers {
        if peer_outbox.send(announce.clone()).is_err() {
            warn!(%peer, "fan-out failed; marking peer for deregistration");
            ctx.enqueue_deregistration(peer);
        }
    }

    let result = async {
        loop {
            tokio::select! {
                pushed = inbox.recv() => {
                    match pushed {
                        Some(frame) => send_manager_frame(&mut write_half, &ctx, &frame).await?,
                        None => return Ok(()),
                    }
                }
                frame = read_frame_async(&mut read_half, &mut buffer, &parser) => {
                    match frame? {
                        None => return Ok(()),
                        Some(payload) => match ManagerFrame::decode(&payload)? {
                            ManagerFrame::Counters { address, counters } => {
                                ctx.registry.update_counters(&address, counters);
                            }
                            ManagerFrame::Deregister { address } => {
                                ctx.enqueue_forced_deregistration(address);
                            }
                            other => {
                                return Err(CacheError::Protocol(format!(
                                    "unexpected frame on host link: {other:?}"
                                )));
                            }
                        },
                    }
                }
            }
        }
    }
    .await;

    // Channel close or fault feeds the deregistration queue.
    ctx.enqueue_deregistration(address);
    result
}

/// Drains the deregistration queue at the configured cadence.
///
/// Queueing absorbs storms from correlated failures: a burst of closes
/// collapses into one drain pass.
async fn run_dereg_worker(ctx: Arc<ManagerContext>, mut queue: UnboundedReceiver<(String, bool)>) {
    let mut ticker = tokio::time::interval(ctx.config.deregistration_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pending: HashMap<String, bool> = HashMap::new();

    loop {
        tokio::select! {
            queued = queue.recv() => {
                match queued {
                    Some((address, force)) => {
                        *pending.entry(address).or_insert(false) |= force;
                    }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                for (address, force) in pending.drain() {
                    deregister(&ctx, &address, force);
                }
            }
        }
    }
}

/// Removes one host and tells every remaining peer to drop it.
fn deregister(ctx: &ManagerContext, address: &str, force: bool) {
    // A host that re-registered since being queued has a fresh, open link;
    // a fault-driven removal must not take it down.
    if !force && ctx.registry.link_closed(address) == Some(false) {
        debug!(host = %address, "skipping stale deregistration; host re-registered");
        return;
    }
    let Some(remaining) = ctx.registry.remove(address) else {
        return;
    };
    info!(host = %address, remaining = remaining.len(), "host removed from membership");

    let drop_frame = ManagerFrame::UnregisterHost {
        address: address.to_string(),
    };
    for (peer, outbox) in remaining {
        if outbox.send(drop_frame.clone()).is_err() {
            warn!(%peer, "drop fan-out failed; marking peer for deregistration");
            ctx.enqueue_deregistration(peer);
        }
    }
}

/// Polls every host for counters at the configured cadence.
///
/// Hosts that never answered the previous round lose their liveness flag;
/// descriptors are destroyed only past `max_failed_polls` (disabled at 0).
async fn run_poller(ctx: Arc<ManagerContext>) {
    let mut ticker = tokio::time::interval(ctx.config.polling_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        for address in ctx.registry.begin_poll_round(ctx.config.max_failed_polls) {
            warn!(host = %address, "poll limit exceeded; marking for deregistration");
            ctx.enqueue_forced_deregistration(address);
        }
        for (address, outbox) in ctx.registry.outboxes() {
            if outbox.send(ManagerFrame::Poll).is_err() {
                debug!(host = %address, "poll push failed; link already closing");
            }
        }
    }
}

/// Manager frames are small control messages; cap them well below the data
/// path limit.
const MAX_MANAGER_FRAME: usize = 4 * 1024 * 1024;

async fn read_frame_async(
    read_half: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    parser: &FrameParser,
) -> CacheResult<Option<Bytes>> {
    loop {
        if let Some(frame) = parser.parse(buffer)? {
            return Ok(Some(frame));
        }
        let read = read_half.read_buf(buffer).await?;
        if read == 0 {
            return Ok(None);
        }
    }
}

async fn send_manager_frame(
    write_half: &mut OwnedWriteHalf,
    ctx: &ManagerContext,
    frame: &ManagerFrame,
) -> CacheResult<()> {
    let payload = frame.encode()?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    write_frame(&payload, &mut out);
    match tokio::time::timeout(ctx.config.communication_timeout(), write_half.write_all(&out)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CacheError::Timeout),
    }
}
