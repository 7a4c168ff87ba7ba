//! # Host Connection Pool
//!
//! Purpose: Keep one long-lived TCP connection per known cache host with the
//! reconnect state machine, edge-triggered connectivity events, and the
//! queue-or-drop policy for writes to disconnected hosts.
//!
//! ## Design Principles
//! 1. **Leaf-Level Mutex**: each connection's stream mutex is the innermost
//!    lock; reconnection is serialized under it, and a caller that observes
//!    `is_connected() == false` outside the lock re-checks inside.
//! 2. **Edge-Triggered Events**: Disconnected/Reconnected fire exactly once
//!    per transition, driven by an atomic swap.
//! 3. **Fail Fast, Retry Later**: an IO failure tears the stream down
//!    immediately; the retry timer thread reconnects at its own cadence.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use hive_common::config::{ClientConfig, WritePolicy};
use hive_common::error::{CacheError, CacheResult};
use hive_common::frame::{read_frame, send_frame};
use hive_common::message::{HostRequest, HostResponse};

/// Connectivity transitions observed by the client, once per edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection to a host was lost.
    HostDisconnected(String),
    /// The connection to a host was (re)established.
    HostReconnected(String),
}

type EventListener = Box<dyn Fn(&ClientEvent) + Send + Sync>;

/// One persistent host connection and its reconnect state.
pub struct HostConn {
    address: String,
    /// Fast-path connectivity flag; the stream mutex is authoritative.
    connected: AtomicBool,
    /// Leaf-level reconnect mutex; never held while taking pool locks.
    stream: Mutex<Option<TcpStream>>,
    /// Writes queued while disconnected, as encoded frame payloads.
    queued_writes: Mutex<VecDeque<Vec<u8>>>,
}

impl HostConn {
    fn new(address: String) -> Arc<HostConn> {
        Arc::new(HostConn {
            address,
            connected: AtomicBool::new(false),
            stream: Mutex::new(None),
            queued_writes: Mutex::new(VecDeque::new()),
        })
    }

    /// Fast-path connectivity check (may be stale; re-checked under the
    /// stream mutex by every operation that matters).
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The host's `host:port` address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// The pool of per-host connections plus the shared retry timer thread.
pub struct HostPool {
    config: ClientConfig,
    conns: RwLock<HashMap<String, Arc<HostConn>>>,
    listeners: RwLock<Vec<EventListener>>,
    stop: Arc<AtomicBool>,
    retry_thread: Mutex<Option<JoinHandle<()>>>,
}

impl HostPool {
    /// Creates the pool and starts its retry timer thread.
    pub fn start(config: ClientConfig) -> Arc<HostPool> {
        let pool = Arc::new(HostPool {
            config,
            conns: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            retry_thread: Mutex::new(None),
        });

        let retry_pool = Arc::clone(&pool);
        let handle = std::thread::spawn(move || retry_pool.run_retry_loop());
        *pool.retry_thread.lock() = Some(handle);
        pool
    }

    /// Registers a connectivity event listener.
    pub fn on_event(&self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Reconciles the connection set with a new membership list.
    ///
    /// New hosts get an immediate connection attempt; departed hosts are
    /// dropped without a disconnect event, since they left the ring.
    pub fn sync_members(&self, members: &[String]) {
        let mut added = Vec::new();
        {
            let mut conns = self.conns.write();
            conns.retain(|address, _| members.iter().any(|member| member == address));
            for member in members {
                if !conns.contains_key(member) {
                    let conn = HostConn::new(member.clone());
                    conns.insert(member.clone(), Arc::clone(&conn));
                    added.push(conn);
                }
            }
        }
        for conn in added {
            self.try_reconnect(&conn);
        }
    }

    /// Returns the connection for a host address, if the host is known.
    pub fn conn(&self, address: &str) -> Option<Arc<HostConn>> {
        self.conns.read().get(address).cloned()
    }

    /// Every known connection.
    pub fn conns(&self) -> Vec<Arc<HostConn>> {
        self.conns.read().values().cloned().collect()
    }

    /// True when at least one host connection is up.
    pub fn any_connected(&self) -> bool {
        self.conns.read().values().any(|conn| conn.is_connected())
    }

    /// Sends one request and reads its response on the host's connection.
    ///
    /// Returns `Ok(None)` when the host is disconnected. An in-flight
    /// failure closes the connection (triggering the reconnect machine) and
    /// surfaces to the caller.
    pub fn request(&self, conn: &HostConn, request: &HostRequest) -> CacheResult<Option<HostResponse>> {
        let payload = request.encode()?;
        let opcode = request.opcode();

        let mut guard = conn.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Ok(None);
        };

        let result = exchange(stream, &payload, opcode, self.config.maximum_message_size);
        match result {
            Ok(response) => Ok(Some(response)),
            Err(err) => {
                *guard = None;
                drop(guard);
                self.note_disconnected(conn);
                Err(err)
            }
        }
    }

    /// Dispatches a write, honoring the configured disconnect policy.
    ///
    /// Returns true when the write was delivered (or queued), false when it
    /// was dropped.
    pub fn write(&self, conn: &HostConn, request: &HostRequest) -> CacheResult<bool> {
        match self.request(conn, request)? {
            Some(HostResponse::Ack) => Ok(true),
            Some(_) => Err(CacheError::protocol("expected ack response")),
            None => match self.config.write_policy {
                WritePolicy::Queue => {
                    conn.queued_writes.lock().push_back(request.encode()?);
                    Ok(true)
                }
                WritePolicy::Drop => {
                    debug!(host = %conn.address, "dropped write to disconnected host");
                    Ok(false)
                }
            },
        }
    }

    /// Stops the retry thread. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.retry_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Retry timer loop: one pass over disconnected hosts per interval.
    fn run_retry_loop(&self) {
        let interval = self.config.reconnect_interval();
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(interval);
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            for conn in self.conns() {
                if !conn.is_connected() {
                    self.try_reconnect(&conn);
                }
            }
        }
    }

    /// One serialized reconnection attempt for a single host.
    fn try_reconnect(&self, conn: &HostConn) {
        let mut guard = conn.stream.lock();
        // The flag may have flipped while we waited for the mutex.
        if conn.connected.load(Ordering::Acquire) {
            return;
        }

        let mut stream = match self.open_stream(&conn.address) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(host = %conn.address, %err, "reconnect attempt failed");
                return;
            }
        };

        if let Err(err) = self.flush_queued(conn, &mut stream) {
            debug!(host = %conn.address, %err, "queued write replay failed");
            return;
        }

        *guard = Some(stream);
        conn.connected.store(true, Ordering::Release);
        drop(guard);
        self.emit(&ClientEvent::HostReconnected(conn.address.clone()));
    }

    /// Replays writes queued while the host was down.
    ///
    /// A failed replay keeps the unsent remainder queued for the next
    /// attempt.
    fn flush_queued(&self, conn: &HostConn, stream: &mut TcpStream) -> CacheResult<()> {
        let mut queued = conn.queued_writes.lock();
        while let Some(payload) = queued.front() {
            let opcode = payload.first().copied().unwrap_or(0);
            if let Err(err) = exchange(stream, payload, opcode, self.config.maximum_message_size) {
                return Err(err);
            }
            queued.pop_front();
        }
        Ok(())
    }

    fn open_stream(&self, address: &str) -> CacheResult<TcpStream> {
        let timeout = self.config.communication_timeout();
        let stream = TcpStream::connect_timeout(&resolve(address)?, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Marks a connection down, firing the disconnect edge at most once.
    fn note_disconnected(&self, conn: &HostConn) {
        if conn.connected.swap(false, Ordering::AcqRel) {
            warn!(host = %conn.address, "host connection lost");
            self.emit(&ClientEvent::HostDisconnected(conn.address.clone()));
        }
    }

    fn emit(&self, event: &ClientEvent) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(event);
        }
    }
}

/// One request/response exchange on an open stream.
fn exchange(
    stream: &mut TcpStream,
    payload: &[u8],
    opcode: u8,
    max_frame: usize,
) -> CacheResult<HostResponse> {
    send_frame(stream, payload, max_frame).map_err(map_timeout)?;
    let reply = read_frame(stream, max_frame).map_err(map_timeout)?;
    HostResponse::decode(&reply, opcode)
}

/// Socket timeouts surface as IO errors; fold them into the Timeout kind.
fn map_timeout(err: CacheError) -> CacheError {
    match err {
        CacheError::Io(io) if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            CacheError::Timeout
        }
        other => other,
    }
}

/// Resolves a `host:port` string to a socket address.
pub fn resolve(address: &str) -> CacheResult<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| CacheError::Protocol(format!("unresolvable address {address}")))
}
