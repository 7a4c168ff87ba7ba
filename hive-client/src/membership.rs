//! # Manager Membership Poller
//!
//! Purpose: Keep the client's ring and connection pool aligned with the
//! cluster by polling the manager's membership endpoint on an interval, the
//! same way the dashboard polls snapshots.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use hive_common::config::ClientConfig;
use hive_common::error::{CacheError, CacheResult};
use hive_common::frame::{read_frame, send_frame};
use hive_common::message::ManagerFrame;
use hive_common::ring::RoutingTable;

use crate::host_pool::{resolve, HostPool};

/// Background thread polling the manager for membership.
///
/// Call `stop` to signal shutdown and join the thread.
pub struct MembershipPoller {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MembershipPoller {
    /// Fetches once immediately (best-effort), then polls on the configured
    /// interval until stopped.
    pub fn start(config: ClientConfig, routing: Arc<RoutingTable>, pool: Arc<HostPool>) -> MembershipPoller {
        if let Err(err) = refresh(&config, &routing, &pool) {
            debug!(%err, "initial membership fetch failed; will retry on the poll timer");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let interval = config.membership_poll_interval();

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                if stop_thread.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = refresh(&config, &routing, &pool) {
                    debug!(%err, "membership poll failed");
                }
            }
        });

        MembershipPoller {
            stop,
            join: Some(join),
        }
    }

    /// Stops the poller and waits for the thread to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// One poll: fetch, rebuild the ring on change, reconcile the pool.
fn refresh(config: &ClientConfig, routing: &RoutingTable, pool: &HostPool) -> CacheResult<()> {
    let members = fetch_membership(config)?;
    if routing.rebuild(members.clone()) {
        debug!(total = members.len(), "membership changed; ring rebuilt");
        pool.sync_members(&members);
    }
    Ok(())
}

/// One-shot membership query against the manager.
pub fn fetch_membership(config: &ClientConfig) -> CacheResult<Vec<String>> {
    let timeout = config.communication_timeout();
    let mut stream = TcpStream::connect_timeout(&resolve(&config.manager_endpoint())?, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    let request = ManagerFrame::MembershipRequest.encode()?;
    send_frame(&mut stream, &request, config.maximum_message_size)?;
    let reply = read_frame(&mut stream, config.maximum_message_size)?;

    match ManagerFrame::decode(&reply)? {
        ManagerFrame::Membership { members } => Ok(members),
        other => Err(CacheError::Protocol(format!(
            "expected membership reply, got {other:?}"
        ))),
    }
}
