//! End-to-end tests: a real client against real host and manager services.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::runtime::Runtime;

use hive_client::{CacheClient, CacheError, ClientConfig, ClientEvent, Expiry, PutOptions, WritePolicy};
use hive_common::config::{HostConfig, ManagerConfig};
use hive_common::frame::{read_frame, send_frame};
use hive_common::message::HostRequest;
use hive_common::ring::{BucketOwner, Ring};
use hive_engine::{MemCache, MemCacheConfig};
use hive_host::manager_link::ManagerLink;
use hive_host::service::{dispatch, HostContext, HostService};
use hive_manager::service::ManagerService;

fn client_config() -> ClientConfig {
    ClientConfig {
        reconnect_interval_ms: 1000,
        membership_poll_interval_ms: 1000,
        communication_timeout_seconds: 5,
        ..ClientConfig::default()
    }
}

fn host_context(config: HostConfig) -> Arc<HostContext> {
    let cache = Arc::new(MemCache::new(MemCacheConfig::default()));
    HostContext::new(config, cache).expect("host context")
}

/// Starts a real host service on an ephemeral port.
fn start_host(rt: &Runtime) -> (String, Arc<HostContext>) {
    let config = HostConfig {
        port: 0,
        ..HostConfig::default()
    };
    let ctx = host_context(config);
    let service = rt.block_on(HostService::bind(Arc::clone(&ctx))).expect("bind host");
    let addr = service.local_addr().expect("addr").to_string();
    rt.spawn(async move {
        let _ = service.serve().await;
    });
    (addr, ctx)
}

/// Grabs an ephemeral port. Racy in principle, fine for tests.
fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

/// A host that answers `serve_requests` requests on its first connection,
/// then drops it, for exercising the reconnect machinery.
fn spawn_flaky_host(listener: StdTcpListener, ctx: Arc<HostContext>, serve_requests: usize) {
    thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        for _ in 0..serve_requests {
            let payload = match read_frame(&mut stream, 100 * 1024 * 1024) {
                Ok(payload) => payload,
                Err(_) => return,
            };
            let request = HostRequest::decode(&payload).expect("decode");
            let opcode = request.opcode();
            let response = dispatch(&ctx, request).expect("dispatch");
            let _ = send_frame(&mut stream, &response.encode(opcode), 100 * 1024 * 1024);
        }
        // Dropping the stream and listener simulates a host death.
    });
}

/// One-shot snapshot query against the manager's board port.
fn board_snapshot(board_port: u16) -> Option<hive_common::perf::ClusterSnapshot> {
    let mut stream = std::net::TcpStream::connect(("127.0.0.1", board_port)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(2))).ok()?;
    let request = hive_common::message::ManagerFrame::SnapshotRequest.encode().ok()?;
    send_frame(&mut stream, &request, 1024 * 1024).ok()?;
    let reply = read_frame(&mut stream, 4 * 1024 * 1024).ok()?;
    match hive_common::message::ManagerFrame::decode(&reply).ok()? {
        hive_common::message::ManagerFrame::Snapshot(snapshot) => Some(snapshot),
        _ => None,
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn single_host_write_read_roundtrip() {
    let rt = Runtime::new().unwrap();
    let (addr, _ctx) = start_host(&rt);

    let client = CacheClient::with_static_hosts(client_config(), vec![addr]).unwrap();
    client.add_or_update("foo", b"bar", &PutOptions::default()).unwrap();
    assert_eq!(client.get("foo").unwrap(), Some(b"bar".to_vec()));

    client.remove("foo").unwrap();
    assert_eq!(client.get("foo").unwrap(), None);
    client.stop();
}

#[test]
fn batched_ops_split_across_hosts_and_merge_in_caller_order() {
    let rt = Runtime::new().unwrap();
    let (addr1, ctx1) = start_host(&rt);
    let (addr2, ctx2) = start_host(&rt);

    let client =
        CacheClient::with_static_hosts(client_config(), vec![addr1.clone(), addr2.clone()]).unwrap();

    let pairs: Vec<(String, Vec<u8>)> = (0..200)
        .map(|i| (format!("key:{i}"), format!("value:{i}").into_bytes()))
        .collect();
    client.add_or_update_many(&pairs, &PutOptions::default()).unwrap();

    // Both hosts own a share of the key space and nothing was lost.
    let count1 = ctx1.cache.count();
    let count2 = ctx2.cache.count();
    assert!(count1 > 0 && count2 > 0, "counts: {count1}/{count2}");
    assert_eq!(count1 + count2, 200);

    // Slot order equals request order regardless of host grouping.
    let keys: Vec<String> = pairs.iter().map(|(key, _)| key.clone()).collect();
    let slots = client.get_many(&keys).unwrap();
    for (index, slot) in slots.iter().enumerate() {
        assert_eq!(slot.as_deref(), Some(format!("value:{index}").as_bytes()));
    }
    client.stop();
}

#[test]
fn absolute_expiration_reads_as_miss_after_deadline() {
    let rt = Runtime::new().unwrap();
    let (addr, _ctx) = start_host(&rt);
    let client = CacheClient::with_static_hosts(client_config(), vec![addr]).unwrap();

    let options = PutOptions::expiring(Expiry::absolute_at(SystemTime::now() + Duration::from_secs(1)));
    client.add_or_update("ephemeral", b"value", &options).unwrap();
    assert!(client.get("ephemeral").unwrap().is_some());

    thread::sleep(Duration::from_secs(2));
    assert_eq!(client.get("ephemeral").unwrap(), None);
    client.stop();
}

#[test]
fn sliding_expiration_survives_active_reads_then_lapses() {
    let rt = Runtime::new().unwrap();
    let (addr, _ctx) = start_host(&rt);
    let client = CacheClient::with_static_hosts(client_config(), vec![addr]).unwrap();

    let options = PutOptions::expiring(Expiry::sliding(Duration::from_secs(1)));
    client.add_or_update("session", b"live", &options).unwrap();

    for _ in 0..6 {
        thread::sleep(Duration::from_millis(300));
        assert!(client.get("session").unwrap().is_some(), "read inside the window keeps it");
    }

    thread::sleep(Duration::from_secs(2));
    assert_eq!(client.get("session").unwrap(), None);
    client.stop();
}

#[test]
fn tagged_reads_and_removal_span_hosts() {
    let rt = Runtime::new().unwrap();
    let (addr1, _ctx1) = start_host(&rt);
    let (addr2, _ctx2) = start_host(&rt);
    let client = CacheClient::with_static_hosts(client_config(), vec![addr1, addr2]).unwrap();

    let tagged = PutOptions {
        tag: Some("batch".to_string()),
        ..PutOptions::default()
    };
    for i in 0..20 {
        client.add_or_update(&format!("item:{i}"), b"payload", &tagged).unwrap();
    }

    assert_eq!(client.get_tagged("batch").unwrap().len(), 20);

    client.remove_tagged("batch", Some("item:1*")).unwrap();
    // item:1 and item:10..19 match the glob.
    assert_eq!(client.get_tagged("batch").unwrap().len(), 9);

    client.remove_tagged("batch", None).unwrap();
    assert!(client.get_tagged("batch").unwrap().is_empty());
    client.stop();
}

#[test]
fn disconnect_fires_one_edge_and_reconnect_restores_service() {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let port = listener.local_addr().unwrap().port();
    let ctx = host_context(HostConfig::default());
    spawn_flaky_host(listener, Arc::clone(&ctx), 1);

    let client = CacheClient::with_static_hosts(client_config(), vec![addr.clone()]).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.on_event(move |event| sink.lock().push(event.clone()));

    client.add_or_update("alpha", b"value", &PutOptions::default()).unwrap();

    // The flaky host dropped the connection after one request: the next
    // call fails in flight and fires exactly one disconnect edge.
    assert!(client.get("alpha").is_err());
    assert_eq!(
        *events.lock(),
        vec![ClientEvent::HostDisconnected(addr.clone())]
    );

    // With the only host down, calls fail with the typed error.
    assert!(matches!(client.get("alpha"), Err(CacheError::NoHostsAvailable)));

    // Revive the host on the same port; the retry timer reconnects.
    let listener = StdTcpListener::bind(("127.0.0.1", port)).unwrap();
    spawn_flaky_host(listener, Arc::clone(&ctx), usize::MAX);

    assert!(wait_until(Duration::from_secs(5), || client.get("alpha").is_ok()));
    assert_eq!(client.get("alpha").unwrap(), Some(b"value".to_vec()));
    assert_eq!(
        *events.lock(),
        vec![
            ClientEvent::HostDisconnected(addr.clone()),
            ClientEvent::HostReconnected(addr),
        ]
    );
    client.stop();
}

#[test]
fn writes_queue_while_owner_host_is_down_and_flush_on_reconnect() {
    let rt = Runtime::new().unwrap();
    let (live_addr, _live_ctx) = start_host(&rt);

    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let flaky_addr = listener.local_addr().unwrap().to_string();
    let flaky_port = listener.local_addr().unwrap().port();
    let flaky_ctx = host_context(HostConfig::default());
    spawn_flaky_host(listener, Arc::clone(&flaky_ctx), 1);

    let config = ClientConfig {
        write_policy: WritePolicy::Queue,
        ..client_config()
    };
    let members = vec![live_addr.clone(), flaky_addr.clone()];
    let client = CacheClient::with_static_hosts(config, members.clone()).unwrap();

    // Pick keys owned by each host under the shared ring.
    let ring = Ring::build(&members, false);
    let owned_by = |addr: &str| {
        (0..)
            .map(|i| format!("probe:{i}"))
            .find(|key| matches!(ring.owner_of(key), Some(BucketOwner::Host(owner)) if owner == addr))
            .unwrap()
    };
    let flaky_key = owned_by(&flaky_addr);
    let live_key = owned_by(&live_addr);

    // Exhaust the flaky host's single served request, killing the link.
    client.add_or_update(&flaky_key, b"first", &PutOptions::default()).unwrap();
    let _ = client.get(&flaky_key);

    // The live host still serves; the flaky host's write is queued.
    client.add_or_update(&live_key, b"live", &PutOptions::default()).unwrap();
    client.add_or_update(&flaky_key, b"queued", &PutOptions::default()).unwrap();
    assert_eq!(client.get(&flaky_key).unwrap(), None, "down host reads as a miss");

    // Revive; the queued write replays before the connection is reusable.
    let listener = StdTcpListener::bind(("127.0.0.1", flaky_port)).unwrap();
    spawn_flaky_host(listener, Arc::clone(&flaky_ctx), usize::MAX);

    assert!(wait_until(Duration::from_secs(5), || {
        client.get(&flaky_key).ok().flatten() == Some(b"queued".to_vec())
    }));
    client.stop();
}

#[test]
fn near_cache_serves_repeat_reads_without_the_host() {
    let rt = Runtime::new().unwrap();
    let (addr, ctx) = start_host(&rt);

    let config = ClientConfig {
        near_cache_enabled: true,
        near_cache_ttl_ms: 60_000,
        ..client_config()
    };
    let client = CacheClient::with_static_hosts(config, vec![addr]).unwrap();

    client.add_or_update("hot", b"value", &PutOptions::default()).unwrap();
    assert_eq!(client.get("hot").unwrap(), Some(b"value".to_vec()));

    // Remove the entry behind the client's back; the near-cache still
    // serves the read within its TTL.
    ctx.cache.remove("hot");
    assert_eq!(client.get("hot").unwrap(), Some(b"value".to_vec()));
    client.stop();
}

#[test]
fn unreachable_cluster_is_a_typed_error() {
    let client = CacheClient::with_static_hosts(client_config(), vec!["127.0.0.1:9".to_string()]).unwrap();
    assert!(matches!(client.get("anything"), Err(CacheError::NoHostsAvailable)));
    assert!(matches!(
        client.add_or_update("k", b"v", &PutOptions::default()),
        Err(CacheError::NoHostsAvailable)
    ));
    client.stop();
}

#[test]
fn manager_tracks_membership_through_host_lifecycle() {
    let rt = Runtime::new().unwrap();

    let manager_port = free_port();
    let mut board_port = free_port();
    while board_port == manager_port {
        board_port = free_port();
    }
    let manager_config = ManagerConfig {
        port: manager_port,
        board_port,
        host_polling_interval_ms: 200,
        deregistration_interval_ms: 200,
        ..ManagerConfig::default()
    };
    let manager = rt.block_on(ManagerService::start(manager_config)).expect("manager");
    rt.spawn(async move {
        let _ = manager.serve().await;
    });

    // A host that registers itself over the manager link.
    let host_port = free_port();
    let host_config = HostConfig {
        port: host_port,
        manager_port,
        manager_reconnect_interval_ms: 1000,
        ..HostConfig::default()
    };
    let host_addr = host_config.advertised_address();
    let ctx = host_context(host_config);
    let service = rt.block_on(HostService::bind(Arc::clone(&ctx))).expect("bind host");
    rt.spawn(async move {
        let _ = service.serve().await;
    });
    let link = rt.block_on(async { ManagerLink::start(Arc::clone(&ctx), |_| {}) });

    // The client discovers the host through the manager.
    let client_config = ClientConfig {
        manager_port,
        ..client_config()
    };
    let client = CacheClient::connect(client_config).unwrap();
    assert!(wait_until(Duration::from_secs(5), || client.hosts() == vec![host_addr.clone()]));

    client.add_or_update("routed", b"value", &PutOptions::default()).unwrap();
    assert_eq!(client.get("routed").unwrap(), Some(b"value".to_vec()));

    // The board endpoint serves read-only cluster snapshots.
    assert!(wait_until(Duration::from_secs(5), || {
        board_snapshot(board_port).is_some_and(|snapshot| {
            snapshot.hosts.len() == 1 && snapshot.hosts[0].address == host_addr
        })
    }));

    // Kill the host's manager link: after the deregistration interval the
    // membership empties and the client's ring follows.
    link.stop();
    assert!(wait_until(Duration::from_secs(10), || client.hosts().is_empty()));

    client.stop();
}
