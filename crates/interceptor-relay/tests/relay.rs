//! End-to-end relay tests.
//!
//! Every test runs a real bridge on loopback between a plain tokio client
//! and a recording target listener, then checks what crossed the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use interceptor_core::{EndpointAddress, PlanKind, RelayTunables, SocketOptions};
use interceptor_relay::{Bridge, BridgeError, BridgeSettings, Plan};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;

/// A target listener that records every chunk it reads, optionally echoing.
struct Target {
    addr: SocketAddr,
    chunks: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
    connections: Arc<AtomicUsize>,
    close_tx: watch::Sender<u64>,
}

impl Target {
    async fn start(echo: bool) -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap(), echo).await
    }

    async fn start_on(addr: SocketAddr, echo: bool) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let chunks: Arc<Mutex<Vec<(Instant, Vec<u8>)>>> = Arc::default();
        let connections = Arc::new(AtomicUsize::new(0));
        let (close_tx, close_rx) = watch::channel(0u64);

        let accepted = Arc::clone(&connections);
        let recorded = Arc::clone(&chunks);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let chunks = Arc::clone(&recorded);
                let mut close_rx = close_rx.clone();
                let _ = close_rx.borrow_and_update();

                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    loop {
                        let n = tokio::select! {
                            _ = close_rx.changed() => break,
                            read = stream.read(&mut buf) => match read {
                                Ok(0) | Err(_) => break,
                                Ok(n) => n,
                            },
                        };
                        chunks
                            .lock()
                            .unwrap()
                            .push((Instant::now(), buf[..n].to_vec()));
                        if echo && stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            chunks,
            connections,
            close_tx,
        }
    }

    fn endpoint(&self) -> EndpointAddress {
        EndpointAddress::new("127.0.0.1", self.addr.port())
    }

    fn received(&self) -> Vec<u8> {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    fn arrival_times(&self) -> Vec<Instant> {
        self.chunks.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Drop every connection accepted so far.
    fn close_all(&self) {
        self.close_tx.send_modify(|generation| *generation += 1);
    }
}

async fn start_bridge(
    target: EndpointAddress,
    forward: PlanKind,
    reverse: PlanKind,
    settings: BridgeSettings,
) -> (Bridge, SocketAddr) {
    let bridge = Bridge::with_settings(
        EndpointAddress::new("127.0.0.1", 0),
        target,
        Plan::new(&forward),
        Plan::new(&reverse),
        settings,
    );
    let local = bridge.activate().await.unwrap();
    (bridge, local)
}

async fn wait_until(window: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read until the peer closes (EOF or reset); false if it stays open.
async fn closed_by_peer(stream: &mut TcpStream, window: Duration) -> bool {
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

fn graceful() -> BridgeSettings {
    BridgeSettings {
        socket: SocketOptions {
            nodelay: true,
            linger_zero: false,
        },
        ..BridgeSettings::default()
    }
}

#[tokio::test]
async fn pass_through_delivers_counter_sequence_in_order() {
    let target = Target::start(false).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::PassThrough,
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    let mut expected = Vec::new();
    for i in 0..500 {
        let piece = i.to_string();
        expected.extend_from_slice(piece.as_bytes());
        client.write_all(piece.as_bytes()).await.unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || target.received().len() >= expected.len()).await);
    assert_eq!(target.received(), expected);
    assert_eq!(bridge.stats().teardowns, 0);
    assert_eq!(target.connections(), 1);
}

#[tokio::test]
async fn pass_through_round_trips_through_echo_target() {
    let target = Target::start(true).await;
    let (_bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::PassThrough,
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    let mut client = TcpStream::connect(local).await.unwrap();
    let (mut reader, mut writer) = client.split();

    let mut echoed = vec![0u8; payload.len()];
    let (written, read) = tokio::join!(writer.write_all(&payload), async {
        tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut echoed)).await
    });
    written.unwrap();
    read.expect("echo within window").unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn drop_direction_delivers_nothing_and_stays_connected() {
    let target = Target::start(false).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::Drop,
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);
    for _ in 0..20 {
        client.write_all(b"into the void").await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(target.received().is_empty());
    assert!(bridge.is_connected());
    assert_eq!(bridge.stats().teardowns, 0);
    assert_eq!(bridge.phase(), 1);
}

#[tokio::test]
async fn constant_delay_keeps_order_and_minimum_latency() {
    let target = Target::start(false).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::ConstantDelay {
            delay: Duration::from_millis(200),
        },
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);

    let first_sent = Instant::now();
    client.write_all(b"first-").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second_sent = Instant::now();
    client.write_all(b"second").await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || target.received().len() >= 12).await);
    assert_eq!(target.received(), b"first-second");

    let times = target.arrival_times();
    let first_arrival = times[0];
    let last_arrival = times[times.len() - 1];
    let slack = Duration::from_millis(5);
    assert!(first_arrival + slack >= first_sent + Duration::from_millis(200));
    assert!(last_arrival + slack >= second_sent + Duration::from_millis(200));
}

#[tokio::test]
async fn reverse_plan_applies_to_replies() {
    let target = Target::start(true).await;
    let (_bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::PassThrough,
        PlanKind::ConstantDelay {
            delay: Duration::from_millis(150),
        },
        BridgeSettings::default(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    let sent = Instant::now();
    client.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(3), client.read_exact(&mut reply))
        .await
        .expect("reply within window")
        .unwrap();
    assert_eq!(&reply, b"ping");
    assert!(sent.elapsed() >= Duration::from_millis(145));
}

#[tokio::test]
async fn certain_failure_forwards_chunk_then_reconnects() {
    let target = Target::start(false).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::RandomFail {
            probability: 1.0,
            wait: Duration::ZERO,
        },
        PlanKind::PassThrough,
        graceful(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(b"x").await.unwrap();

    assert!(closed_by_peer(&mut client, Duration::from_secs(3)).await);
    assert!(wait_until(Duration::from_secs(2), || target.received() == b"x").await);
    assert!(wait_until(Duration::from_secs(2), || bridge.stats().teardowns == 1).await);

    // The same listen address serves the next client.
    let mut next = TcpStream::connect(local).await.unwrap();
    next.write_all(b"y").await.unwrap();
    assert!(closed_by_peer(&mut next, Duration::from_secs(3)).await);
    assert!(wait_until(Duration::from_secs(2), || target.received() == b"xy").await);
    assert!(wait_until(Duration::from_secs(2), || bridge.stats().teardowns == 2).await);
    assert_eq!(target.connections(), 2);
    assert_eq!(bridge.stats().phases_started, 2);
}

#[tokio::test]
async fn zero_failure_probability_never_disconnects() {
    let target = Target::start(false).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::RandomFail {
            probability: 0.0,
            wait: Duration::ZERO,
        },
        PlanKind::RandomFail {
            probability: 0.0,
            wait: Duration::ZERO,
        },
        BridgeSettings::default(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    for _ in 0..200 {
        client.write_all(b"ok").await.unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || target.received().len() >= 400).await);
    assert_eq!(target.received().len(), 400);
    assert!(bridge.is_connected());
    assert_eq!(bridge.stats().teardowns, 0);
}

#[tokio::test]
async fn simultaneous_close_tears_down_exactly_once() {
    let target = Target::start(true).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::PassThrough,
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let client = TcpStream::connect(local).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);
    assert!(wait_until(Duration::from_secs(2), || target.connections() == 1).await);

    // Both directions see their side vanish at once.
    target.close_all();
    drop(client);

    assert!(wait_until(Duration::from_secs(2), || bridge.stats().teardowns >= 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = bridge.stats();
    assert_eq!(stats.teardowns, 1);
    assert_eq!(stats.phases_started, 1);
    assert_eq!(bridge.phase(), 2);

    let mut next = TcpStream::connect(local).await.unwrap();
    next.write_all(b"again").await.unwrap();
    let mut reply = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(3), next.read_exact(&mut reply))
        .await
        .expect("echo within window")
        .unwrap();
    assert_eq!(&reply, b"again");
    assert_eq!(bridge.stats().phases_started, 2);
    assert_eq!(bridge.phase(), 3);
}

#[tokio::test]
async fn stale_teardown_request_is_ignored() {
    let target = Target::start(true).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::PassThrough,
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);
    let phase = bridge.phase();

    bridge.request_teardown_and_restart(phase - 1);
    bridge.request_teardown_and_restart(phase + 7);

    assert_eq!(bridge.phase(), phase);
    assert!(bridge.is_connected());
    assert_eq!(bridge.stats().teardowns, 0);

    client.write_all(b"still here").await.unwrap();
    let mut reply = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(3), client.read_exact(&mut reply))
        .await
        .expect("echo within window")
        .unwrap();
    assert_eq!(&reply, b"still here");
}

#[tokio::test]
async fn external_teardown_closes_both_sides() {
    let target = Target::start(false).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::PassThrough,
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);

    bridge.request_teardown_and_restart(bridge.phase());
    assert!(closed_by_peer(&mut client, Duration::from_secs(2)).await);
    assert!(!bridge.is_connected());
    assert_eq!(bridge.stats().teardowns, 1);
}

#[tokio::test]
async fn waits_for_target_to_come_up() {
    // Reserve a port, then leave it closed for a while.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let settings = BridgeSettings {
        tunables: RelayTunables {
            connect_retry_ms: 50,
            ..RelayTunables::default()
        },
        ..BridgeSettings::default()
    };
    let (bridge, local) = start_bridge(
        EndpointAddress::new("127.0.0.1", target_addr.port()),
        PlanKind::PassThrough,
        PlanKind::PassThrough,
        settings,
    )
    .await;

    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(b"early").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.stats().connect_attempts >= 3).await);
    assert_eq!(bridge.phase(), 0);

    let target = Target::start_on(target_addr, false).await;
    assert!(wait_until(Duration::from_secs(3), || bridge.is_connected()).await);
    assert!(wait_until(Duration::from_secs(2), || target.received() == b"early").await);
}

#[tokio::test]
async fn activate_is_idempotent() {
    let target = Target::start(true).await;
    let bridge = Bridge::new(
        EndpointAddress::new("127.0.0.1", 0),
        target.endpoint(),
        Plan::PassThrough,
        Plan::PassThrough,
    );

    let (first, second) = tokio::join!(bridge.activate(), bridge.activate());
    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(bridge.activate().await.unwrap(), first);
    assert_eq!(bridge.local_addr(), Some(first));

    let _client = TcpStream::connect(first).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bridge.stats().phases_started, 1);
    assert_eq!(target.connections(), 1);
}

#[tokio::test]
async fn occupied_listen_address_fails_activation() {
    let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = squatter.local_addr().unwrap();

    let bridge = Bridge::new(
        EndpointAddress::new("127.0.0.1", taken.port()),
        EndpointAddress::new("127.0.0.1", 9),
        Plan::PassThrough,
        Plan::PassThrough,
    );

    let err = bridge.activate().await.unwrap_err();
    assert!(matches!(err, BridgeError::Bind { .. }), "unexpected error: {err}");
    assert!(bridge.local_addr().is_none());
}

#[tokio::test]
async fn delayed_data_never_reaches_next_phase() {
    let target = Target::start(false).await;
    let (bridge, local) = start_bridge(
        target.endpoint(),
        PlanKind::ConstantDelay {
            delay: Duration::from_millis(300),
        },
        PlanKind::PassThrough,
        BridgeSettings::default(),
    )
    .await;

    let mut old = TcpStream::connect(local).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);
    old.write_all(b"stale").await.unwrap();
    // Give the worker time to read and queue the chunk.
    tokio::time::sleep(Duration::from_millis(50)).await;
    bridge.request_teardown_and_restart(bridge.phase());

    let mut fresh = TcpStream::connect(local).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || bridge.is_connected()).await);
    fresh.write_all(b"fresh").await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || target.received().len() >= 5).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(target.received(), b"fresh");
}
