//! Bridge: the accept, connect, forward, teardown cycle for one relay.
//!
//! A bridge binds its listen address once and then serves one client at
//! a time. Each accepted client plus its target connection is a *phase*;
//! the phase counter (guarded by one mutex) makes teardown exactly-once
//! per phase no matter how many workers notice the connection ending.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use interceptor_core::{EndpointAddress, RelayDescriptor, RelayTunables, SocketOptions};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::sync::{OnceCell, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::plan::Plan;
use crate::socket::{self, PeerSocket};
use crate::worker::{ConnectionOwner, Direction, ForwardingWorker};

const LISTEN_BACKLOG: u32 = 1024;

/// Per-bridge knobs that are not part of the relay descriptor itself.
#[derive(Debug, Clone, Default)]
pub struct BridgeSettings {
    /// Label used in log fields; defaults to `listen->target`.
    pub name: Option<String>,
    pub socket: SocketOptions,
    pub tunables: RelayTunables,
}

/// Point-in-time counters for one bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub phases_started: u64,
    /// One per real disconnection.
    pub teardowns: u64,
    pub connect_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    phases_started: AtomicU64,
    teardowns: AtomicU64,
    connect_attempts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            phases_started: self.phases_started.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// The socket pair and cancellation senders of the current phase.
#[derive(Debug)]
struct LiveConnection {
    client: Arc<PeerSocket>,
    target: Arc<PeerSocket>,
    /// Stops the worker reading from the client.
    client_cancel: watch::Sender<bool>,
    /// Stops the worker reading from the target.
    target_cancel: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct PhaseState {
    phase: u64,
    live: Option<LiveConnection>,
}

#[derive(Debug)]
struct BridgeInner {
    this: Weak<BridgeInner>,
    name: String,
    listen: EndpointAddress,
    target: EndpointAddress,
    forward: Arc<Plan>,
    reverse: Arc<Plan>,
    socket: SocketOptions,
    tunables: RelayTunables,
    listener: OnceCell<Arc<TcpListener>>,
    activated: AtomicBool,
    state: Mutex<PhaseState>,
    counters: Counters,
}

/// One relay: a listen address, a target address and a plan per direction.
///
/// Cloning is cheap and every clone drives the same bridge.
#[derive(Debug, Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// `forward` handles client → target bytes, `reverse` target → client.
    pub fn new(listen: EndpointAddress, target: EndpointAddress, forward: Plan, reverse: Plan) -> Self {
        Self::with_settings(listen, target, forward, reverse, BridgeSettings::default())
    }

    pub fn with_settings(
        listen: EndpointAddress,
        target: EndpointAddress,
        forward: Plan,
        reverse: Plan,
        settings: BridgeSettings,
    ) -> Self {
        let name = settings
            .name
            .unwrap_or_else(|| format!("{listen}->{target}"));

        let inner = Arc::new_cyclic(|this| BridgeInner {
            this: this.clone(),
            name,
            listen,
            target,
            forward: Arc::new(forward),
            reverse: Arc::new(reverse),
            socket: settings.socket,
            tunables: settings.tunables,
            listener: OnceCell::new(),
            activated: AtomicBool::new(false),
            state: Mutex::new(PhaseState::default()),
            counters: Counters::default(),
        });

        Self { inner }
    }

    /// Build a bridge from a validated descriptor.
    ///
    /// Must be called from within a tokio runtime (delay plans start
    /// their sender loops here).
    pub fn from_descriptor(
        descriptor: &RelayDescriptor,
        socket: SocketOptions,
        tunables: RelayTunables,
    ) -> Self {
        Self::with_settings(
            descriptor.listen.clone(),
            descriptor.target.clone(),
            Plan::new(&descriptor.forward),
            Plan::new(&descriptor.reverse),
            BridgeSettings {
                name: Some(descriptor.name.clone()),
                socket,
                tunables,
            },
        )
    }

    /// Bind the listen socket and start accepting in the background.
    ///
    /// Idempotent: later calls return the same bound address without
    /// binding again or starting a second accept loop.
    pub async fn activate(&self) -> BridgeResult<SocketAddr> {
        let inner = &self.inner;
        let listener = inner
            .listener
            .get_or_try_init(|| bind(&inner.listen))
            .await?;

        let local = listener.local_addr().map_err(|source| BridgeError::Bind {
            address: inner.listen.to_string(),
            source,
        })?;

        if !inner.activated.swap(true, Ordering::AcqRel) {
            info!(bridge = %inner.name, %local, target = %inner.target, "bridge listening");
            inner.spawn_accept_loop();
        }

        Ok(local)
    }

    /// End `phase` if it is still the current one and go back to accepting.
    pub fn request_teardown_and_restart(&self, phase: u64) {
        self.inner.request_teardown_and_restart(phase);
    }

    /// Current phase; 0 before the first client was accepted.
    pub fn phase(&self) -> u64 {
        self.inner.state.lock().expect("phase lock").phase
    }

    /// Whether a client/target pair is currently being forwarded.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().expect("phase lock").live.is_some()
    }

    /// The bound listen address, once activated.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .get()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn stats(&self) -> BridgeStats {
        self.inner.counters.snapshot()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn listen(&self) -> &EndpointAddress {
        &self.inner.listen
    }

    pub fn target(&self) -> &EndpointAddress {
        &self.inner.target
    }
}

async fn bind(listen: &EndpointAddress) -> BridgeResult<Arc<TcpListener>> {
    let address = listen.authority();

    let addr = lookup_host(address.as_str())
        .await
        .map_err(|source| BridgeError::Resolve {
            address: address.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| BridgeError::Resolve {
            address: address.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        })?;

    let bind_err = |source| BridgeError::Bind {
        address: address.clone(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    Ok(Arc::new(listener))
}

impl BridgeInner {
    fn spawn_accept_loop(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let Some(listener) = self.listener.get().cloned() else {
            return;
        };
        tokio::spawn(this.accept_once(listener));
    }

    /// One iteration per phase: accept a client, reach the target, commit.
    async fn accept_once(self: Arc<Self>, listener: Arc<TcpListener>) {
        let (client, client_peer) = loop {
            match listener.accept().await {
                Ok(pair) => break pair,
                Err(e) => {
                    warn!(bridge = %self.name, error = %e, "accept failed");
                    tokio::time::sleep(self.tunables.connect_retry()).await;
                }
            }
        };

        if let Err(e) = socket::configure(&client, &self.socket) {
            warn!(bridge = %self.name, peer = %client_peer, error = %e, "failed to set client socket options");
        }
        debug!(bridge = %self.name, peer = %client_peer, "client accepted");

        let (target, target_peer) = self.connect_target().await;
        if let Err(e) = socket::configure(&target, &self.socket) {
            warn!(bridge = %self.name, peer = %target_peer, error = %e, "failed to set target socket options");
        }

        self.commit_phase(client, client_peer, target, target_peer);
    }

    /// Connect to the target, retrying at a fixed interval until it answers.
    async fn connect_target(&self) -> (TcpStream, SocketAddr) {
        let address = self.target.authority();

        loop {
            let attempt = self.counters.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;

            match lookup_host(address.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        match TcpStream::connect(addr).await {
                            Ok(stream) => return (stream, addr),
                            Err(e) => debug!(
                                bridge = %self.name,
                                target = %addr,
                                attempt,
                                error = %e,
                                "target connect failed"
                            ),
                        }
                    }
                }
                Err(e) => debug!(
                    bridge = %self.name,
                    target = %address,
                    attempt,
                    error = %e,
                    "target did not resolve"
                ),
            }

            tokio::time::sleep(self.tunables.connect_retry()).await;
        }
    }

    fn commit_phase(
        self: &Arc<Self>,
        client: TcpStream,
        client_peer: SocketAddr,
        target: TcpStream,
        target_peer: SocketAddr,
    ) {
        let mut state = self.state.lock().expect("phase lock");
        state.phase += 1;
        let phase = state.phase;

        let client = Arc::new(PeerSocket::new(client, client_peer, phase));
        let target = Arc::new(PeerSocket::new(target, target_peer, phase));
        let (client_cancel, client_rx) = watch::channel(false);
        let (target_cancel, target_rx) = watch::channel(false);
        let owner: Arc<dyn ConnectionOwner> = Arc::clone(self) as Arc<dyn ConnectionOwner>;
        let buffer_size = self.tunables.read_buffer_bytes.max(1);

        ForwardingWorker {
            source: Arc::clone(&client),
            dest: Arc::clone(&target),
            cancel: client_rx,
            plan: Arc::clone(&self.forward),
            owner: Arc::clone(&owner),
            phase,
            direction: Direction::ClientToTarget,
            buffer_size,
        }
        .spawn();

        ForwardingWorker {
            source: Arc::clone(&target),
            dest: Arc::clone(&client),
            cancel: target_rx,
            plan: Arc::clone(&self.reverse),
            owner,
            phase,
            direction: Direction::TargetToClient,
            buffer_size,
        }
        .spawn();

        state.live = Some(LiveConnection {
            client,
            target,
            client_cancel,
            target_cancel,
        });
        self.counters.phases_started.fetch_add(1, Ordering::Relaxed);

        info!(
            bridge = %self.name,
            phase,
            client = %client_peer,
            target = %target_peer,
            forward = self.forward.name(),
            reverse = self.reverse.name(),
            "phase started"
        );
    }

    fn request_teardown_and_restart(&self, phase: u64) {
        let mut state = self.state.lock().expect("phase lock");

        if state.phase != phase {
            debug!(bridge = %self.name, phase, current = state.phase, "ignoring stale teardown request");
            return;
        }
        let Some(live) = state.live.take() else {
            debug!(bridge = %self.name, phase, "no live connection to tear down");
            return;
        };

        state.phase += 1;
        self.teardown(phase, live);
        self.counters.teardowns.fetch_add(1, Ordering::Relaxed);
        info!(bridge = %self.name, phase, "connection torn down, accepting again");

        self.spawn_accept_loop();
    }

    /// Best effort: every step runs even if an earlier one failed.
    fn teardown(&self, phase: u64, live: LiveConnection) {
        self.forward.on_closed();
        self.reverse.on_closed();

        if let Err(e) = live.client.close() {
            debug!(bridge = %self.name, phase, peer = %live.client.peer_addr(), error = %e, "client close failed");
        }
        if live.client_cancel.send(true).is_err() {
            trace!(bridge = %self.name, phase, "client worker already stopped");
        }
        if let Err(e) = live.target.close() {
            debug!(bridge = %self.name, phase, peer = %live.target.peer_addr(), error = %e, "target close failed");
        }
        if live.target_cancel.send(true).is_err() {
            trace!(bridge = %self.name, phase, "target worker already stopped");
        }
    }
}

impl ConnectionOwner for BridgeInner {
    fn request_teardown_and_restart(&self, phase: u64) {
        BridgeInner::request_teardown_and_restart(self, phase);
    }
}
