//! The process-wide network host: one worker thread multiplexing every socket, a
//!  registry from remote endpoint to connection, and the server listener plumbing.
//!
//! The worker suspends only in a bounded readiness wait (`select!` over the wake
//!  handle and the poll interval) and never holds a lock across it; the registry lock
//!  is taken on connect, accept and close, not on data-plane operations. Listener
//!  callbacks run on the application thread, from [`NetworkHost::process`].

use crate::config::TransportConfig;
use crate::connection::{
    create_connection, ConnectionCore, ConnectionState, ConnectionWiring, MessageConnection, Role,
};
use crate::control::{Connect, MSG_ID_CONNECT};
use crate::error::ErrorKind;
use crate::handler::ServerListener;
use crate::message_frame::MessageFrame;
use crate::packet_header::PacketHeader;
use crate::send_pipeline::{ConnectedUdp, DatagramSocket, ListenerUdp};
use crate::tcp::TcpCore;
use crate::wait_free_queue::growable_ring::{self, GrowConsumer, GrowProducer};
use anyhow::{anyhow, Context};
use bytes::Buf;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportMode {
    Udp,
    Tcp,
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<TransportMode, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportMode::Udp),
            "tcp" => Ok(TransportMode::Tcp),
            other => Err(anyhow!("unknown transport mode '{}'", other)),
        }
    }
}

enum HostEvent {
    NewConnection(MessageConnection),
    ConnectionClosed(MessageConnection, Option<ErrorKind>),
}

enum WorkerCommand {
    AddUdpClient {
        socket: std::net::UdpSocket,
        wiring: ConnectionWiring,
        challenge: u32,
    },
    AddUdpListener {
        socket: std::net::UdpSocket,
    },
    AddTcpClient {
        stream: std::net::TcpStream,
        wiring: ConnectionWiring,
    },
    AddTcpListener {
        listener: std::net::TcpListener,
    },
    Shutdown,
}

struct HostShared {
    wake: Arc<Notify>,
    registry: RwLock<FxHashMap<SocketAddr, MessageConnection>>,
    listener: Mutex<Option<Arc<dyn ServerListener>>>,
    events: Mutex<GrowConsumer<HostEvent>>,
}

/// A value with an explicit lifecycle: create it, hand sockets in via `connect` /
///  `start_server`, pump callbacks with `process`, and `shutdown` drains everything.
pub struct NetworkHost {
    config: Arc<TransportConfig>,
    shared: Arc<HostShared>,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl NetworkHost {
    pub fn new(config: TransportConfig) -> anyhow::Result<NetworkHost> {
        config.validate()?;
        let config = Arc::new(config);

        let wake = Arc::new(Notify::new());
        let (events_tx, events_rx) = growable_ring::new(64);
        let shared = Arc::new(HostShared {
            wake: wake.clone(),
            registry: RwLock::new(FxHashMap::default()),
            listener: Mutex::new(None),
            events: Mutex::new(events_rx),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let worker_config = config.clone();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("msglink-worker".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("failed to build worker runtime: {}", e);
                        return;
                    }
                };
                let worker = Worker {
                    config: worker_config,
                    shared: worker_shared,
                    events_tx,
                    udp: Vec::new(),
                    tcp_listeners: Vec::new(),
                    tcp_cores: Vec::new(),
                    recv_buf: vec![0u8; 65536],
                    shutting_down: false,
                };
                runtime.block_on(worker.run(cmd_rx, wake));
            })
            .context("spawning network worker")?;

        Ok(NetworkHost { config, shared, cmd_tx, worker: Some(worker) })
    }

    /// Initiates a connection to `peer`; returns immediately with the connection in
    ///  `Pending` state (UDP) or established (TCP).
    pub fn connect(&self, peer: SocketAddr, mode: TransportMode) -> anyhow::Result<MessageConnection> {
        match mode {
            TransportMode::Udp => {
                let bind_addr: SocketAddr = if peer.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let socket = std::net::UdpSocket::bind(bind_addr).context("binding client socket")?;
                socket.connect(peer).context("connecting client socket")?;
                socket.set_nonblocking(true)?;

                let (connection, wiring) =
                    create_connection(&self.config, peer, "udp", self.shared.wake.clone());
                let challenge: u32 = rand::rng().random();

                self.shared.registry.write().unwrap().insert(peer, connection.clone());
                self.send_command(WorkerCommand::AddUdpClient { socket, wiring, challenge })?;
                Ok(connection)
            }
            TransportMode::Tcp => {
                let stream = std::net::TcpStream::connect(peer).context("connecting stream")?;
                stream.set_nodelay(true).ok();
                stream.set_nonblocking(true)?;

                let (connection, wiring) =
                    create_connection(&self.config, peer, "tcp", self.shared.wake.clone());

                self.shared.registry.write().unwrap().insert(peer, connection.clone());
                self.send_command(WorkerCommand::AddTcpClient { stream, wiring })?;
                Ok(connection)
            }
        }
    }

    /// Starts accepting connections on `port`. New connections are published through
    ///  `listener` the next time the application calls [`NetworkHost::process`].
    pub fn start_server(
        &self,
        port: u16,
        mode: TransportMode,
        listener: Arc<dyn ServerListener>,
    ) -> anyhow::Result<()> {
        *self.shared.listener.lock().unwrap() = Some(listener);

        match mode {
            TransportMode::Udp => {
                let socket = std::net::UdpSocket::bind(("0.0.0.0", port))
                    .with_context(|| format!("binding UDP server on port {}", port))?;
                socket.set_nonblocking(true)?;
                info!("listening for datagram connections on port {}", port);
                self.send_command(WorkerCommand::AddUdpListener { socket })
            }
            TransportMode::Tcp => {
                let listener = std::net::TcpListener::bind(("0.0.0.0", port))
                    .with_context(|| format!("binding TCP server on port {}", port))?;
                listener.set_nonblocking(true)?;
                info!("listening for stream connections on port {}", port);
                self.send_command(WorkerCommand::AddTcpListener { listener })
            }
        }
    }

    /// Application-thread pump for host-level callbacks (`new_connection_established`
    ///  and `connection_closed`).
    pub fn process(&self) {
        let mut events = Vec::new();
        {
            let mut ring = self.shared.events.lock().unwrap();
            while let Some(event) = ring.pop() {
                events.push(event);
            }
        }
        if events.is_empty() {
            return;
        }

        let listener = self.shared.listener.lock().unwrap().clone();
        let listener = match listener {
            Some(listener) => listener,
            None => return,
        };

        for event in events {
            match event {
                HostEvent::NewConnection(connection) => {
                    listener.new_connection_established(connection);
                }
                HostEvent::ConnectionClosed(connection, reason) => {
                    listener.connection_closed(connection, reason);
                }
            }
        }
    }

    /// The connection for a remote endpoint, if one is registered.
    pub fn connection(&self, peer: SocketAddr) -> Option<MessageConnection> {
        self.shared.registry.read().unwrap().get(&peer).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.read().unwrap().len()
    }

    /// Drains all connections (graceful disconnect, bounded by the disconnect grace
    ///  period) and stops the worker.
    pub fn shutdown(mut self) {
        self.do_shutdown();
    }

    fn do_shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            info!("shutting down network host");
            let _ = self.cmd_tx.send(WorkerCommand::Shutdown);
            self.shared.wake.notify_one();
            if worker.join().is_err() {
                error!("network worker panicked during shutdown");
            }
        }
    }

    fn send_command(&self, command: WorkerCommand) -> anyhow::Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| anyhow!("network worker is no longer running"))?;
        self.shared.wake.notify_one();
        Ok(())
    }
}

impl Drop for NetworkHost {
    fn drop(&mut self) {
        self.do_shutdown();
    }
}

struct UdpEntry {
    socket: Box<dyn DatagramSocket>,
    kind: UdpEntryKind,
}

enum UdpEntryKind {
    /// One connected socket per outgoing connection.
    Client(Option<ConnectionCore>),
    /// A server socket shared by every accepted peer, demultiplexed by address.
    Listener(FxHashMap<SocketAddr, ConnectionCore>),
}

struct Worker {
    config: Arc<TransportConfig>,
    shared: Arc<HostShared>,
    events_tx: GrowProducer<HostEvent>,
    udp: Vec<UdpEntry>,
    tcp_listeners: Vec<std::net::TcpListener>,
    tcp_cores: Vec<TcpCore>,
    recv_buf: Vec<u8>,
    shutting_down: bool,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>, wake: Arc<Notify>) {
        debug!("network worker started");
        loop {
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(self.config.worker_poll_interval) => {}
            }
            let now = Instant::now();

            while let Ok(command) = cmd_rx.try_recv() {
                self.apply_command(command, now);
            }

            self.sweep_udp(now);
            self.sweep_tcp(now);
            self.tick_all(now);
            self.reap(now);

            if self.shutting_down && self.is_drained() {
                break;
            }
        }
        debug!("network worker stopped");
    }

    fn apply_command(&mut self, command: WorkerCommand, now: Instant) {
        match command {
            WorkerCommand::AddUdpClient { socket, wiring, challenge } => {
                let peer = wiring.shared.peer();
                match tokio::net::UdpSocket::from_std(socket) {
                    Ok(socket) => {
                        let core = ConnectionCore::new(
                            self.config.clone(),
                            wiring,
                            Role::Client { local_challenge: challenge },
                            now,
                        );
                        self.udp.push(UdpEntry {
                            socket: Box::new(ConnectedUdp::new(socket, peer)),
                            kind: UdpEntryKind::Client(Some(core)),
                        });
                    }
                    Err(e) => {
                        error!("failed to register client socket for {}: {}", peer, e);
                        wiring
                            .shared
                            .set_state(ConnectionState::Closed, Some(ErrorKind::ConnectionRefused));
                    }
                }
            }
            WorkerCommand::AddUdpListener { socket } => match tokio::net::UdpSocket::from_std(socket) {
                Ok(socket) => self.udp.push(UdpEntry {
                    socket: Box::new(ListenerUdp::new(socket)),
                    kind: UdpEntryKind::Listener(FxHashMap::default()),
                }),
                Err(e) => error!("failed to register server socket: {}", e),
            },
            WorkerCommand::AddTcpClient { stream, wiring } => {
                self.tcp_cores.push(TcpCore::new(&self.config, wiring, stream));
            }
            WorkerCommand::AddTcpListener { listener } => {
                self.tcp_listeners.push(listener);
            }
            WorkerCommand::Shutdown => {
                self.shutting_down = true;
                for entry in &mut self.udp {
                    match &mut entry.kind {
                        UdpEntryKind::Client(Some(core)) => core.begin_shutdown(now),
                        UdpEntryKind::Client(None) => {}
                        UdpEntryKind::Listener(cores) => {
                            for core in cores.values_mut() {
                                core.begin_shutdown(now);
                            }
                        }
                    }
                }
                for core in &mut self.tcp_cores {
                    core.begin_shutdown(now);
                }
            }
        }
    }

    fn sweep_udp(&mut self, now: Instant) {
        for entry in self.udp.iter_mut() {
            let UdpEntry { socket, kind } = entry;
            loop {
                match socket.try_recv_datagram(&mut self.recv_buf) {
                    Ok((len, from)) => {
                        let datagram = &self.recv_buf[..len];
                        match kind {
                            UdpEntryKind::Client(Some(core)) => {
                                core.on_datagram(datagram, now);
                                send_outgoing(socket.as_ref(), core);
                            }
                            UdpEntryKind::Client(None) => {}
                            UdpEntryKind::Listener(cores) => {
                                if let Some(core) = cores.get_mut(&from) {
                                    core.on_datagram(datagram, now);
                                    send_outgoing(socket.as_ref(), core);
                                } else if let Some(mut core) = try_accept_udp(
                                    &self.config,
                                    &self.shared,
                                    &mut self.events_tx,
                                    datagram,
                                    from,
                                    now,
                                ) {
                                    core.on_datagram(datagram, now);
                                    send_outgoing(socket.as_ref(), &mut core);
                                    cores.insert(from, core);
                                }
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                        if let UdpEntryKind::Client(Some(core)) = kind {
                            core.on_connection_refused(now);
                        }
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("socket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    fn sweep_tcp(&mut self, _now: Instant) {
        for listener in &self.tcp_listeners {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        stream.set_nodelay(true).ok();
                        info!("accepted stream connection from {}", peer);

                        let (connection, wiring) =
                            create_connection(&self.config, peer, "tcp", self.shared.wake.clone());
                        self.shared.registry.write().unwrap().insert(peer, connection.clone());
                        self.events_tx.insert(HostEvent::NewConnection(connection));
                        self.tcp_cores.push(TcpCore::new(&self.config, wiring, stream));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    fn tick_all(&mut self, now: Instant) {
        for entry in self.udp.iter_mut() {
            let UdpEntry { socket, kind } = entry;
            match kind {
                UdpEntryKind::Client(Some(core)) => {
                    core.tick(now);
                    send_outgoing(socket.as_ref(), core);
                    report_if_closed(&self.shared, &mut self.events_tx, core);
                }
                UdpEntryKind::Client(None) => {}
                UdpEntryKind::Listener(cores) => {
                    for core in cores.values_mut() {
                        core.tick(now);
                        send_outgoing(socket.as_ref(), core);
                        report_if_closed(&self.shared, &mut self.events_tx, core);
                    }
                }
            }
        }

        for core in &mut self.tcp_cores {
            core.tick(now);
            if let Some(reason) = core.take_closed_event() {
                post_closed(&self.shared, &mut self.events_tx, core.peer(), reason);
            }
        }
    }

    fn reap(&mut self, now: Instant) {
        let registry = &self.shared.registry;

        for entry in self.udp.iter_mut() {
            match &mut entry.kind {
                UdpEntryKind::Client(core_slot) => {
                    if core_slot.as_ref().is_some_and(|core| core.is_reapable(now)) {
                        let core = core_slot.take().unwrap();
                        trace!("reaping connection to {}", core.peer());
                        registry.write().unwrap().remove(&core.peer());
                    }
                }
                UdpEntryKind::Listener(cores) => {
                    cores.retain(|peer, core| {
                        if core.is_reapable(now) {
                            trace!("reaping connection to {}", peer);
                            registry.write().unwrap().remove(peer);
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }
        self.udp.retain(|entry| !matches!(entry.kind, UdpEntryKind::Client(None)));

        self.tcp_cores.retain(|core| {
            if core.is_reapable(now) {
                registry.write().unwrap().remove(&core.peer());
                false
            } else {
                true
            }
        });
    }

    fn is_drained(&self) -> bool {
        let udp_done = self.udp.iter().all(|entry| match &entry.kind {
            UdpEntryKind::Client(Some(core)) => core.state() == ConnectionState::Closed,
            UdpEntryKind::Client(None) => true,
            UdpEntryKind::Listener(cores) => {
                cores.values().all(|core| core.state() == ConnectionState::Closed)
            }
        });
        let tcp_done = self.tcp_cores.iter().all(|core| core.state() == ConnectionState::Closed);
        udp_done && tcp_done
    }
}

fn send_outgoing(socket: &dyn DatagramSocket, core: &mut ConnectionCore) {
    let peer = core.peer();
    for datagram in core.drain_outgoing() {
        match socket.try_send_datagram(&datagram, peer) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // the send buffer is full; the reliable machinery recovers the loss
                trace!("send buffer full, dropping datagram to {}", peer);
            }
            Err(e) => debug!("send error to {}: {}", peer, e),
        }
    }
}

fn report_if_closed(
    shared: &HostShared,
    events_tx: &mut GrowProducer<HostEvent>,
    core: &mut ConnectionCore,
) {
    if let Some(reason) = core.take_closed_event() {
        post_closed(shared, events_tx, core.peer(), reason);
    }
}

fn post_closed(
    shared: &HostShared,
    events_tx: &mut GrowProducer<HostEvent>,
    peer: SocketAddr,
    reason: Option<ErrorKind>,
) {
    if let Some(connection) = shared.registry.read().unwrap().get(&peer).cloned() {
        events_tx.insert(HostEvent::ConnectionClosed(connection, reason));
    }
}

/// A datagram from an unknown endpoint opens a connection only if it carries a
///  well-formed `Connect` control frame; everything else is dropped.
fn try_accept_udp(
    config: &Arc<TransportConfig>,
    shared: &Arc<HostShared>,
    events_tx: &mut GrowProducer<HostEvent>,
    datagram: &[u8],
    from: SocketAddr,
    now: Instant,
) -> Option<ConnectionCore> {
    let mut buf = datagram;
    let _header = PacketHeader::deser(&mut buf).ok()?;

    let mut client_challenge = None;
    while buf.has_remaining() {
        let frame = MessageFrame::deser(&mut buf).ok()?;
        if frame.info.message_id == MSG_ID_CONNECT {
            let mut payload = frame.payload.as_slice();
            let connect = Connect::deser(&mut payload).ok()?;
            client_challenge = Some(connect.challenge);
            break;
        }
    }
    let client_challenge = client_challenge?;

    info!("accepting datagram connection from {}", from);
    let (connection, wiring) = create_connection(config, from, "udp", shared.wake.clone());
    shared.registry.write().unwrap().insert(from, connection.clone());
    events_tx.insert(HostEvent::NewConnection(connection));

    let role = Role::Server { local_challenge: rand::rng().random(), client_challenge };
    Some(ConnectionCore::new(config.clone(), wiring, role, now))
}
