//! The message connection: an application-facing façade and the worker-side protocol
//!  engine it is wired to.
//!
//! The two halves never share a lock on the data plane. The application enqueues
//!  through a wait-free ring and observes state through atomic snapshots; the worker
//!  owns every piece of protocol state exclusively and publishes inbound messages
//!  through a second ring that the application drains in [`MessageConnection::process`].

use crate::config::{OverflowPolicy, TransportConfig};
use crate::congestion::{CongestionController, RttEstimator};
use crate::control::{
    Connect, ConnectAck, FlowControl, Ping, Pong, MSG_ID_CONNECT, MSG_ID_CONNECT_ACK,
    MSG_ID_DISCONNECT, MSG_ID_DISCONNECT_ACK, MSG_ID_FLOW_CONTROL, MSG_ID_PING, MSG_ID_PONG,
    PROTOCOL_VERSION,
};
use crate::error::ErrorKind;
use crate::fragment::FragmentReassembly;
use crate::handler::MessageHandler;
use crate::inbound::{InboundDispatch, InboundPipeline};
use crate::message::{Message, MessagePool};
use crate::message_frame::{is_control_id, is_reserved_id, FragmentInfo, FrameInfo, MessageFrame};
use crate::packet_header::{AckInfo, PacketHeader};
use crate::receive_window::{ReliableDedupeWindow, SequenceWindow, WindowOutcome};
use crate::scheduler::{OutboundScheduler, Popped};
use crate::seq::{PacketSeq, ReliableNumber};
use crate::simulator::{SendSimulator, SimulatorParams, SimulatorVerdict};
use crate::wait_free_queue::growable_ring::{GrowConsumer, GrowProducer};
use crate::wait_free_queue::{growable_ring, RingConsumer, RingProducer, WaitFreeQueue};
use anyhow::bail;
use bytes::Buf;
use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Handshake in progress; messages may already be queued.
    Pending,
    /// Fully established.
    Ok,
    /// Shutdown initiated; no new messages, in-flight reliable data is draining.
    Disconnecting,
    Closed,
}

impl ConnectionState {
    fn to_code(self) -> u8 {
        match self {
            ConnectionState::Pending => 0,
            ConnectionState::Ok => 1,
            ConnectionState::Disconnecting => 2,
            ConnectionState::Closed => 3,
        }
    }

    fn from_code(code: u8) -> ConnectionState {
        match code {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Ok,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Closed,
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Ok => "ok",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", text)
    }
}

/// Point-in-time connection statistics.
#[derive(Copy, Clone, Debug)]
pub struct StatsSnapshot {
    pub rtt: Duration,
    pub rtt_deviation: Duration,
    pub congestion_window: usize,
    pub in_flight: usize,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub retransmitted_messages: u64,
    pub dropped_messages: u64,
}

#[derive(Default)]
struct SharedStats {
    rtt_us: AtomicU64,
    rttvar_us: AtomicU64,
    cwnd: AtomicUsize,
    in_flight: AtomicUsize,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    retransmitted_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

/// State visible to both halves. Everything here is an atomic or taken only on the
///  control plane.
pub(crate) struct ConnectionShared {
    peer: SocketAddr,
    mode_label: &'static str,
    state: AtomicU8,
    close_reason: AtomicU8,
    outbound_pending: AtomicUsize,
    disconnect_requested: AtomicBool,
    wake: Arc<Notify>,
    simulator_update: Mutex<Option<SimulatorParams>>,
    stats: SharedStats,
}

impl ConnectionShared {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_code(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn set_state(&self, state: ConnectionState, reason: Option<ErrorKind>) {
        if let Some(reason) = reason {
            self.close_reason.store(reason.to_code(), Ordering::Release);
        }
        self.state.store(state.to_code(), Ordering::Release);
    }

    pub(crate) fn close_reason(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.close_reason.load(Ordering::Acquire))
    }

    pub(crate) fn is_disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    pub(crate) fn note_delivered(&self, counts_as_pending: bool) {
        if counts_as_pending {
            self.outbound_pending.fetch_sub(1, Ordering::Relaxed);
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_dropped(&self, counts_as_pending: bool) {
        if counts_as_pending {
            self.outbound_pending.fetch_sub(1, Ordering::Relaxed);
            self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_received(&self) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_coalesced(&self) {
        self.outbound_pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Worker-to-application events.
pub(crate) enum ConnectionEvent {
    Message {
        packet_seq: PacketSeq,
        message_id: u32,
        payload: Vec<u8>,
    },
}

enum OutboundProducerImpl {
    Bounded(RingProducer<Message>),
    Growable(GrowProducer<Message>),
}

pub(crate) enum OutboundConsumer {
    Bounded(RingConsumer<Message>),
    Growable(GrowConsumer<Message>),
}

impl OutboundConsumer {
    pub(crate) fn pop(&mut self) -> Option<Message> {
        match self {
            OutboundConsumer::Bounded(ring) => ring.pop(),
            OutboundConsumer::Growable(ring) => ring.pop(),
        }
    }
}

struct AppSide {
    outbound: OutboundProducerImpl,
    events: GrowConsumer<ConnectionEvent>,
    handler: Option<Arc<dyn MessageHandler>>,
}

/// Application-facing connection handle; cheap to clone.
#[derive(Clone)]
pub struct MessageConnection {
    shared: Arc<ConnectionShared>,
    app: Arc<Mutex<AppSide>>,
    pool: Arc<MessagePool>,
    overflow_policy: OverflowPolicy,
    max_message_size: u32,
}

/// Everything the worker-side engine needs; produced together with the handle.
pub(crate) struct ConnectionWiring {
    pub shared: Arc<ConnectionShared>,
    pub outbound_rx: OutboundConsumer,
    pub events_tx: GrowProducer<ConnectionEvent>,
}

pub(crate) fn create_connection(
    config: &TransportConfig,
    peer: SocketAddr,
    mode_label: &'static str,
    wake: Arc<Notify>,
) -> (MessageConnection, ConnectionWiring) {
    let (outbound_tx, outbound_rx) = match config.overflow_policy {
        OverflowPolicy::Grow => {
            let (tx, rx) = growable_ring::new(config.outbound_ring_capacity);
            (OutboundProducerImpl::Growable(tx), OutboundConsumer::Growable(rx))
        }
        OverflowPolicy::Fail | OverflowPolicy::Block => {
            let (tx, rx) = WaitFreeQueue::new(config.outbound_ring_capacity).split();
            (OutboundProducerImpl::Bounded(tx), OutboundConsumer::Bounded(rx))
        }
    };
    let (events_tx, events_rx) = growable_ring::new(config.inbound_ring_capacity);

    let shared = Arc::new(ConnectionShared {
        peer,
        mode_label,
        state: AtomicU8::new(ConnectionState::Pending.to_code()),
        close_reason: AtomicU8::new(0),
        outbound_pending: AtomicUsize::new(0),
        disconnect_requested: AtomicBool::new(false),
        wake,
        simulator_update: Mutex::new(None),
        stats: SharedStats::default(),
    });

    let connection = MessageConnection {
        shared: shared.clone(),
        app: Arc::new(Mutex::new(AppSide {
            outbound: outbound_tx,
            events: events_rx,
            handler: None,
        })),
        pool: MessagePool::new(config.message_pool_size),
        overflow_policy: config.overflow_policy,
        max_message_size: config.max_message_size,
    };

    let wiring = ConnectionWiring { shared, outbound_rx, events_tx };

    (connection, wiring)
}

impl MessageConnection {
    /// Returns a writable message slot drawn from the per-connection pool.
    pub fn start_new_message(&self, message_id: u32, size_hint: usize) -> anyhow::Result<Message> {
        if is_reserved_id(message_id) {
            bail!("message id {} is reserved for the engine (ids below 8)", message_id);
        }
        match self.connection_state() {
            ConnectionState::Disconnecting | ConnectionState::Closed => {
                bail!(ErrorKind::ConnectionClosed)
            }
            _ => {}
        }

        Ok(Message::new(message_id, self.pool.get_buffer(size_hint), self.pool.clone()))
    }

    /// Hands the message to the outbound scheduler.
    pub fn end_and_queue(&self, message: Message) -> anyhow::Result<()> {
        match self.connection_state() {
            ConnectionState::Disconnecting | ConnectionState::Closed => {
                bail!(ErrorKind::ConnectionClosed)
            }
            _ => {}
        }
        if message.payload().len() as u64 > self.max_message_size as u64 {
            bail!(ErrorKind::MessageTooLargeAfterFragment);
        }

        let mut app = self.app.lock().unwrap();
        match &mut app.outbound {
            OutboundProducerImpl::Growable(ring) => {
                self.shared.outbound_pending.fetch_add(1, Ordering::Relaxed);
                ring.insert(message);
            }
            OutboundProducerImpl::Bounded(ring) => match self.overflow_policy {
                OverflowPolicy::Block => {
                    let mut message = message;
                    loop {
                        match ring.insert(message) {
                            Ok(()) => break,
                            Err(back) => {
                                if self.shared.state() == ConnectionState::Closed {
                                    bail!(ErrorKind::ConnectionClosed);
                                }
                                message = back;
                                self.shared.wake.notify_one();
                                std::thread::yield_now();
                            }
                        }
                    }
                    self.shared.outbound_pending.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    if ring.insert(message).is_err() {
                        bail!(ErrorKind::OutboundQueueFull);
                    }
                    self.shared.outbound_pending.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
        drop(app);

        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn register_inbound_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.app.lock().unwrap().handler = Some(handler);
    }

    /// Application-thread pump: drains the inbound ring and invokes the registered
    ///  handler for each message. Inbound content-id coalescing (when the handler
    ///  derives non-zero ids) happens here, ahead of dispatch.
    pub fn process(&self) {
        let (messages, handler) = {
            let mut app = self.app.lock().unwrap();
            let mut messages = Vec::new();
            while let Some(event) = app.events.pop() {
                match event {
                    ConnectionEvent::Message { packet_seq, message_id, payload } => {
                        messages.push((packet_seq, message_id, payload));
                    }
                }
            }
            (messages, app.handler.clone())
        };

        let handler = match handler {
            Some(handler) => handler,
            None => {
                if !messages.is_empty() {
                    debug!(
                        "dropping {} inbound messages: no handler registered on {}",
                        messages.len(),
                        self
                    );
                }
                return;
            }
        };

        let mut keep = vec![true; messages.len()];
        let mut latest_by_content: FxHashMap<u32, usize> = FxHashMap::default();
        for (index, (_, message_id, payload)) in messages.iter().enumerate() {
            let content_id = handler.compute_content_id(*message_id, payload);
            if content_id == 0 {
                continue;
            }
            if let Some(previous) = latest_by_content.insert(content_id, index) {
                keep[previous] = false;
            }
        }

        for (index, (packet_seq, message_id, payload)) in messages.into_iter().enumerate() {
            if keep[index] {
                handler.handle_message(self, packet_seq, message_id, &payload);
            }
        }
    }

    /// Initiates graceful shutdown; idempotent, completes asynchronously.
    pub fn disconnect(&self) {
        self.shared.disconnect_requested.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Why the connection reached `Closed`; `None` while healthy or after a locally
    ///  initiated clean shutdown.
    pub fn close_reason(&self) -> Option<ErrorKind> {
        self.shared.close_reason()
    }

    /// Messages accepted by `end_and_queue` and not yet delivered (acknowledged if
    ///  reliable, serialized if not) or dropped.
    pub fn num_outbound_messages_pending(&self) -> usize {
        self.shared.outbound_pending.load(Ordering::Relaxed)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.shared.stats;
        StatsSnapshot {
            rtt: Duration::from_micros(stats.rtt_us.load(Ordering::Relaxed)),
            rtt_deviation: Duration::from_micros(stats.rttvar_us.load(Ordering::Relaxed)),
            congestion_window: stats.cwnd.load(Ordering::Relaxed),
            in_flight: stats.in_flight.load(Ordering::Relaxed),
            datagrams_sent: stats.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: stats.datagrams_received.load(Ordering::Relaxed),
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            retransmitted_messages: stats.retransmitted_messages.load(Ordering::Relaxed),
            dropped_messages: stats.dropped_messages.load(Ordering::Relaxed),
        }
    }

    /// Configure the local send simulator; applied by the worker on its next tick.
    pub fn set_send_simulator(&self, params: SimulatorParams) {
        *self.shared.simulator_update.lock().unwrap() = Some(params);
        self.shared.wake.notify_one();
    }
}

impl Display for MessageConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.shared.mode_label, self.shared.peer, self.connection_state())
    }
}

/// Which side of the handshake this engine plays.
pub(crate) enum Role {
    Client { local_challenge: u32 },
    Server { local_challenge: u32, client_challenge: u32 },
}

struct SentPacket {
    sent_at: Instant,
    carried_retransmit: bool,
    messages: Vec<Message>,
}

/// How long a closed engine lingers to answer disconnect retransmissions before the
///  worker reaps it.
const CLOSED_LINGER: Duration = Duration::from_secs(1);

/// Consecutive unanswered keepalive pings before the peer is declared unreachable.
const MAX_UNANSWERED_PINGS: u32 = 10;

/// Per-connection protocol engine. Owned and driven exclusively by the network
///  worker; every method takes the current time so tests can run it deterministically.
pub(crate) struct ConnectionCore {
    config: Arc<TransportConfig>,
    shared: Arc<ConnectionShared>,
    outbound_rx: OutboundConsumer,
    events_tx: GrowProducer<ConnectionEvent>,
    peer: SocketAddr,
    role: Role,
    state: ConnectionState,
    created_at: Instant,

    scheduler: OutboundScheduler,
    carry: Option<Message>,
    next_seq: PacketSeq,
    next_reliable: ReliableNumber,
    next_transfer_id: u16,
    sent_unacked: FxHashMap<u16, SentPacket>,

    seq_window: SequenceWindow,
    dedupe: ReliableDedupeWindow,
    pipeline: InboundPipeline,
    reassembly: FragmentReassembly,

    rtt: RttEstimator,
    congestion: CongestionController,
    simulator: SendSimulator,

    ack_pending_since: Option<Instant>,
    last_handshake_send: Option<Instant>,
    last_send: Instant,
    last_recv: Instant,
    ping_token_counter: u32,
    outstanding_ping: Option<(u32, Instant)>,
    unanswered_pings: u32,
    flow_control_sent: bool,

    malformed_count: u32,
    malformed_window_start: Instant,

    local_disconnect: bool,
    disconnect_queued: bool,
    disconnect_started: Option<Instant>,
    closed_at: Option<Instant>,
    closed_reported: bool,

    dispatch_scratch: Vec<InboundDispatch>,
    outgoing: Vec<Vec<u8>>,
}

impl ConnectionCore {
    pub(crate) fn new(
        config: Arc<TransportConfig>,
        wiring: ConnectionWiring,
        role: Role,
        now: Instant,
    ) -> ConnectionCore {
        let peer = wiring.shared.peer;
        ConnectionCore {
            shared: wiring.shared,
            outbound_rx: wiring.outbound_rx,
            events_tx: wiring.events_tx,
            peer,
            role,
            state: ConnectionState::Pending,
            created_at: now,
            scheduler: OutboundScheduler::new(),
            carry: None,
            next_seq: PacketSeq::ZERO,
            next_reliable: ReliableNumber::FIRST,
            next_transfer_id: 0,
            sent_unacked: FxHashMap::default(),
            seq_window: SequenceWindow::new(),
            dedupe: ReliableDedupeWindow::new(),
            pipeline: InboundPipeline::new(
                // grace before a provably-unreliable hole is skipped; a hole that
                //  may hold a reliable message is waited out regardless
                config.max_rto * 2,
                config.chain_reclaim_after,
            ),
            reassembly: FragmentReassembly::new(
                config.fragment_timeout,
                config.max_message_size as usize,
            ),
            rtt: RttEstimator::new(config.initial_rtt, config.min_rto, config.max_rto),
            congestion: CongestionController::new(now),
            simulator: SendSimulator::new(),
            ack_pending_since: None,
            last_handshake_send: None,
            last_send: now,
            last_recv: now,
            ping_token_counter: 0,
            outstanding_ping: None,
            unanswered_pings: 0,
            flow_control_sent: false,
            malformed_count: 0,
            malformed_window_start: now,
            local_disconnect: false,
            disconnect_queued: false,
            disconnect_started: None,
            closed_at: None,
            closed_reported: false,
            dispatch_scratch: Vec::new(),
            outgoing: Vec::new(),
            config,
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn close_reason(&self) -> Option<ErrorKind> {
        self.shared.close_reason()
    }

    /// Datagrams ready for the socket; drained by the worker after `on_datagram` /
    ///  `tick`.
    pub(crate) fn drain_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outgoing)
    }

    pub(crate) fn is_reapable(&self, now: Instant) -> bool {
        match self.closed_at {
            Some(closed_at) => now.duration_since(closed_at) >= CLOSED_LINGER,
            None => false,
        }
    }

    /// The close reason, exactly once, after the engine reaches `Closed`. Drives the
    ///  host-level `connection_closed` callback.
    pub(crate) fn take_closed_event(&mut self) -> Option<Option<ErrorKind>> {
        if self.state == ConnectionState::Closed && !self.closed_reported {
            self.closed_reported = true;
            let reason = self.close_reason();
            // a locally initiated clean shutdown carries no reason
            return Some(if self.local_disconnect { None } else { reason });
        }
        None
    }

    /// Host shutdown: behave as if the application called `disconnect`.
    pub(crate) fn begin_shutdown(&mut self, now: Instant) {
        self.on_disconnect_requested(now);
    }

    /// The client socket reported an ICMP-level refusal.
    pub(crate) fn on_connection_refused(&mut self, now: Instant) {
        if self.state == ConnectionState::Pending {
            info!("connection to {} refused", self.peer);
            self.teardown(ErrorKind::ConnectionRefused, now);
        }
    }

    pub(crate) fn on_datagram(&mut self, data: &[u8], now: Instant) {
        self.last_recv = now;
        self.unanswered_pings = 0;
        self.shared.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let mut buf = data;
        let header = match PacketHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(_) => {
                self.on_malformed(now, "unparsable packet header");
                return;
            }
        };

        if let Some(ack) = header.ack {
            self.process_ack(ack, now);
        }

        match self.seq_window.record(header.seq) {
            WindowOutcome::Fresh => {}
            WindowOutcome::Duplicate | WindowOutcome::TooFarAhead => {
                trace!("dropping duplicate/out-of-window datagram {} from {}", header.seq, self.peer);
                self.flush(now);
                return;
            }
        }

        if header.has_reliable_frames && self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }

        while buf.has_remaining() {
            let frame = match MessageFrame::deser(&mut buf) {
                Ok(frame) => frame,
                Err(_) => {
                    self.on_malformed(now, "unparsable message frame");
                    break;
                }
            };
            self.handle_frame(frame, header.seq, now);
        }

        self.flush(now);
    }

    pub(crate) fn tick(&mut self, now: Instant) {
        self.apply_simulator_update();
        self.drain_outbound_ring();

        if self.shared.disconnect_requested.load(Ordering::Acquire) {
            self.on_disconnect_requested(now);
        }

        match self.state {
            ConnectionState::Pending => self.tick_handshake(now),
            ConnectionState::Ok => {
                self.tick_retransmits(now);
                self.tick_keepalive(now);
            }
            ConnectionState::Disconnecting => {
                self.tick_retransmits(now);
                self.tick_disconnect_progress(now);
            }
            ConnectionState::Closed => {}
        }

        self.reassembly.expire(now);
        let mut dispatched = std::mem::take(&mut self.dispatch_scratch);
        self.pipeline.tick(now, &mut dispatched);
        self.push_dispatches(&mut dispatched);
        self.dispatch_scratch = dispatched;

        self.roll_malformed_window(now);
        self.flush(now);
        self.publish_stats();
    }

    fn apply_simulator_update(&mut self) {
        if let Some(params) = self.shared.simulator_update.lock().unwrap().take() {
            debug!("send simulator for {} reconfigured: {:?}", self.peer, params);
            self.simulator.configure(params);
        }
    }

    fn drain_outbound_ring(&mut self) {
        while let Some(message) = self.outbound_rx.pop() {
            match self.state {
                ConnectionState::Disconnecting | ConnectionState::Closed => {
                    self.release_dropped(message, ErrorKind::ConnectionClosed);
                }
                _ => {
                    if self.scheduler.queue(message) {
                        // coalesced away: two queued messages became one
                        self.shared.outbound_pending.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn on_disconnect_requested(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Pending => {
                debug!("disconnect requested while pending; closing {}", self.peer);
                self.teardown_clean(now);
            }
            ConnectionState::Ok => {
                info!("disconnecting from {}", self.peer);
                self.local_disconnect = true;
                self.begin_disconnect(now);
            }
            _ => {}
        }
    }

    fn begin_disconnect(&mut self, now: Instant) {
        self.set_state(ConnectionState::Disconnecting, None);
        self.disconnect_started = Some(now);

        if self.local_disconnect && !self.disconnect_queued {
            self.disconnect_queued = true;
            let disconnect = Message::internal(MSG_ID_DISCONNECT, Vec::new(), true, u32::MAX);
            self.scheduler.requeue_front([disconnect]);
        }

        // everything queued but never handed to the wire is reported, not silently lost
        let unsent = self.scheduler.drain_unsent();
        for message in unsent {
            self.release_dropped(message, ErrorKind::ConnectionClosed);
        }
        if let Some(carried) = self.carry.take() {
            self.release_dropped(carried, ErrorKind::ConnectionClosed);
        }
    }

    fn tick_handshake(&mut self, now: Instant) {
        if now.duration_since(self.created_at) >= self.config.handshake_timeout {
            warn!("handshake with {} timed out", self.peer);
            self.teardown(ErrorKind::HandshakeTimeout, now);
            return;
        }

        let due = match self.last_handshake_send {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.handshake_resend_interval,
        };
        if !due {
            return;
        }
        self.last_handshake_send = Some(now);

        match self.role {
            Role::Client { local_challenge } => {
                trace!("sending Connect to {}", self.peer);
                let mut payload = Vec::new();
                Connect { challenge: local_challenge, protocol_version: PROTOCOL_VERSION }
                    .ser(&mut payload);
                self.send_control_datagram(MSG_ID_CONNECT, payload, now);
            }
            Role::Server { local_challenge, client_challenge } => {
                trace!("sending ConnectAck to {}", self.peer);
                let mut payload = Vec::new();
                ConnectAck {
                    echoed_challenge: client_challenge,
                    own_challenge: local_challenge,
                    protocol_version: PROTOCOL_VERSION,
                }
                .ser(&mut payload);
                self.send_control_datagram(MSG_ID_CONNECT_ACK, payload, now);
            }
        }
    }

    fn tick_retransmits(&mut self, now: Instant) {
        let rto = self.rtt.rto();
        let expired: Vec<u16> = self
            .sent_unacked
            .iter()
            .filter(|(_, packet)| now.duration_since(packet.sent_at) >= rto)
            .map(|(&seq, _)| seq)
            .collect();

        for seq in expired {
            let mut packet = self.sent_unacked.remove(&seq).unwrap();
            self.congestion.on_loss(now, self.rtt.srtt());
            debug!(
                "retransmission timeout for datagram {} to {} ({} reliable messages)",
                PacketSeq::from_raw(seq),
                self.peer,
                packet.messages.len()
            );

            let mut exhausted = false;
            for message in &mut packet.messages {
                message.retry_count += 1;
                self.shared.stats.retransmitted_messages.fetch_add(1, Ordering::Relaxed);
                exhausted |= message.retry_count > self.config.max_retries;
            }

            if exhausted {
                warn!("message to {} exceeded {} retries", self.peer, self.config.max_retries);
                for message in packet.messages {
                    self.release_dropped(message, ErrorKind::PeerUnreachable);
                }
                self.teardown(ErrorKind::PeerUnreachable, now);
                return;
            }
            self.scheduler.requeue_front(packet.messages);
        }
    }

    fn tick_keepalive(&mut self, now: Instant) {
        let interval = self.config.keepalive_interval;
        if now.duration_since(self.last_send) < interval
            || now.duration_since(self.last_recv) < interval
        {
            return;
        }

        if self.outstanding_ping.is_some() {
            self.unanswered_pings += 1;
            if self.unanswered_pings >= MAX_UNANSWERED_PINGS {
                warn!("{} unanswered pings from {}; giving up", self.unanswered_pings, self.peer);
                self.teardown(ErrorKind::PeerUnreachable, now);
                return;
            }
        }

        self.ping_token_counter = self.ping_token_counter.wrapping_add(1);
        let token = self.ping_token_counter;
        self.outstanding_ping = Some((token, now));

        let mut payload = Vec::new();
        Ping { token }.ser(&mut payload);
        self.send_control_datagram(MSG_ID_PING, payload, now);
    }

    fn tick_disconnect_progress(&mut self, now: Instant) {
        let drained = self.sent_unacked.is_empty() && self.scheduler.is_empty();
        let grace_exceeded = match self.disconnect_started {
            Some(started) => now.duration_since(started) >= self.config.disconnect_grace,
            None => true,
        };

        if drained || grace_exceeded {
            if self.local_disconnect {
                self.teardown_clean(now);
            } else {
                self.teardown(ErrorKind::PeerDisconnected, now);
            }
        }
    }

    fn process_ack(&mut self, ack: AckInfo, now: Instant) {
        let acked: Vec<u16> = self
            .sent_unacked
            .keys()
            .copied()
            .filter(|&seq| ack.covers(PacketSeq::from_raw(seq)))
            .collect();

        for seq in acked {
            let packet = self.sent_unacked.remove(&seq).unwrap();
            if !packet.carried_retransmit {
                self.rtt.on_sample(now.duration_since(packet.sent_at));
                self.shared
                    .stats
                    .rtt_us
                    .store(self.rtt.srtt().as_micros() as u64, Ordering::Relaxed);
                self.shared
                    .stats
                    .rttvar_us
                    .store(self.rtt.rttvar().as_micros() as u64, Ordering::Relaxed);
            }
            self.congestion.on_ack();

            for message in packet.messages {
                // first ack covering the carrying datagram: delivered
                self.release_delivered(message);
            }
        }
    }

    fn handle_frame(&mut self, frame: MessageFrame, packet_seq: PacketSeq, now: Instant) {
        if let Some(number) = frame.info.reliable_number {
            if self.dedupe.record(number) != WindowOutcome::Fresh {
                trace!("dropping duplicate reliable message {} from {}", number, self.peer);
                return;
            }
        }

        if is_control_id(frame.info.message_id) {
            self.handle_control(frame, now);
            return;
        }

        if self.state == ConnectionState::Closed {
            return;
        }

        // a reliable application frame is the client's implicit handshake confirmation
        if self.state == ConnectionState::Pending && frame.info.reliable_number.is_some() {
            if matches!(self.role, Role::Server { .. }) {
                self.promote_to_ok(now);
            }
        }

        let info = frame.info;
        if let Some(fragment) = info.fragment {
            if let Some(reassembled) = self.reassembly.on_fragment(&info, fragment, frame.payload, now) {
                self.dispatch(packet_seq, reassembled.message_id, reassembled.ordering, reassembled.payload, now);
            }
        } else {
            self.dispatch(packet_seq, info.message_id, info.ordering, frame.payload, now);
        }
    }

    fn dispatch(
        &mut self,
        packet_seq: PacketSeq,
        message_id: u32,
        ordering: Option<crate::message_frame::OrderingInfo>,
        payload: Vec<u8>,
        now: Instant,
    ) {
        let mut dispatched = std::mem::take(&mut self.dispatch_scratch);
        self.pipeline.on_message(packet_seq, message_id, ordering, payload, now, &mut dispatched);
        self.push_dispatches(&mut dispatched);
        self.dispatch_scratch = dispatched;
    }

    fn push_dispatches(&mut self, dispatched: &mut Vec<InboundDispatch>) {
        for dispatch in dispatched.drain(..) {
            self.shared.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            self.events_tx.insert(ConnectionEvent::Message {
                packet_seq: dispatch.packet_seq,
                message_id: dispatch.message_id,
                payload: dispatch.payload,
            });
        }
    }

    fn handle_control(&mut self, frame: MessageFrame, now: Instant) {
        let mut payload = frame.payload.as_slice();
        match frame.info.message_id {
            MSG_ID_CONNECT => {
                // a retransmitted Connect: the client has not seen our ConnectAck yet
                if let Role::Server { local_challenge, client_challenge } = self.role {
                    if let Ok(connect) = Connect::deser(&mut payload) {
                        if connect.challenge == client_challenge {
                            let mut reply = Vec::new();
                            ConnectAck {
                                echoed_challenge: client_challenge,
                                own_challenge: local_challenge,
                                protocol_version: PROTOCOL_VERSION,
                            }
                            .ser(&mut reply);
                            self.send_control_datagram(MSG_ID_CONNECT_ACK, reply, now);
                        }
                    }
                }
            }
            MSG_ID_CONNECT_ACK => {
                let ack = match ConnectAck::deser(&mut payload) {
                    Ok(ack) => ack,
                    Err(_) => {
                        self.on_malformed(now, "unparsable ConnectAck");
                        return;
                    }
                };
                match self.role {
                    Role::Client { local_challenge } => {
                        if self.state == ConnectionState::Pending
                            && ack.echoed_challenge == local_challenge
                        {
                            debug!("handshake with {} complete (protocol v{})", self.peer, ack.protocol_version);
                            self.promote_to_ok(now);

                            // confirm the server challenge; reliable, so it survives loss
                            let mut confirm = Vec::new();
                            ConnectAck {
                                echoed_challenge: ack.own_challenge,
                                own_challenge: 0,
                                protocol_version: PROTOCOL_VERSION,
                            }
                            .ser(&mut confirm);
                            let message =
                                Message::internal(MSG_ID_CONNECT_ACK, confirm, true, u32::MAX);
                            self.scheduler.requeue_front([message]);
                        }
                    }
                    Role::Server { local_challenge, .. } => {
                        if self.state == ConnectionState::Pending
                            && ack.echoed_challenge == local_challenge
                        {
                            self.promote_to_ok(now);
                        }
                    }
                }
            }
            MSG_ID_DISCONNECT => {
                self.send_control_datagram(MSG_ID_DISCONNECT_ACK, Vec::new(), now);
                match self.state {
                    ConnectionState::Pending | ConnectionState::Ok => {
                        info!("{} disconnected", self.peer);
                        self.local_disconnect = false;
                        self.begin_disconnect(now);
                    }
                    _ => {}
                }
            }
            MSG_ID_DISCONNECT_ACK => {
                // our Disconnect arrived even if the datagram-level ack got lost
                self.sent_unacked.retain(|_, packet| {
                    !packet.messages.iter().all(|m| m.message_id() == MSG_ID_DISCONNECT)
                });
            }
            MSG_ID_PING => {
                if let Ok(ping) = Ping::deser(&mut payload) {
                    let mut reply = Vec::new();
                    Pong { token: ping.token }.ser(&mut reply);
                    self.send_control_datagram(MSG_ID_PONG, reply, now);
                }
            }
            MSG_ID_PONG => {
                if let Ok(pong) = Pong::deser(&mut payload) {
                    if let Some((token, sent_at)) = self.outstanding_ping {
                        if token == pong.token {
                            self.rtt.on_sample(now.duration_since(sent_at));
                            self.outstanding_ping = None;
                            self.unanswered_pings = 0;
                        }
                    }
                }
            }
            MSG_ID_FLOW_CONTROL => {
                if let Ok(flow) = FlowControl::deser(&mut payload) {
                    debug!("{} capped our send rate at {}/s", self.peer, flow.max_datagrams_per_second);
                    self.congestion.set_peer_rate_cap(flow.max_datagrams_per_second);
                }
            }
            _ => unreachable!("is_control_id gated"),
        }
    }

    fn promote_to_ok(&mut self, now: Instant) {
        if self.state != ConnectionState::Pending {
            return;
        }
        info!("connection with {} established", self.peer);
        self.set_state(ConnectionState::Ok, None);
        self.last_handshake_send = None;
        self.last_recv = now;

        if let Some(rate) = self.config.inbound_rate_limit {
            if !self.flow_control_sent {
                self.flow_control_sent = true;
                let mut payload = Vec::new();
                FlowControl { max_datagrams_per_second: rate }.ser(&mut payload);
                let message = Message::internal(MSG_ID_FLOW_CONTROL, payload, true, u32::MAX);
                self.scheduler.requeue_front([message]);
            }
        }
    }

    /// Serialize one unreliable control frame into its own datagram, bypassing the
    ///  scheduler. Used for the handshake (no reliable machinery yet) and for
    ///  ping/pong/disconnect-ack, which are cheap to resend.
    fn send_control_datagram(&mut self, message_id: u32, payload: Vec<u8>, now: Instant) {
        let ack = self.take_due_ack();
        let header = PacketHeader { seq: self.next_seq, ack, has_reliable_frames: false };
        self.next_seq = self.next_seq.next();

        let mut datagram = Vec::with_capacity(64 + payload.len());
        header.ser(&mut datagram);
        FrameInfo::plain(message_id).ser(&payload, &mut datagram);
        self.transmit(datagram, now);
    }

    /// The ack section for an outgoing datagram, if one is owed.
    fn take_due_ack(&mut self) -> Option<AckInfo> {
        if self.ack_pending_since.take().is_some() {
            return Some(self.seq_window.ack_info());
        }
        None
    }

    fn flush(&mut self, now: Instant) {
        if matches!(self.state, ConnectionState::Pending | ConnectionState::Closed) {
            self.flush_ack_only(now);
            self.release_simulated(now);
            return;
        }

        self.congestion.refill(now, self.rtt.srtt());

        loop {
            if !self.congestion.may_send(self.sent_unacked.len()) {
                break;
            }

            let budget =
                self.config.max_datagram_payload - PacketHeader::BASE_LEN - PacketHeader::ACK_SECTION_LEN;
            let mut remaining = budget;
            let mut batch: Vec<Message> = Vec::new();

            while let Some(message) = self.next_sendable(now) {
                let info = self.frame_info_for(&message);
                let frame_len = info.serialized_len(message.payload().len());

                if frame_len <= remaining {
                    remaining -= frame_len;
                    batch.push(message);
                    continue;
                }

                if batch.is_empty() {
                    // does not fit even into an empty datagram: fragment it
                    self.fragment_message(message, budget);
                    continue;
                }

                self.carry = Some(message);
                break;
            }

            if batch.is_empty() {
                break;
            }

            self.emit_datagram(batch, now);
        }

        self.flush_ack_only(now);
        self.release_simulated(now);
    }

    /// Next message eligible for serialization in the current state; assigns the
    ///  reliable number on first contact with the wire path.
    fn next_sendable(&mut self, now: Instant) -> Option<Message> {
        loop {
            let popped = if let Some(carried) = self.carry.take() {
                Popped::Ready(carried)
            } else if self.state == ConnectionState::Disconnecting {
                // draining: retransmissions and the disconnect frame only
                self.scheduler.pop_retransmit(now)?
            } else {
                self.scheduler.pop_next(now)?
            };

            match popped {
                Popped::Stale(message) => {
                    debug!("dropping stale message {} for {}", message.message_id(), self.peer);
                    self.release_dropped(message, ErrorKind::ConnectionClosed);
                    continue;
                }
                Popped::Ready(mut message) => {
                    if message.reliable && message.reliable_number.is_none() {
                        message.reliable_number = Some(self.next_reliable);
                        self.next_reliable = self.next_reliable.next();
                    }
                    return Some(message);
                }
            }
        }
    }

    fn frame_info_for(&self, message: &Message) -> FrameInfo {
        FrameInfo {
            message_id: message.message_id(),
            reliable_number: if message.reliable { message.reliable_number } else { None },
            ordering: message.ordering,
            fragment: message.fragment,
        }
    }

    fn fragment_message(&mut self, mut message: Message, datagram_budget: usize) {
        // worst-case frame overhead bounds the chunk size; a few spare bytes per
        //  fragment are a fair price for a simple split
        let probe = FrameInfo {
            message_id: message.message_id(),
            reliable_number: Some(ReliableNumber::from_raw(u32::MAX)),
            ordering: message.ordering,
            fragment: Some(FragmentInfo { transfer_id: u16::MAX, total: u32::MAX, index: u32::MAX }),
        };
        let overhead = probe.serialized_len(0) + 4; // payload length var-int headroom
        if overhead >= datagram_budget {
            self.release_dropped(message, ErrorKind::MessageTooLargeAfterFragment);
            return;
        }

        let chunk_size = datagram_budget - overhead;
        let payload = message.take_payload();
        let total = payload.len().div_ceil(chunk_size) as u32;

        let transfer_id = self.next_transfer_id;
        self.next_transfer_id = self.next_transfer_id.wrapping_add(1);

        debug!(
            "fragmenting {} byte message for {} into {} fragments (transfer {})",
            payload.len(),
            self.peer,
            total,
            transfer_id
        );

        let mut fragments = Vec::with_capacity(total as usize);
        for (index, chunk) in payload.chunks(chunk_size).enumerate() {
            let mut fragment =
                Message::internal(message.message_id(), chunk.to_vec(), true, message.priority);
            fragment.ordering = message.ordering;
            fragment.fragment = Some(FragmentInfo { transfer_id, total, index: index as u32 });
            // the last fragment carries the logical message's pending count
            fragment.counts_as_pending =
                index as u32 == total - 1 && message.counts_as_pending;
            fragments.push(fragment);
        }
        // the shell no longer represents a pending message
        message.counts_as_pending = false;
        drop(message);

        self.scheduler.requeue_front(fragments);
    }

    fn emit_datagram(&mut self, batch: Vec<Message>, now: Instant) {
        let has_reliable = batch.iter().any(|m| m.reliable);
        let ack = self.take_due_ack();
        let header = PacketHeader { seq: self.next_seq, ack, has_reliable_frames: has_reliable };
        let seq = self.next_seq;
        self.next_seq = self.next_seq.next();

        let mut datagram = Vec::with_capacity(self.config.max_datagram_payload);
        header.ser(&mut datagram);

        let mut reliable_messages = Vec::new();
        let mut carried_retransmit = false;
        for message in batch {
            let info = self.frame_info_for(&message);
            info.ser(message.payload(), &mut datagram);

            if message.reliable {
                carried_retransmit |= message.retry_count > 0;
                reliable_messages.push(message);
            } else {
                // unreliable: leaving the engine counts as sent
                self.release_delivered(message);
            }
        }

        debug_assert!(datagram.len() <= self.config.max_datagram_payload);

        if has_reliable {
            self.sent_unacked.insert(
                seq.to_raw(),
                SentPacket { sent_at: now, carried_retransmit, messages: reliable_messages },
            );
        }

        self.congestion.on_datagram_sent();
        self.transmit(datagram, now);
    }

    /// A dedicated ack-only datagram when received data has waited past the ack
    ///  delay with nothing outbound to piggy-back on.
    fn flush_ack_only(&mut self, now: Instant) {
        let due = match self.ack_pending_since {
            Some(since) => now.duration_since(since) >= self.config.ack_delay,
            None => false,
        };
        if !due {
            return;
        }
        self.ack_pending_since = None;

        let header = PacketHeader {
            seq: self.next_seq,
            ack: Some(self.seq_window.ack_info()),
            has_reliable_frames: false,
        };
        self.next_seq = self.next_seq.next();

        let mut datagram = Vec::with_capacity(PacketHeader::BASE_LEN + PacketHeader::ACK_SECTION_LEN);
        header.ser(&mut datagram);
        self.transmit(datagram, now);
    }

    fn transmit(&mut self, datagram: Vec<u8>, now: Instant) {
        self.last_send = now;
        self.shared.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        match self.simulator.offer(datagram, now) {
            SimulatorVerdict::SendNow(bytes) => self.outgoing.push(bytes),
            SimulatorVerdict::Delayed => {}
            SimulatorVerdict::Dropped => {}
        }
    }

    fn release_simulated(&mut self, now: Instant) {
        while let Some(bytes) = self.simulator.due(now) {
            self.outgoing.push(bytes);
        }
    }

    fn release_delivered(&mut self, message: Message) {
        if message.counts_as_pending {
            self.shared.outbound_pending.fetch_sub(1, Ordering::Relaxed);
            self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        drop(message); // payload returns to the pool
    }

    fn release_dropped(&mut self, message: Message, reason: ErrorKind) {
        if message.counts_as_pending {
            self.shared.outbound_pending.fetch_sub(1, Ordering::Relaxed);
            self.shared.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            debug!("dropping message {} for {}: {}", message.message_id(), self.peer, reason);
        }
        drop(message);
    }

    fn on_malformed(&mut self, now: Instant, what: &str) {
        debug!("malformed packet from {}: {}", self.peer, what);
        self.malformed_count += 1;

        let window = self.config.malformed_rate_window;
        let elapsed = now.duration_since(self.malformed_window_start);
        if elapsed >= window {
            self.malformed_window_start = now;
            self.malformed_count = 1;
            return;
        }

        let threshold = self.config.malformed_rate_limit * window.as_secs_f64();
        if self.malformed_count as f64 > threshold {
            warn!("sustained malformed packets from {}; tearing down", self.peer);
            self.teardown(ErrorKind::MalformedPacket, now);
        }
    }

    fn roll_malformed_window(&mut self, now: Instant) {
        if now.duration_since(self.malformed_window_start) >= self.config.malformed_rate_window {
            self.malformed_window_start = now;
            self.malformed_count = 0;
        }
    }

    fn set_state(&mut self, state: ConnectionState, reason: Option<ErrorKind>) {
        self.state = state;
        self.shared.set_state(state, reason);
    }

    fn teardown_clean(&mut self, now: Instant) {
        self.teardown_inner(None, now);
    }

    fn teardown(&mut self, reason: ErrorKind, now: Instant) {
        self.teardown_inner(Some(reason), now);
    }

    fn teardown_inner(&mut self, reason: Option<ErrorKind>, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }

        let drop_reason = reason.unwrap_or(ErrorKind::ConnectionClosed);
        for message in self.scheduler.drain_all() {
            self.release_dropped(message, drop_reason);
        }
        if let Some(carried) = self.carry.take() {
            self.release_dropped(carried, drop_reason);
        }
        for (_, packet) in std::mem::take(&mut self.sent_unacked) {
            for message in packet.messages {
                self.release_dropped(message, drop_reason);
            }
        }
        while let Some(message) = self.outbound_rx.pop() {
            self.release_dropped(message, drop_reason);
        }

        self.set_state(ConnectionState::Closed, reason);
        self.closed_at = Some(now);
        self.publish_stats();
    }

    fn publish_stats(&self) {
        self.shared.stats.cwnd.store(self.congestion.cwnd(), Ordering::Relaxed);
        self.shared.stats.in_flight.store(self.sent_unacked.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockMessageHandler;

    struct TestPair {
        client_conn: MessageConnection,
        server_conn: MessageConnection,
        client: ConnectionCore,
        server: ConnectionCore,
        now: Instant,
    }

    fn test_config() -> TransportConfig {
        TransportConfig::default()
    }

    fn new_pair_with(config: TransportConfig) -> TestPair {
        let config = Arc::new(config);
        let wake = Arc::new(Notify::new());
        let client_addr: SocketAddr = "127.0.0.1:1111".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:2222".parse().unwrap();
        let now = Instant::now();

        let (client_conn, client_wiring) =
            create_connection(&config, server_addr, "udp", wake.clone());
        let (server_conn, server_wiring) = create_connection(&config, client_addr, "udp", wake);

        let client = ConnectionCore::new(
            config.clone(),
            client_wiring,
            Role::Client { local_challenge: 7 },
            now,
        );
        let server = ConnectionCore::new(
            config,
            server_wiring,
            Role::Server { local_challenge: 9, client_challenge: 7 },
            now,
        );

        TestPair { client_conn, server_conn, client, server, now }
    }

    fn new_pair() -> TestPair {
        new_pair_with(test_config())
    }

    impl TestPair {
        /// Advance time, tick both sides, and shuttle datagrams until quiescent.
        fn pump(&mut self, rounds: usize, step: Duration) {
            for _ in 0..rounds {
                self.now += step;
                self.client.tick(self.now);
                self.server.tick(self.now);

                for _ in 0..16 {
                    let to_server = self.client.drain_outgoing();
                    let to_client = self.server.drain_outgoing();
                    if to_server.is_empty() && to_client.is_empty() {
                        break;
                    }
                    for datagram in to_server {
                        self.server.on_datagram(&datagram, self.now);
                    }
                    for datagram in to_client {
                        self.client.on_datagram(&datagram, self.now);
                    }
                }
            }
        }

        fn establish(&mut self) {
            self.pump(4, Duration::from_millis(15));
            assert_eq!(self.client.state(), ConnectionState::Ok);
            assert_eq!(self.server.state(), ConnectionState::Ok);
        }

        fn queue_on_client(&mut self, payload: &[u8], configure: impl FnOnce(&mut Message)) {
            let mut message = self.client_conn.start_new_message(191, payload.len()).unwrap();
            message.payload_mut().extend_from_slice(payload);
            configure(&mut message);
            self.client_conn.end_and_queue(message).unwrap();
        }

        fn server_received(&self) -> u64 {
            self.server_conn.stats().messages_received
        }

        fn drain_server_payloads(&mut self) -> Vec<Vec<u8>> {
            let mut result = Vec::new();
            let mut app = self.server_conn.app.lock().unwrap();
            while let Some(event) = app.events.pop() {
                match event {
                    ConnectionEvent::Message { payload, .. } => result.push(payload),
                }
            }
            result
        }
    }

    #[test]
    fn test_handshake_completes() {
        let mut pair = new_pair();
        assert_eq!(pair.client_conn.connection_state(), ConnectionState::Pending);

        pair.pump(4, Duration::from_millis(15));

        assert_eq!(pair.client_conn.connection_state(), ConnectionState::Ok);
        assert_eq!(pair.server_conn.connection_state(), ConnectionState::Ok);
    }

    #[test]
    fn test_handshake_timeout() {
        let mut pair = new_pair();
        // never deliver anything
        for _ in 0..8 {
            pair.now += Duration::from_secs(1);
            pair.client.tick(pair.now);
            pair.client.drain_outgoing();
        }

        assert_eq!(pair.client_conn.connection_state(), ConnectionState::Closed);
        assert_eq!(pair.client_conn.close_reason(), Some(ErrorKind::HandshakeTimeout));
    }

    #[test]
    fn test_reliable_round_trip() {
        let mut pair = new_pair();
        pair.establish();

        pair.queue_on_client(b"hello over the wire", |m| {
            m.reliable = true;
            m.priority = 3;
        });
        pair.pump(4, Duration::from_millis(15));

        assert_eq!(pair.drain_server_payloads(), vec![b"hello over the wire".to_vec()]);
        assert_eq!(pair.client_conn.num_outbound_messages_pending(), 0);
        assert_eq!(pair.client_conn.stats().messages_sent, 1);
    }

    #[test]
    fn test_replayed_datagram_is_not_delivered_twice() {
        let mut pair = new_pair();
        pair.establish();

        pair.queue_on_client(b"once only", |m| m.reliable = true);
        pair.now += Duration::from_millis(5);
        pair.client.tick(pair.now);

        let datagrams = pair.client.drain_outgoing();
        assert!(!datagrams.is_empty());

        for datagram in &datagrams {
            pair.server.on_datagram(datagram, pair.now);
        }
        assert_eq!(pair.server_received(), 1);

        // replay the identical bytes: the sequence window drops them
        for datagram in &datagrams {
            pair.server.on_datagram(datagram, pair.now);
        }
        assert_eq!(pair.server_received(), 1);
    }

    #[test]
    fn test_retransmission_is_deduplicated() {
        let mut pair = new_pair();
        pair.establish();

        pair.queue_on_client(b"dedupe me", |m| m.reliable = true);
        pair.now += Duration::from_millis(5);
        pair.client.tick(pair.now);
        let first = pair.client.drain_outgoing();
        for datagram in &first {
            pair.server.on_datagram(datagram, pair.now);
        }
        assert_eq!(pair.server_received(), 1);
        // withhold the server's ack; the client times out and re-sends under a new
        //  datagram sequence but the same reliable number
        pair.server.drain_outgoing();

        pair.now += Duration::from_millis(400);
        pair.client.tick(pair.now);
        let retransmit = pair.client.drain_outgoing();
        assert!(!retransmit.is_empty(), "expected a retransmission after the timeout");
        for datagram in &retransmit {
            pair.server.on_datagram(datagram, pair.now);
        }

        assert_eq!(pair.server_received(), 1, "reliable delivery must be exactly-once");
        assert_eq!(pair.client_conn.stats().retransmitted_messages, 1);
    }

    #[test]
    fn test_in_order_delivery_under_loss() {
        let mut pair = new_pair();
        pair.establish();

        // send counters 1..=8 on chain 1, dropping the first transmission of every
        //  third datagram; retransmissions must refill the chain in order
        let mut sent = 0u32;
        let mut transmissions = 0usize;
        let mut iterations = 0usize;
        while sent < 8 {
            iterations += 1;
            assert!(iterations < 2000, "transfer failed to make progress");
            if pair.client_conn.num_outbound_messages_pending() == 0 {
                sent += 1;
                let value = sent;
                pair.queue_on_client(&value.to_le_bytes(), |m| {
                    m.reliable = true;
                    m.in_order = true;
                    m.content_id = 1;
                });
            }

            pair.now += Duration::from_millis(30);
            pair.client.tick(pair.now);
            pair.server.tick(pair.now);

            for datagram in pair.client.drain_outgoing() {
                transmissions += 1;
                if transmissions % 3 == 0 {
                    continue; // lost
                }
                pair.server.on_datagram(&datagram, pair.now);
            }
            for datagram in pair.server.drain_outgoing() {
                pair.client.on_datagram(&datagram, pair.now);
            }
        }

        // let retransmissions drain
        pair.pump(30, Duration::from_millis(50));

        let payloads = pair.drain_server_payloads();
        let values: Vec<u32> = payloads
            .iter()
            .map(|p| u32::from_le_bytes(p.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(values, (1..=8).collect::<Vec<u32>>());
    }

    #[test]
    fn test_content_id_coalescing_end_to_end() {
        let mut pair = new_pair();
        pair.establish();

        for payload in [b"v1".as_slice(), b"v2", b"v3"] {
            pair.queue_on_client(payload, |m| {
                m.reliable = true;
                m.content_id = 42;
            });
        }
        pair.pump(4, Duration::from_millis(15));

        assert_eq!(pair.drain_server_payloads(), vec![b"v3".to_vec()]);
        assert_eq!(pair.client_conn.num_outbound_messages_pending(), 0);
    }

    #[test]
    fn test_large_message_fragmentation_round_trip() {
        let mut pair = new_pair();
        pair.establish();

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i * 7 + i / 251) as u8).collect();
        let mut message = pair.client_conn.start_new_message(20, payload.len()).unwrap();
        message.payload_mut().extend_from_slice(&payload);
        message.reliable = true;
        pair.client_conn.end_and_queue(message).unwrap();

        pair.pump(40, Duration::from_millis(15));

        let received = pair.drain_server_payloads();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], payload, "reassembly must be bit-for-bit identical");
        assert_eq!(pair.client_conn.num_outbound_messages_pending(), 0);
    }

    #[test]
    fn test_fragmentation_survives_loss() {
        let mut pair = new_pair();
        pair.establish();

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 255) as u8).collect();
        let mut message = pair.client_conn.start_new_message(20, payload.len()).unwrap();
        message.payload_mut().extend_from_slice(&payload);
        message.reliable = true;
        pair.client_conn.end_and_queue(message).unwrap();

        // drop every second client datagram for a while, then run cleanly
        let mut transmissions = 0usize;
        for _ in 0..30 {
            pair.now += Duration::from_millis(40);
            pair.client.tick(pair.now);
            pair.server.tick(pair.now);
            for datagram in pair.client.drain_outgoing() {
                transmissions += 1;
                if transmissions % 2 == 0 {
                    continue;
                }
                pair.server.on_datagram(&datagram, pair.now);
            }
            for datagram in pair.server.drain_outgoing() {
                pair.client.on_datagram(&datagram, pair.now);
            }
        }
        pair.pump(60, Duration::from_millis(50));

        let received = pair.drain_server_payloads();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], payload);
    }

    #[test]
    fn test_unreliable_message_not_retransmitted() {
        let mut pair = new_pair();
        pair.establish();

        pair.queue_on_client(b"lossy", |m| m.reliable = false);
        pair.now += Duration::from_millis(5);
        pair.client.tick(pair.now);
        let lost = pair.client.drain_outgoing();
        assert!(!lost.is_empty());
        drop(lost); // never delivered

        // well past any timeout: nothing further may be sent for it
        pair.now += Duration::from_secs(1);
        pair.client.tick(pair.now);
        let followup = pair.client.drain_outgoing();
        assert!(followup.is_empty(), "unreliable messages must not be retransmitted");
        assert_eq!(pair.client_conn.num_outbound_messages_pending(), 0);
        assert_eq!(pair.server_received(), 0);
    }

    #[test]
    fn test_disconnect_closes_both_sides_cleanly() {
        let mut pair = new_pair();
        pair.establish();

        pair.queue_on_client(b"last words", |m| m.reliable = true);
        pair.pump(3, Duration::from_millis(15));

        pair.client_conn.disconnect();
        pair.pump(10, Duration::from_millis(50));

        assert_eq!(pair.client_conn.connection_state(), ConnectionState::Closed);
        assert_eq!(pair.server_conn.connection_state(), ConnectionState::Closed);
        assert_eq!(pair.client_conn.close_reason(), None, "local disconnect is clean");
        assert_eq!(pair.server_conn.close_reason(), Some(ErrorKind::PeerDisconnected));
        assert_eq!(pair.drain_server_payloads(), vec![b"last words".to_vec()]);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut pair = new_pair();
        pair.establish();

        pair.client_conn.disconnect();
        pair.client_conn.disconnect();
        pair.pump(10, Duration::from_millis(50));

        assert_eq!(pair.client_conn.connection_state(), ConnectionState::Closed);
        assert!(pair.client_conn.start_new_message(191, 0).is_err());
    }

    #[test]
    fn test_total_blackout_reports_peer_unreachable() {
        let mut config = test_config();
        config.max_retries = 3;
        let mut pair = new_pair_with(config);
        pair.establish();

        pair.queue_on_client(b"into the void", |m| m.reliable = true);

        for _ in 0..20 {
            pair.now += Duration::from_secs(1);
            pair.client.tick(pair.now);
            pair.client.drain_outgoing(); // blackout: nothing reaches the peer
            if pair.client_conn.connection_state() == ConnectionState::Closed {
                break;
            }
        }

        assert_eq!(pair.client_conn.connection_state(), ConnectionState::Closed);
        assert_eq!(pair.client_conn.close_reason(), Some(ErrorKind::PeerUnreachable));
        assert_eq!(pair.client_conn.num_outbound_messages_pending(), 0);
        assert!(pair.client_conn.stats().dropped_messages >= 1);
    }

    #[test]
    fn test_stale_message_dropped_not_sent() {
        let mut pair = new_pair();
        pair.establish();

        let mut message = pair.client_conn.start_new_message(191, 4).unwrap();
        message.payload_mut().extend_from_slice(b"old");
        message.reliable = true;
        message.send_deadline = Some(pair.now + Duration::from_millis(1));
        pair.client_conn.end_and_queue(message).unwrap();

        pair.pump(3, Duration::from_millis(100));

        assert_eq!(pair.server_received(), 0);
        assert_eq!(pair.client_conn.num_outbound_messages_pending(), 0);
        assert_eq!(pair.client_conn.stats().dropped_messages, 1);
    }

    #[test]
    fn test_message_too_large_rejected_synchronously() {
        let pair = new_pair();
        let mut message = pair.client_conn.start_new_message(191, 0).unwrap();
        message.payload_mut().resize(17 * 1024 * 1024, 0);
        let error = pair.client_conn.end_and_queue(message).unwrap_err();
        assert_eq!(
            error.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::MessageTooLargeAfterFragment)
        );
    }

    #[test]
    fn test_reserved_message_ids_rejected() {
        let pair = new_pair();
        // everything below 8 is engine territory, including 0
        for id in 0..=7u32 {
            assert!(pair.client_conn.start_new_message(id, 0).is_err(), "id {} must be rejected", id);
        }
        assert!(pair.client_conn.start_new_message(8, 0).is_ok());
    }

    #[test]
    fn test_display() {
        let pair = new_pair();
        assert_eq!(format!("{}", pair.client_conn), "udp 127.0.0.1:2222 (pending)");
    }

    #[test]
    fn test_process_dispatches_to_handler() {
        let config = test_config();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let (connection, mut wiring) =
            create_connection(&config, peer, "udp", Arc::new(Notify::new()));

        wiring.events_tx.insert(ConnectionEvent::Message {
            packet_seq: PacketSeq::from_raw(3),
            message_id: 191,
            payload: vec![1, 2, 3],
        });

        let mut handler = MockMessageHandler::new();
        handler.expect_compute_content_id().return_const(0u32);
        handler
            .expect_handle_message()
            .withf(|_, packet_seq, message_id, payload| {
                *packet_seq == PacketSeq::from_raw(3) && *message_id == 191 && payload == [1, 2, 3]
            })
            .times(1)
            .return_const(());

        connection.register_inbound_handler(Arc::new(handler));
        connection.process();
    }

    #[test]
    fn test_process_coalesces_inbound_by_content_id() {
        let config = test_config();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let (connection, mut wiring) =
            create_connection(&config, peer, "udp", Arc::new(Notify::new()));

        for payload in [vec![1u8], vec![2u8]] {
            wiring.events_tx.insert(ConnectionEvent::Message {
                packet_seq: PacketSeq::ZERO,
                message_id: 191,
                payload,
            });
        }

        let mut handler = MockMessageHandler::new();
        handler.expect_compute_content_id().return_const(7u32);
        handler
            .expect_handle_message()
            .withf(|_, _, _, payload| payload == [2u8])
            .times(1)
            .return_const(());

        connection.register_inbound_handler(Arc::new(handler));
        connection.process();
    }
}
