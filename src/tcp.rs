//! The stream-transport path. Over TCP the sequencing, acknowledgement and
//!  retransmission machinery is redundant: each message frame is preceded by a 2-byte
//!  big-endian length and the transport guarantees ordering and reliability. Priority
//!  scheduling, content-id coalescing and the in-order chain stamps still apply, so
//!  application behavior is identical in both modes.

use crate::config::TransportConfig;
use crate::connection::{
    ConnectionEvent, ConnectionShared, ConnectionState, ConnectionWiring, OutboundConsumer,
};
use crate::control::{MSG_ID_DISCONNECT, MSG_ID_DISCONNECT_ACK};
use crate::error::ErrorKind;
use crate::inbound::{InboundDispatch, InboundPipeline};
use crate::message_frame::{is_control_id, FrameInfo, MessageFrame};
use crate::scheduler::{OutboundScheduler, Popped};
use crate::seq::PacketSeq;
use crate::wait_free_queue::growable_ring::GrowProducer;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Frame bodies are length-prefixed with a u16, which bounds a single message in
///  stream mode.
pub const MAX_TCP_FRAME_BODY: usize = u16::MAX as usize;

const READ_CHUNK: usize = 16 * 1024;

pub(crate) struct TcpCore {
    shared: Arc<ConnectionShared>,
    outbound_rx: OutboundConsumer,
    events_tx: GrowProducer<ConnectionEvent>,
    stream: TcpStream,
    state: ConnectionState,

    scheduler: OutboundScheduler,
    pipeline: InboundPipeline,

    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,

    disconnect_grace: std::time::Duration,
    local_disconnect: bool,
    disconnect_frame_written: bool,
    disconnect_started: Option<Instant>,
    closed_at: Option<Instant>,
    closed_reported: bool,

    dispatch_scratch: Vec<InboundDispatch>,
}

impl TcpCore {
    /// Both roles: the transport connection *is* the handshake, so the engine starts
    ///  out established.
    pub(crate) fn new(
        config: &TransportConfig,
        wiring: ConnectionWiring,
        stream: TcpStream,
    ) -> TcpCore {
        wiring.shared.set_state(ConnectionState::Ok, None);
        info!("stream connection with {} established", wiring.shared.peer());

        TcpCore {
            shared: wiring.shared,
            outbound_rx: wiring.outbound_rx,
            events_tx: wiring.events_tx,
            stream,
            state: ConnectionState::Ok,
            scheduler: OutboundScheduler::new(),
            pipeline: InboundPipeline::new(config.max_rto * 2, config.chain_reclaim_after),
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            disconnect_grace: config.disconnect_grace,
            local_disconnect: false,
            disconnect_frame_written: false,
            disconnect_started: None,
            closed_at: None,
            closed_reported: false,
            dispatch_scratch: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn peer(&self) -> std::net::SocketAddr {
        self.shared.peer()
    }

    pub(crate) fn is_reapable(&self, _now: Instant) -> bool {
        self.closed_at.is_some()
    }

    pub(crate) fn take_closed_event(&mut self) -> Option<Option<ErrorKind>> {
        if self.state == ConnectionState::Closed && !self.closed_reported {
            self.closed_reported = true;
            return Some(if self.local_disconnect { None } else { self.shared.close_reason() });
        }
        None
    }

    pub(crate) fn begin_shutdown(&mut self, now: Instant) {
        if self.state == ConnectionState::Ok {
            self.local_disconnect = true;
            self.begin_disconnect(now);
        }
    }

    pub(crate) fn tick(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            self.drain_ring_dropping();
            return;
        }

        self.read_stream(now);
        if self.state == ConnectionState::Closed {
            return;
        }

        self.drain_outbound_ring();

        if self.shared.is_disconnect_requested() && self.state == ConnectionState::Ok {
            self.local_disconnect = true;
            self.begin_disconnect(now);
        }

        self.fill_write_buffer(now);
        self.flush_write_buffer(now);

        let mut dispatched = std::mem::take(&mut self.dispatch_scratch);
        self.pipeline.tick(now, &mut dispatched);
        self.push_dispatches(&mut dispatched);
        self.dispatch_scratch = dispatched;

        if self.state == ConnectionState::Disconnecting {
            let drained = self.disconnect_frame_written
                && self.scheduler.is_empty()
                && self.write_pos == self.write_buf.len();
            let grace_exceeded = match self.disconnect_started {
                Some(started) => now.duration_since(started) >= self.disconnect_grace,
                None => true,
            };
            if drained || grace_exceeded {
                self.close(if self.local_disconnect { None } else { Some(ErrorKind::PeerDisconnected) }, now);
            }
        }
    }

    fn begin_disconnect(&mut self, now: Instant) {
        info!("disconnecting stream connection with {}", self.peer());
        self.state = ConnectionState::Disconnecting;
        self.shared.set_state(ConnectionState::Disconnecting, None);
        self.disconnect_started = Some(now);
    }

    fn drain_outbound_ring(&mut self) {
        while let Some(message) = self.outbound_rx.pop() {
            match self.state {
                ConnectionState::Ok => {
                    if self.scheduler.queue(message) {
                        self.shared.note_coalesced();
                    }
                }
                _ => {
                    self.shared.note_dropped(message.counts_as_pending);
                    drop(message);
                }
            }
        }
    }

    fn drain_ring_dropping(&mut self) {
        while let Some(message) = self.outbound_rx.pop() {
            self.shared.note_dropped(message.counts_as_pending);
            drop(message);
        }
    }

    /// Serialize scheduled messages into the write buffer as length-prefixed frames.
    fn fill_write_buffer(&mut self, now: Instant) {
        // bound buffered-but-unwritten data; the stream exerts backpressure
        while self.write_buf.len() - self.write_pos < 256 * 1024 {
            let popped = match self.scheduler.pop_next(now) {
                Some(popped) => popped,
                None => break,
            };
            let message = match popped {
                Popped::Stale(message) => {
                    debug!("dropping stale message {} for {}", message.message_id(), self.peer());
                    self.shared.note_dropped(message.counts_as_pending);
                    continue;
                }
                Popped::Ready(message) => message,
            };

            let info = FrameInfo {
                message_id: message.message_id(),
                reliable_number: None,
                ordering: message.ordering,
                fragment: None,
            };
            let body_len = info.serialized_len(message.payload().len());
            if body_len > MAX_TCP_FRAME_BODY {
                warn!(
                    "message of {} bytes does not fit a stream frame for {}",
                    message.payload().len(),
                    self.peer()
                );
                self.shared.note_dropped(message.counts_as_pending);
                continue;
            }

            self.write_buf.extend_from_slice(&(body_len as u16).to_be_bytes());
            info.ser(message.payload(), &mut self.write_buf);
            self.shared.note_delivered(message.counts_as_pending);
            drop(message);
        }

        if self.state == ConnectionState::Disconnecting
            && self.scheduler.is_empty()
            && !self.disconnect_frame_written
        {
            self.disconnect_frame_written = true;
            self.append_control_frame(MSG_ID_DISCONNECT);
        }
    }

    fn append_control_frame(&mut self, message_id: u32) {
        let info = FrameInfo::plain(message_id);
        let body_len = info.serialized_len(0);
        self.write_buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        info.ser(&[], &mut self.write_buf);
    }

    fn flush_write_buffer(&mut self, now: Instant) {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => {
                    self.close(Some(ErrorKind::PeerDisconnected), now);
                    return;
                }
                Ok(n) => {
                    trace!("wrote {} bytes to {}", n, self.peer());
                    self.write_pos += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("write error on stream to {}: {}", self.peer(), e);
                    self.close(Some(ErrorKind::PeerDisconnected), now);
                    return;
                }
            }
        }

        if self.write_pos == self.write_buf.len() {
            self.write_buf.clear();
            self.write_pos = 0;
        } else if self.write_pos > 64 * 1024 {
            self.write_buf.drain(..self.write_pos);
            self.write_pos = 0;
        }
    }

    fn read_stream(&mut self, now: Instant) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("{} closed the stream", self.peer());
                    let reason = if self.local_disconnect { None } else { Some(ErrorKind::PeerDisconnected) };
                    self.close(reason, now);
                    return;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read error on stream from {}: {}", self.peer(), e);
                    self.close(Some(ErrorKind::PeerDisconnected), now);
                    return;
                }
            }
        }

        self.parse_frames(now);
    }

    fn parse_frames(&mut self, now: Instant) {
        let mut offset = 0usize;
        while self.read_buf.len() - offset >= 2 {
            let body_len =
                u16::from_be_bytes([self.read_buf[offset], self.read_buf[offset + 1]]) as usize;
            if self.read_buf.len() - offset - 2 < body_len {
                break;
            }

            let body = &self.read_buf[offset + 2..offset + 2 + body_len];
            let mut read = body;
            match MessageFrame::deser(&mut read) {
                Ok(frame) if read.is_empty() => {
                    offset += 2 + body_len;
                    self.handle_frame(frame, now);
                    if self.state == ConnectionState::Closed {
                        break;
                    }
                }
                _ => {
                    // a malformed frame means the stream is desynchronized; there is
                    //  no resynchronization point to skip to
                    warn!("malformed stream frame from {}; closing", self.peer());
                    self.close(Some(ErrorKind::MalformedPacket), now);
                    break;
                }
            }
        }
        self.read_buf.drain(..offset);
    }

    fn handle_frame(&mut self, frame: MessageFrame, now: Instant) {
        if is_control_id(frame.info.message_id) {
            match frame.info.message_id {
                MSG_ID_DISCONNECT => {
                    info!("{} disconnected", self.peer());
                    self.append_control_frame(MSG_ID_DISCONNECT_ACK);
                    self.flush_write_buffer(now);
                    let reason =
                        if self.local_disconnect { None } else { Some(ErrorKind::PeerDisconnected) };
                    self.close(reason, now);
                }
                MSG_ID_DISCONNECT_ACK => {
                    if self.state == ConnectionState::Disconnecting {
                        self.close(None, now);
                    }
                }
                _ => trace!("ignoring control frame {} on stream", frame.info.message_id),
            }
            return;
        }

        let mut dispatched = std::mem::take(&mut self.dispatch_scratch);
        self.pipeline.on_message(
            PacketSeq::ZERO,
            frame.info.message_id,
            frame.info.ordering,
            frame.payload,
            now,
            &mut dispatched,
        );
        self.push_dispatches(&mut dispatched);
        self.dispatch_scratch = dispatched;
    }

    fn push_dispatches(&mut self, dispatched: &mut Vec<InboundDispatch>) {
        for dispatch in dispatched.drain(..) {
            self.shared.note_received();
            self.events_tx.insert(ConnectionEvent::Message {
                packet_seq: dispatch.packet_seq,
                message_id: dispatch.message_id,
                payload: dispatch.payload,
            });
        }
    }

    fn close(&mut self, reason: Option<ErrorKind>, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }

        for message in self.scheduler.drain_all() {
            self.shared.note_dropped(message.counts_as_pending);
            drop(message);
        }
        self.drain_ring_dropping();

        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.state = ConnectionState::Closed;
        self.shared.set_state(ConnectionState::Closed, reason);
        self.closed_at = Some(now);
    }
}
