//! Shared plumbing for the loopback integration tests.
#![allow(dead_code)] // each test target uses a different subset

use msglink::seq::PacketSeq;
use msglink::{
    ErrorKind, Message, MessageConnection, MessageHandler, ServerListener, TransportConfig,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const TEST_MESSAGE_ID: u32 = 191;

/// A config tuned so failure paths resolve in test time rather than wall-clock
///  minutes.
pub fn test_config() -> TransportConfig {
    TransportConfig {
        disconnect_grace: Duration::from_secs(2),
        ..TransportConfig::default()
    }
}

/// Grab an OS-assigned port. The socket is dropped before use, which is racy in
///  principle but reliable enough on a loopback test host.
pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("binding probe socket");
    socket.local_addr().expect("probe socket address").port()
}

pub fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("binding probe listener");
    listener.local_addr().expect("probe listener address").port()
}

/// Records every inbound message.
pub struct RecordingHandler {
    pub messages: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler { messages: Mutex::new(Vec::new()) })
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl MessageHandler for RecordingHandler {
    fn handle_message(
        &self,
        _source: &MessageConnection,
        _packet_seq: PacketSeq,
        message_id: u32,
        payload: &[u8],
    ) {
        self.messages.lock().unwrap().push((message_id, payload.to_vec()));
    }
}

type HandlerFactory = Box<dyn Fn(&MessageConnection) -> Arc<dyn MessageHandler> + Send + Sync>;

/// Server listener that attaches a fresh handler to every accepted connection.
pub struct Acceptor {
    pub connections: Mutex<Vec<MessageConnection>>,
    pub closed: Mutex<Vec<(std::net::SocketAddr, Option<ErrorKind>)>>,
    make_handler: HandlerFactory,
}

impl Acceptor {
    pub fn new(make_handler: HandlerFactory) -> Arc<Acceptor> {
        Arc::new(Acceptor {
            connections: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            make_handler,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn process_all(&self) {
        for connection in self.connections.lock().unwrap().iter() {
            connection.process();
        }
    }
}

impl ServerListener for Acceptor {
    fn new_connection_established(&self, connection: MessageConnection) {
        let handler = (self.make_handler)(&connection);
        connection.register_inbound_handler(handler);
        self.connections.lock().unwrap().push(connection);
    }

    fn connection_closed(&self, connection: MessageConnection, reason: Option<ErrorKind>) {
        self.closed.lock().unwrap().push((connection.peer_addr(), reason));
    }
}

pub fn counter_message(
    connection: &MessageConnection,
    value: u32,
    tag: u32,
) -> anyhow::Result<Message> {
    let mut message = connection.start_new_message(TEST_MESSAGE_ID, 8)?;
    message.priority = 100;
    message.reliable = true;
    message.in_order = true;
    message.content_id = 1;
    message.payload_mut().extend_from_slice(&tag.to_le_bytes());
    message.payload_mut().extend_from_slice(&value.to_le_bytes());
    Ok(message)
}

pub fn parse_counter(payload: &[u8]) -> (u32, u32) {
    assert_eq!(payload.len(), 8, "counter payload must be tag + value");
    (
        u32::from_le_bytes(payload[..4].try_into().unwrap()),
        u32::from_le_bytes(payload[4..].try_into().unwrap()),
    )
}

/// Asserts the counter stream is strictly increasing and reaches `expected_final`.
pub fn assert_monotonic(payloads: &[Vec<u8>], expected_tag: u32, expected_final: u32) {
    assert!(!payloads.is_empty(), "no messages arrived");
    let mut previous = 0u32;
    for payload in payloads {
        let (tag, value) = parse_counter(payload);
        assert_eq!(tag, expected_tag, "message from the wrong sender in this handler");
        assert!(value > previous, "out of order: got {} after {}", value, previous);
        previous = value;
    }
    assert_eq!(previous, expected_final, "the final counter must arrive");
}

/// Polls `condition` while pumping `pump` until it holds or the deadline passes.
pub fn wait_for(timeout: Duration, mut pump: impl FnMut(), mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        pump();
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}
