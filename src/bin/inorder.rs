//! In-order transfer harness: a client floods the server with reliable, in-order
//!  counter messages through the send simulator (50 ms base delay, 100 ms jitter,
//!  10 % loss); the server verifies that the counters arrive strictly increasing.
//!
//! Usage:
//!   inorder server tcp|udp <port>
//!   inorder client tcp|udp <host> <port>

use msglink::simulator::SimulatorParams;
use msglink::{
    ConnectionState, ErrorKind, Message, MessageConnection, MessageHandler, NetworkHost,
    ServerListener, TransportConfig, TransportMode,
};
use std::net::{SocketAddr, ToSocketAddrs};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const COUNTER_MESSAGE_ID: u32 = 191;
const NUM_MESSAGES: u32 = 100_000;
const MAX_PENDING: usize = 1000;

struct OrderChecker {
    last_seen: AtomicU32,
}

impl MessageHandler for OrderChecker {
    fn handle_message(
        &self,
        source: &MessageConnection,
        _packet_seq: msglink::seq::PacketSeq,
        message_id: u32,
        payload: &[u8],
    ) {
        if message_id != COUNTER_MESSAGE_ID {
            return;
        }
        let Ok(bytes) = <[u8; 4]>::try_from(payload) else {
            warn!("counter message with {} byte payload from {}", payload.len(), source);
            return;
        };
        let received = u32::from_le_bytes(bytes);

        let previous = self.last_seen.swap(received, Ordering::Relaxed);
        if received <= previous {
            println!("Message received out-of-order! Got {}, previously received was {}", received, previous);
        } else {
            println!("Prev {}, now {}", previous, received);
        }
    }

    fn compute_content_id(&self, message_id: u32, _payload: &[u8]) -> u32 {
        if message_id == COUNTER_MESSAGE_ID {
            1
        } else {
            0
        }
    }
}

struct Acceptor {
    handler: Arc<OrderChecker>,
    connections: Mutex<Vec<MessageConnection>>,
}

impl ServerListener for Acceptor {
    fn new_connection_established(&self, connection: MessageConnection) {
        info!("new connection: {}", connection);
        connection.register_inbound_handler(self.handler.clone());
        self.connections.lock().unwrap().push(connection);
    }

    fn connection_closed(&self, connection: MessageConnection, reason: Option<ErrorKind>) {
        match reason {
            Some(reason) => info!("connection {} closed: {}", connection, reason),
            None => info!("connection {} closed", connection),
        }
        self.connections
            .lock()
            .unwrap()
            .retain(|c| c.peer_addr() != connection.peer_addr());
    }
}

fn run_server(mode: TransportMode, port: u16) -> anyhow::Result<()> {
    let host = NetworkHost::new(TransportConfig::default())?;
    let acceptor = Arc::new(Acceptor {
        handler: Arc::new(OrderChecker { last_seen: AtomicU32::new(0) }),
        connections: Mutex::new(Vec::new()),
    });
    host.start_server(port, mode, acceptor.clone())?;
    println!("Server waiting for connection in port {}.", port);

    loop {
        host.process();
        for connection in acceptor.connections.lock().unwrap().iter() {
            connection.process();
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn next_counter_message(connection: &MessageConnection, value: u32) -> anyhow::Result<Message> {
    let mut message = connection.start_new_message(COUNTER_MESSAGE_ID, 4)?;
    message.priority = 100;
    message.reliable = true;
    message.in_order = true;
    message.content_id = 1;
    message.payload_mut().extend_from_slice(&value.to_le_bytes());
    Ok(message)
}

fn run_client(mode: TransportMode, peer: SocketAddr) -> anyhow::Result<()> {
    let host = NetworkHost::new(TransportConfig::default())?;
    let connection = host.connect(peer, mode)?;
    connection.register_inbound_handler(Arc::new(OrderChecker { last_seen: AtomicU32::new(0) }));

    println!("Waiting for connection..");
    while connection.connection_state() == ConnectionState::Pending {
        std::thread::sleep(Duration::from_millis(100));
    }
    if connection.connection_state() != ConnectionState::Ok {
        anyhow::bail!(
            "failed to connect to server: {}",
            connection
                .close_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".into())
        );
    }
    println!("Connected to {}.", connection);

    connection.set_send_simulator(SimulatorParams {
        enabled: true,
        constant_packet_send_delay: Duration::from_millis(50),
        uniform_random_packet_send_delay: Duration::from_millis(100),
        packet_loss_rate: 0.1,
    });

    let mut sent = 0u32;
    while sent < NUM_MESSAGES {
        connection.process();
        if connection.connection_state() != ConnectionState::Ok {
            anyhow::bail!("connection lost while sending: {}", connection);
        }
        if connection.num_outbound_messages_pending() < MAX_PENDING {
            sent += 1;
            if let Err(e) = connection.end_and_queue(next_counter_message(&connection, sent)?) {
                // transiently full ring: retry this counter on the next loop turn
                warn!("queueing message {} failed: {:#}", sent, e);
                sent -= 1;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    info!("all {} messages queued; disconnecting", NUM_MESSAGES);
    connection.disconnect();
    let deadline = Instant::now() + Duration::from_secs(6);
    while connection.connection_state() != ConnectionState::Closed && Instant::now() < deadline {
        connection.process();
        std::thread::sleep(Duration::from_millis(10));
    }
    host.shutdown();
    Ok(())
}

fn print_usage() {
    println!("Usage: ");
    println!("       server tcp|udp port");
    println!("       client tcp|udp hostname port");
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let role = match args.get(1) {
        Some(role) => role.as_str(),
        None => {
            print_usage();
            return ExitCode::from(1);
        }
    };
    if role != "server" && role != "client" {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let Some(mode) = args.get(2).and_then(|m| m.parse::<TransportMode>().ok()) else {
        print_usage();
        return ExitCode::from(1);
    };

    let result = match role {
        "server" => {
            let Some(port) = args.get(3).and_then(|p| p.parse::<u16>().ok()) else {
                print_usage();
                return ExitCode::from(1);
            };
            run_server(mode, port)
        }
        _ => {
            let (Some(hostname), Some(port)) =
                (args.get(3), args.get(4).and_then(|p| p.parse::<u16>().ok()))
            else {
                print_usage();
                return ExitCode::from(1);
            };
            let Some(peer) = (hostname.as_str(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
            else {
                eprintln!("Unable to resolve {}:{}.", hostname, port);
                return ExitCode::from(2);
            };
            run_client(mode, peer)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
