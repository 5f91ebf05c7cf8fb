//! `msglink` turns a raw datagram (or stream) transport into a reliable, in-order,
//!  priority-scheduled, content-deduplicated stream of application messages.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes), each with a small application-level type tag
//! * Per-message delivery contract: a message is either reliable (retransmitted until
//!   acknowledged, delivered exactly once) or unreliable (delivered zero or one times,
//!   never duplicated)
//! * Per-message priority: higher-priority messages are serialized onto the wire first,
//!   with enqueue time as the tie-break so equal priorities stay fair
//! * In-order delivery is opt-in and scoped to a *chain* (keyed by content id) rather than
//!   global, so a stalled chain never delays unrelated traffic
//! * Content-id coalescing: a queued-but-unsent message is replaced in place by a newer
//!   message with the same non-zero content id. High-frequency state updates collapse
//!   naturally to the freshest value
//! * Big messages are sent without IP-level fragmentation - the protocol takes care of
//!   chunking, buffering and re-assembling (configured maximum datagram payload, since
//!   path MTU discovery does not work reliably)
//! * Congestion control and pacing in the TCP mold (slow start / congestion avoidance,
//!   RTT-derived retransmission timeouts), so a message burst does not melt the path
//! * The application thread never blocks inside the engine and never shares a lock with
//!   the network worker on the data plane: hand-off happens through wait-free
//!   single-producer/single-consumer rings in each direction
//!
//! ## Datagram layout (UDP mode)
//!
//! All fixed-width numbers are little-endian; var-ints use 7-bit continuation encoding.
//!
//! ```ascii
//! 0: header (u16):
//!    * bits 0-13: datagram sequence number (wrap-around, serial arithmetic)
//!    * bit 14:    ack section present
//!    * bit 15:    at least one reliable frame present
//! 2: ack section (present iff bit 14):
//!    * cumulative sequence (u16): every sequence up to and including this one was received
//!    * forward bitfield (u32): bit i set => sequence `cumulative + i + 1` was received
//! *: message frames until the end of the datagram
//! ```
//!
//! Message frame:
//!
//! ```ascii
//! 0: flags (u8): bit 0 => fragment info present
//! 1: message id (var-int) - values below 8 are reserved for the engine; 1..7
//!    carry control frames
//! *: reliable message number (var-int) - 0 for unreliable frames
//! *: in-order chain id (var-int) - 0 if the frame is not ordered
//! *: ordering index (var-int) - present iff chain id != 0, starts at 1 per chain
//! *: reliable barrier (var-int) - present iff chain id != 0; the chain index of
//!    the last reliable in-order message before this one, 0 if none. The receiver
//!    may give up on a chain hole only when this proves the hole unreliable
//! *: fragment info (present iff flags bit 0):
//!    * fragment transfer id (var-int, u16)
//!    * total fragment count (var-int)
//!    * fragment index (var-int, 0-based)
//! *: payload length (var-int), then payload bytes
//! ```
//!
//! Control frames (reserved message ids): 1 = Connect, 2 = ConnectAck, 3 = Disconnect,
//!  4 = DisconnectAck, 5 = Ping, 6 = Pong, 7 = FlowControl.
//!
//! ## TCP mode
//!
//! Over a stream transport the sequencing and acknowledgement machinery is redundant:
//!  each message frame is preceded by a 2-byte big-endian length, and the transport
//!  guarantees ordering and reliability. Priority scheduling and content-id coalescing
//!  still apply on the sender.
//!
//! ## Threads
//!
//! One network worker per [`host::NetworkHost`] services all sockets cooperatively; it
//!  suspends only in a bounded readiness wait (default 5 ms) and never holds a lock
//!  across it. Application threads enqueue messages and pump
//!  [`connection::MessageConnection::process`], which drains the inbound ring and runs
//!  the registered [`handler::MessageHandler`] on the application thread.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod control;
pub mod error;
pub mod fragment;
pub mod handler;
pub mod host;
pub mod inbound;
pub mod message;
pub mod message_frame;
pub mod packet_header;
pub mod receive_window;
pub mod scheduler;
pub mod send_pipeline;
pub mod seq;
pub mod serial;
pub mod simulator;
pub mod tcp;
pub mod wait_free_queue;

pub use config::TransportConfig;
pub use connection::{ConnectionState, MessageConnection};
pub use error::ErrorKind;
pub use handler::{MessageHandler, ServerListener};
pub use host::{NetworkHost, TransportMode};
pub use message::Message;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
