use std::fmt::{Display, Formatter};

/// Error kinds surfaced to the application.
///
/// The network worker never propagates errors across the application boundary directly:
///  fatal failures become a state transition to `Closed` with one of these attached, and
///  the application observes the reason on its next pump. Control-plane operations
///  (`start_new_message`, `end_and_queue`, `connect`) report kinds synchronously.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The remote endpoint actively refused the connection attempt.
    ConnectionRefused,
    /// No `ConnectAck` arrived within the configured handshake timeout.
    HandshakeTimeout,
    /// A reliable message exhausted its retries without being acknowledged.
    PeerUnreachable,
    /// The peer performed a clean shutdown.
    PeerDisconnected,
    /// The sustained rate of unparsable packets exceeded the configured threshold.
    MalformedPacket,
    /// The application-to-worker ring had no room for another message.
    OutboundQueueFull,
    /// The serialized message exceeds the configured maximum even after fragmenting.
    MessageTooLargeAfterFragment,
    /// The operation was attempted on a connection that is shutting down or closed.
    ConnectionClosed,
}

impl ErrorKind {
    /// Stable code used to publish the reason through an atomic state snapshot.
    pub(crate) fn to_code(self) -> u8 {
        match self {
            ErrorKind::ConnectionRefused => 1,
            ErrorKind::HandshakeTimeout => 2,
            ErrorKind::PeerUnreachable => 3,
            ErrorKind::PeerDisconnected => 4,
            ErrorKind::MalformedPacket => 5,
            ErrorKind::OutboundQueueFull => 6,
            ErrorKind::MessageTooLargeAfterFragment => 7,
            ErrorKind::ConnectionClosed => 8,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<ErrorKind> {
        match code {
            1 => Some(ErrorKind::ConnectionRefused),
            2 => Some(ErrorKind::HandshakeTimeout),
            3 => Some(ErrorKind::PeerUnreachable),
            4 => Some(ErrorKind::PeerDisconnected),
            5 => Some(ErrorKind::MalformedPacket),
            6 => Some(ErrorKind::OutboundQueueFull),
            7 => Some(ErrorKind::MessageTooLargeAfterFragment),
            8 => Some(ErrorKind::ConnectionClosed),
            _ => None,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::ConnectionRefused => "connection refused by peer",
            ErrorKind::HandshakeTimeout => "handshake timed out",
            ErrorKind::PeerUnreachable => "peer unreachable (retries exhausted)",
            ErrorKind::PeerDisconnected => "peer disconnected",
            ErrorKind::MalformedPacket => "sustained rate of malformed packets",
            ErrorKind::OutboundQueueFull => "outbound queue full",
            ErrorKind::MessageTooLargeAfterFragment => "message too large after fragmenting",
            ErrorKind::ConnectionClosed => "connection closed",
        };
        write!(f, "{}", text)
    }
}

impl std::error::Error for ErrorKind {}
