use crate::connection::MessageConnection;
use crate::error::ErrorKind;
use crate::seq::PacketSeq;
#[cfg(test)]
use mockall::automock;

/// Receives inbound application messages. Invoked on the application thread from
///  [`MessageConnection::process`], never on the network worker.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(
        &self,
        source: &MessageConnection,
        packet_seq: PacketSeq,
        message_id: u32,
        payload: &[u8],
    );

    /// Optional content-id derivation for *inbound* coalescing: messages still queued
    ///  for dispatch with the same non-zero content id are replaced by the newest one.
    ///  The default of 0 disables coalescing.
    fn compute_content_id(&self, message_id: u32, payload: &[u8]) -> u32 {
        let _ = (message_id, payload);
        0
    }
}

/// Host-level server callbacks, invoked on the application thread from
///  [`NetworkHost::process`](crate::NetworkHost::process).
#[cfg_attr(test, automock)]
pub trait ServerListener: Send + Sync + 'static {
    /// A new connection completed its handshake far enough to be usable. The listener
    ///  typically registers a message handler and keeps the (cheaply cloneable)
    ///  connection handle.
    fn new_connection_established(&self, connection: MessageConnection);

    /// A connection left the registry; `reason` is `None` for a locally initiated
    ///  clean shutdown.
    fn connection_closed(&self, connection: MessageConnection, reason: Option<ErrorKind>);
}
