use anyhow::bail;
use std::time::Duration;

/// What `end_and_queue` does when the application-to-worker ring has no room.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Report `OutboundQueueFull` and leave the message with the caller.
    Fail,
    /// Chain a fresh ring of twice the capacity onto the full one. The producer moves
    ///  to the new ring permanently, so FIFO order is preserved without locking.
    Grow,
    /// Yield and retry until the worker has drained room. Intended for tools and test
    ///  harnesses; a latency-sensitive application should prefer `Fail` or `Grow`.
    Block,
}

/// Tunables for a host and its connections.
pub struct TransportConfig {
    /// Maximum UDP payload the engine will produce. The default of 1400 stays under a
    ///  full Ethernet frame with some slack for tunneling headers, because path MTU
    ///  discovery does not work reliably and an IP-fragmented datagram is lost as a
    ///  whole if any fragment is.
    ///
    /// Choosing this too big causes datagrams to be dropped by the path; choosing it
    ///  too small wastes bandwidth on per-datagram overhead.
    pub max_datagram_payload: usize,

    /// How long received data may wait for a piggy-back opportunity before a dedicated
    ///  ack-only datagram is emitted.
    pub ack_delay: Duration,

    /// A reliable message whose retry count exceeds this tears the connection down
    ///  with `PeerUnreachable`.
    pub max_retries: u32,

    /// Partial fragment sets older than this are discarded on the receiver.
    pub fragment_timeout: Duration,

    /// No `ConnectAck` within this window fails the connection attempt.
    pub handshake_timeout: Duration,

    /// Interval between handshake (re)transmissions while `Pending`.
    pub handshake_resend_interval: Duration,

    /// After `disconnect`, in-flight reliable messages are drained for at most this
    ///  long before the connection reaches `Closed` regardless.
    pub disconnect_grace: Duration,

    /// Upper bound on the worker's readiness wait. The worker wakes earlier when the
    ///  application enqueues work.
    pub worker_poll_interval: Duration,

    /// Capacity of the application-to-worker message ring (power of two; one slot is
    ///  reserved by the ring itself).
    pub outbound_ring_capacity: usize,

    /// Capacity of the worker-to-application event ring. This ring always grows on
    ///  overflow - delivered reliable messages must not be dropped between the worker
    ///  and the application.
    pub inbound_ring_capacity: usize,

    /// Policy for a full outbound ring, see [`OverflowPolicy`].
    pub overflow_policy: OverflowPolicy,

    /// Number of payload buffers kept pooled per connection; buffers beyond this are
    ///  released to the allocator when returned.
    pub message_pool_size: usize,

    /// Hard upper bound for a single message after serialization. Messages above this
    ///  are rejected with `MessageTooLargeAfterFragment`.
    pub max_message_size: u32,

    /// An idle connection sends a `Ping` at this interval to keep RTT fresh and to
    ///  detect a silently dead peer.
    pub keepalive_interval: Duration,

    /// In-order chain state on the receiver is reclaimed after this much inactivity.
    pub chain_reclaim_after: Duration,

    /// Sustained malformed-packet rate (per second, averaged over
    ///  `malformed_rate_window`) above which the connection is torn down.
    pub malformed_rate_limit: f64,
    pub malformed_rate_window: Duration,

    /// If set, advertised to the peer in a `FlowControl` frame as an upper bound on
    ///  the datagram rate it may send us.
    pub inbound_rate_limit: Option<u32>,

    /// Bounds for the retransmission timeout derived from the RTT estimate.
    pub min_rto: Duration,
    pub max_rto: Duration,

    /// RTT estimate used before the first sample arrives.
    pub initial_rtt: Duration,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            max_datagram_payload: 1400,
            ack_delay: Duration::from_millis(10),
            max_retries: 60,
            fragment_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(5),
            handshake_resend_interval: Duration::from_millis(500),
            disconnect_grace: Duration::from_secs(5),
            worker_poll_interval: Duration::from_millis(5),
            outbound_ring_capacity: 1024,
            inbound_ring_capacity: 1024,
            overflow_policy: OverflowPolicy::Fail,
            message_pool_size: 256,
            max_message_size: 16 * 1024 * 1024,
            keepalive_interval: Duration::from_secs(2),
            chain_reclaim_after: Duration::from_secs(30),
            malformed_rate_limit: 1.0,
            malformed_rate_window: Duration::from_secs(10),
            inbound_rate_limit: None,
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(3),
            initial_rtt: Duration::from_millis(100),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_payload < 128 {
            bail!("maximum datagram payload of {} is too small to carry a header and a useful frame", self.max_datagram_payload);
        }
        if self.max_datagram_payload > 65000 {
            bail!("maximum datagram payload of {} does not fit a UDP datagram", self.max_datagram_payload);
        }
        if !self.outbound_ring_capacity.is_power_of_two() || self.outbound_ring_capacity < 4 {
            bail!("outbound ring capacity must be a power of two >= 4, was {}", self.outbound_ring_capacity);
        }
        if !self.inbound_ring_capacity.is_power_of_two() || self.inbound_ring_capacity < 4 {
            bail!("inbound ring capacity must be a power of two >= 4, was {}", self.inbound_ring_capacity);
        }
        if self.min_rto > self.max_rto {
            bail!("minimum retransmission timeout exceeds the maximum");
        }
        if self.malformed_rate_limit <= 0.0 {
            bail!("malformed packet rate limit must be positive");
        }
        Ok(())
    }
}
