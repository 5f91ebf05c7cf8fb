use crate::message_frame::{FragmentInfo, OrderingInfo};
use crate::seq::ReliableNumber;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::trace;

/// The atomic unit exchanged with the application.
///
/// Obtained from [`MessageConnection::start_new_message`](crate::MessageConnection::start_new_message),
///  filled in, then handed back through `end_and_queue`. The payload buffer comes from a
///  per-connection pool and returns there on every exit path - queueing, delivery,
///  deadline drop or plain `drop()`.
#[derive(Debug)]
pub struct Message {
    pub(crate) message_id: u32,
    pub(crate) payload: Vec<u8>,

    /// Higher priority is serialized onto the wire first.
    pub priority: u32,
    /// Retransmitted until acknowledged; delivered exactly once.
    pub reliable: bool,
    /// Delivery waits for all prior in-order messages on the same content-id chain.
    pub in_order: bool,
    /// Non-zero id used for coalescing and ordering; 0 means no coalescing.
    pub content_id: u32,
    /// A reliable message not yet sent by this time is dropped and reported.
    pub send_deadline: Option<Instant>,

    pub(crate) creation_time: Instant,
    pub(crate) reliable_number: Option<ReliableNumber>,
    pub(crate) ordering: Option<OrderingInfo>,
    pub(crate) fragment: Option<FragmentInfo>,
    pub(crate) retry_count: u32,
    /// Whether this message represents one unit in `num_outbound_messages_pending`.
    ///  Control frames and all but the last fragment of a split message do not.
    pub(crate) counts_as_pending: bool,

    pool: Option<Arc<MessagePool>>,
}

impl Message {
    pub(crate) fn new(message_id: u32, payload: Vec<u8>, pool: Arc<MessagePool>) -> Message {
        Message {
            message_id,
            payload,
            priority: 0,
            reliable: false,
            in_order: false,
            content_id: 0,
            send_deadline: None,
            creation_time: Instant::now(),
            reliable_number: None,
            ordering: None,
            fragment: None,
            retry_count: 0,
            counts_as_pending: true,
            pool: Some(pool),
        }
    }

    /// Engine-internal message (control frame or fragment); no pool, not counted as
    ///  application-pending.
    pub(crate) fn internal(message_id: u32, payload: Vec<u8>, reliable: bool, priority: u32) -> Message {
        Message {
            message_id,
            payload,
            priority,
            reliable,
            in_order: false,
            content_id: 0,
            send_deadline: None,
            creation_time: Instant::now(),
            reliable_number: None,
            ordering: None,
            fragment: None,
            retry_count: 0,
            counts_as_pending: false,
            pool: None,
        }
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Writable payload buffer; append the serialized message content here.
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Detach the payload, returning an empty message shell to the pool on drop.
    pub(crate) fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    /// Replace payload and freshness in place; used by content-id coalescing.
    pub(crate) fn coalesce_from(&mut self, mut newer: Message) {
        std::mem::swap(&mut self.payload, &mut newer.payload);
        self.message_id = newer.message_id;
        self.priority = newer.priority;
        self.reliable = newer.reliable;
        self.in_order = newer.in_order;
        self.send_deadline = newer.send_deadline;
        self.creation_time = newer.creation_time;
        // `newer` now holds the stale payload and returns it to the pool on drop
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            if self.payload.capacity() == 0 {
                // payload was taken, nothing to return
                return;
            }
            pool.return_buffer(std::mem::take(&mut self.payload));
        }
    }
}

/// Pool of payload buffers, shared between the application side (allocation) and the
///  worker side (release after serialization or delivery). Buffers beyond the pooled
///  maximum are handed back to the allocator.
#[derive(Debug)]
pub struct MessagePool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl MessagePool {
    pub fn new(max_pooled: usize) -> Arc<MessagePool> {
        Arc::new(MessagePool {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
        })
    }

    pub fn get_buffer(&self, size_hint: usize) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap();
        if let Some(mut buffer) = buffers.pop() {
            trace!("reusing pooled payload buffer");
            buffer.reserve(size_hint);
            return buffer;
        }
        drop(buffers);
        Vec::with_capacity(size_hint)
    }

    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }

    #[cfg(test)]
    pub fn pooled_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
