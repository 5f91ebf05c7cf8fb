//! Sender-side message scheduling: a priority queue with content-id coalescing, an
//!  ordering stamp per in-order chain, a head-of-line requeue bucket for retransmitted
//!  messages, and the stale-message drop.

use crate::message::Message;
use crate::message_frame::OrderingInfo;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;
use tracing::trace;

/// Heap key: highest priority first, oldest creation time breaking ties, insertion
///  counter as the final tie-break so equal messages stay FIFO.
struct HeapEntry {
    priority: u32,
    creation_time: Instant,
    insertion: u64,
    slot: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.insertion == other.insertion
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.creation_time.cmp(&self.creation_time))
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

/// What `pop_next` found.
pub enum Popped {
    /// Ready to serialize; ordering stamp already applied.
    Ready(Message),
    /// Send deadline passed at the moment of selection; not sent. The caller reports
    ///  reliable ones through the outbound-result path.
    Stale(Message),
}

pub struct OutboundScheduler {
    heap: BinaryHeap<HeapEntry>,
    pending: FxHashMap<u64, Message>,
    next_slot: u64,
    insertion_counter: u64,
    /// content id -> slot of the queued message currently representing it
    by_content: FxHashMap<u32, u64>,
    /// retransmitted messages; drained before the heap
    resend: VecDeque<Message>,
    /// next ordering index per chain, starting at 1
    chain_next_index: FxHashMap<u32, u32>,
    /// index of the most recent reliable in-order message per chain; stamped onto
    ///  every in-order frame so the receiver knows which holes can be waited out
    chain_last_reliable: FxHashMap<u32, u32>,
}

impl OutboundScheduler {
    pub fn new() -> OutboundScheduler {
        OutboundScheduler {
            heap: BinaryHeap::new(),
            pending: FxHashMap::default(),
            next_slot: 0,
            insertion_counter: 0,
            by_content: FxHashMap::default(),
            resend: VecDeque::new(),
            chain_next_index: FxHashMap::default(),
            chain_last_reliable: FxHashMap::default(),
        }
    }

    /// Number of messages waiting to be serialized (not counting sent-not-acked).
    pub fn len(&self) -> usize {
        self.pending.len() + self.resend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.resend.is_empty()
    }

    /// Enqueue a new application message. Returns `true` if it coalesced into an
    ///  already-queued message with the same content id (net queue length unchanged).
    pub fn queue(&mut self, message: Message) -> bool {
        if message.content_id != 0 {
            if let Some(&slot) = self.by_content.get(&message.content_id) {
                if let Some(existing) = self.pending.get_mut(&slot) {
                    trace!("coalescing message with content id {}", message.content_id);
                    // replaced in place: the heap position from the first enqueue is
                    //  kept, the content is the newer message's
                    existing.coalesce_from(message);
                    return true;
                }
            }
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        if message.content_id != 0 {
            self.by_content.insert(message.content_id, slot);
        }

        self.heap.push(HeapEntry {
            priority: message.priority,
            creation_time: message.creation_time,
            insertion: self.insertion_counter,
            slot,
        });
        self.insertion_counter += 1;
        self.pending.insert(slot, message);
        false
    }

    /// Put retransmitted messages back at the head; they go out before anything from
    ///  the priority queue.
    pub fn requeue_front(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.resend.push_back(message);
        }
    }

    /// Take the next message to serialize. Ordering stamps are assigned here, only to
    ///  messages that will actually be sent, so a dropped stale message never leaves a
    ///  hole in its chain.
    pub fn pop_next(&mut self, now: Instant) -> Option<Popped> {
        if let Some(message) = self.resend.pop_front() {
            // requeued messages are already stamped; the deadline still applies
            if Self::is_stale(&message, now) {
                return Some(Popped::Stale(message));
            }
            return Some(Popped::Ready(message));
        }

        let entry = self.heap.pop()?;
        let mut message = match self.pending.remove(&entry.slot) {
            Some(message) => message,
            // slot already consumed through coalescing bookkeeping; skip
            None => return self.pop_next(now),
        };

        if message.content_id != 0 {
            if self.by_content.get(&message.content_id) == Some(&entry.slot) {
                self.by_content.remove(&message.content_id);
            }
        }

        if Self::is_stale(&message, now) {
            return Some(Popped::Stale(message));
        }

        if message.in_order && message.content_id != 0 {
            let chain_id = message.content_id;
            let next_index = self.chain_next_index.entry(chain_id).or_insert(1);
            let index = *next_index;
            *next_index += 1;

            message.ordering = Some(OrderingInfo {
                chain_id,
                index,
                reliable_barrier: self.chain_last_reliable.get(&chain_id).copied().unwrap_or(0),
            });
            if message.reliable {
                self.chain_last_reliable.insert(chain_id, index);
            }
        }

        Some(Popped::Ready(message))
    }

    /// Like `pop_next`, but only from the retransmission bucket. Used while
    ///  disconnecting: in-flight reliable data drains, new messages do not start.
    pub fn pop_retransmit(&mut self, now: Instant) -> Option<Popped> {
        let message = self.resend.pop_front()?;
        if Self::is_stale(&message, now) {
            return Some(Popped::Stale(message));
        }
        Some(Popped::Ready(message))
    }

    /// Remove every message that was never handed to the wire path, leaving the
    ///  retransmission bucket alone. Used when a disconnect begins.
    pub fn drain_unsent(&mut self) -> Vec<Message> {
        let mut result = Vec::new();
        while let Some(entry) = self.heap.pop() {
            if let Some(message) = self.pending.remove(&entry.slot) {
                result.push(message);
            }
        }
        self.pending.clear();
        self.by_content.clear();
        result
    }

    /// Remove everything; used at teardown so every queued message can be reported.
    pub fn drain_all(&mut self) -> Vec<Message> {
        let mut result: Vec<Message> = self.resend.drain(..).collect();
        // drain in heap order so reporting stays deterministic
        while let Some(entry) = self.heap.pop() {
            if let Some(message) = self.pending.remove(&entry.slot) {
                result.push(message);
            }
        }
        self.pending.clear();
        self.by_content.clear();
        result
    }

    fn is_stale(message: &Message, now: Instant) -> bool {
        matches!(message.send_deadline, Some(deadline) if now >= deadline)
    }
}
