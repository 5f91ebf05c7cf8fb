//! Receiver-side ordering and dispatch: the per-chain waiting room.
//!
//! Duplicate suppression (the reliable-number window) runs before frames get here,
//!  and fragment reassembly collapses oversized transfers into one logical message, so
//!  this stage only decides *when* a message may be handed to the application.
//!
//! Every chain is an independent ordering channel with a `next_expected` counter
//!  starting at 1. A frame at the expected index dispatches immediately and drains the
//!  waiting room behind it; higher indices park.
//!
//! A hole left by a lost unreliable message would stall the chain permanently, so a
//!  hole may be skipped after the gap timeout - but only when it provably contains no
//!  reliable message. Every in-order frame carries the chain index of the last
//!  reliable in-order message before it; a parked frame whose barrier reaches into
//!  the hole pins the chain until the missing reliable message is retransmitted into
//!  place (or the connection dies trying, which is reported, not silent).

use crate::message_frame::OrderingInfo;
use crate::seq::PacketSeq;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A message ready for the application-facing ring.
#[derive(Debug, PartialEq, Eq)]
pub struct InboundDispatch {
    pub packet_seq: PacketSeq,
    pub message_id: u32,
    pub payload: Vec<u8>,
}

struct ParkedFrame {
    packet_seq: PacketSeq,
    message_id: u32,
    /// chain index of the last reliable in-order message before this frame
    reliable_barrier: u32,
    payload: Vec<u8>,
}

struct ChainState {
    next_expected: u32,
    waiting: BTreeMap<u32, ParkedFrame>,
    last_activity: Instant,
    /// set while `next_expected` is missing but higher indices wait
    stalled_since: Option<Instant>,
}

pub struct InboundPipeline {
    chains: FxHashMap<u32, ChainState>,
    gap_timeout: Duration,
    reclaim_after: Duration,
}

impl InboundPipeline {
    pub fn new(gap_timeout: Duration, reclaim_after: Duration) -> InboundPipeline {
        InboundPipeline {
            chains: FxHashMap::default(),
            gap_timeout,
            reclaim_after,
        }
    }

    /// Route one deduplicated, reassembled message. Dispatchable messages (this one
    ///  and any it unblocks) are appended to `out` in delivery order.
    pub fn on_message(
        &mut self,
        packet_seq: PacketSeq,
        message_id: u32,
        ordering: Option<OrderingInfo>,
        payload: Vec<u8>,
        now: Instant,
        out: &mut Vec<InboundDispatch>,
    ) {
        let ordering = match ordering {
            None => {
                out.push(InboundDispatch { packet_seq, message_id, payload });
                return;
            }
            Some(ordering) => ordering,
        };

        let chain = self.chains.entry(ordering.chain_id).or_insert_with(|| ChainState {
            next_expected: 1,
            waiting: BTreeMap::new(),
            last_activity: now,
            stalled_since: None,
        });
        chain.last_activity = now;

        if ordering.index < chain.next_expected {
            // an index this chain already passed; a replay or a skipped-over
            //  unreliable message arriving after its hole was given up on
            trace!(
                "chain {}: dropping frame with passed index {} (next expected {})",
                ordering.chain_id, ordering.index, chain.next_expected
            );
            return;
        }

        if ordering.index == chain.next_expected {
            chain.next_expected += 1;
            out.push(InboundDispatch { packet_seq, message_id, payload });
            Self::drain_waiting(chain, now, out);
            return;
        }

        // park until the gap fills
        if chain.stalled_since.is_none() {
            chain.stalled_since = Some(now);
        }
        chain.waiting.entry(ordering.index).or_insert(ParkedFrame {
            packet_seq,
            message_id,
            reliable_barrier: ordering.reliable_barrier,
            payload,
        });
    }

    fn drain_waiting(chain: &mut ChainState, now: Instant, out: &mut Vec<InboundDispatch>) {
        while let Some(frame) = chain.waiting.remove(&chain.next_expected) {
            chain.next_expected += 1;
            out.push(InboundDispatch {
                packet_seq: frame.packet_seq,
                message_id: frame.message_id,
                payload: frame.payload,
            });
        }
        // any progress restarts the grace period for whatever hole remains
        chain.stalled_since = if chain.waiting.is_empty() { None } else { Some(now) };
    }

    /// Periodic maintenance: skip holes that outlived the gap timeout - and provably
    ///  hold no reliable message - and reclaim chains with no activity.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<InboundDispatch>) {
        for (chain_id, chain) in self.chains.iter_mut() {
            if let Some(stalled_since) = chain.stalled_since {
                if now.duration_since(stalled_since) >= self.gap_timeout {
                    let (&skip_to, first) = chain
                        .waiting
                        .first_key_value()
                        .expect("stalled chain has waiting frames");

                    if first.reliable_barrier >= chain.next_expected {
                        // the hole contains a reliable message; it is still being
                        //  retransmitted, so the chain waits however long that takes
                        trace!(
                            "chain {}: hole at {} pinned by reliable index {}",
                            chain_id, chain.next_expected, first.reliable_barrier
                        );
                        continue;
                    }

                    debug!(
                        "chain {}: giving up on unreliable indices {}..{} after gap timeout",
                        chain_id, chain.next_expected, skip_to
                    );
                    chain.next_expected = skip_to;
                    Self::drain_waiting(chain, now, out);
                }
            }
        }

        self.chains.retain(|chain_id, chain| {
            let idle = now.duration_since(chain.last_activity);
            if chain.waiting.is_empty() && idle >= self.reclaim_after {
                trace!("reclaiming idle chain {}", chain_id);
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    fn chain_count(&self) -> usize {
        self.chains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pipeline() -> InboundPipeline {
        InboundPipeline::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    fn ordered(chain_id: u32, index: u32, reliable_barrier: u32) -> Option<OrderingInfo> {
        Some(OrderingInfo { chain_id, index, reliable_barrier })
    }

    fn push(
        p: &mut InboundPipeline,
        ordering: Option<OrderingInfo>,
        payload: &[u8],
        now: Instant,
        out: &mut Vec<InboundDispatch>,
    ) {
        p.on_message(PacketSeq::ZERO, 9, ordering, payload.to_vec(), now, out);
    }

    #[test]
    fn test_unordered_messages_pass_through() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        push(&mut p, None, b"a", now, &mut out);
        push(&mut p, None, b"b", now, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(p.chain_count(), 0);
    }

    #[test]
    fn test_in_order_sequence_dispatches_immediately() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        for i in 1..=5u32 {
            push(&mut p, ordered(1, i, i - 1), &i.to_le_bytes(), now, &mut out);
        }
        assert_eq!(out.len(), 5);
        for (i, d) in out.iter().enumerate() {
            assert_eq!(d.payload, ((i + 1) as u32).to_le_bytes());
        }
    }

    #[test]
    fn test_out_of_order_parks_until_gap_fills() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        push(&mut p, ordered(1, 2, 1), b"two", now, &mut out);
        push(&mut p, ordered(1, 3, 2), b"three", now, &mut out);
        assert!(out.is_empty());

        push(&mut p, ordered(1, 1, 0), b"one", now, &mut out);
        let payloads: Vec<&[u8]> = out.iter().map(|d| d.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"one".as_slice(), b"two", b"three"]);
    }

    #[test]
    fn test_chains_are_independent() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        // chain 1 is stalled at index 1; chain 2 flows freely
        push(&mut p, ordered(1, 2, 1), b"parked", now, &mut out);
        push(&mut p, ordered(2, 1, 0), b"free", now, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"free");
    }

    #[test]
    fn test_passed_index_dropped() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        push(&mut p, ordered(1, 1, 0), b"one", now, &mut out);
        out.clear();
        push(&mut p, ordered(1, 1, 0), b"replay", now, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_duplicate_parked_index_keeps_first() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        push(&mut p, ordered(1, 2, 1), b"first", now, &mut out);
        push(&mut p, ordered(1, 2, 1), b"second", now, &mut out);
        push(&mut p, ordered(1, 1, 0), b"one", now, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].payload, b"first");
    }

    #[test]
    fn test_gap_timeout_skips_unreliable_hole() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        // index 1 was an unreliable message that got lost: barrier 0 on the parked
        //  frames proves no reliable message sits in the hole
        push(&mut p, ordered(1, 2, 0), b"two", now, &mut out);
        push(&mut p, ordered(1, 3, 0), b"three", now, &mut out);
        assert!(out.is_empty());

        p.tick(now + Duration::from_millis(500), &mut out);
        assert!(out.is_empty(), "gap timeout must not fire early");

        p.tick(now + Duration::from_millis(1100), &mut out);
        let payloads: Vec<&[u8]> = out.iter().map(|d| d.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"two".as_slice(), b"three"]);

        // the skipped unreliable index arriving late is dropped, not delivered out
        //  of order - its allowed zero-delivery outcome
        out.clear();
        push(&mut p, ordered(1, 1, 0), b"one, late", now + Duration::from_secs(2), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_reliable_hole_is_never_skipped() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        // index 1 is reliable (the parked frames' barrier says so) and still in
        //  retransmission; no amount of elapsed time may skip it
        push(&mut p, ordered(1, 2, 1), b"two", now, &mut out);
        push(&mut p, ordered(1, 3, 1), b"three", now, &mut out);
        assert!(out.is_empty());

        for minutes in 1..=5u64 {
            p.tick(now + Duration::from_secs(60 * minutes), &mut out);
            assert!(out.is_empty(), "a pending reliable index must pin the chain");
        }

        // the retransmission finally lands; everything drains in order
        push(&mut p, ordered(1, 1, 0), b"one", now + Duration::from_secs(301), &mut out);
        let payloads: Vec<&[u8]> = out.iter().map(|d| d.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"one".as_slice(), b"two", b"three"]);
    }

    #[test]
    fn test_skip_stops_at_reliable_barrier() {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        // hole at 1 (unreliable), parked 2; hole at 3 (reliable), parked 4
        push(&mut p, ordered(1, 2, 0), b"two", now, &mut out);
        push(&mut p, ordered(1, 4, 3), b"four", now, &mut out);
        assert!(out.is_empty());

        // the unreliable hole is skipped, the reliable one is not
        p.tick(now + Duration::from_millis(1100), &mut out);
        let payloads: Vec<&[u8]> = out.iter().map(|d| d.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"two".as_slice()]);

        out.clear();
        p.tick(now + Duration::from_secs(60), &mut out);
        assert!(out.is_empty(), "index 4 must wait for reliable index 3");

        push(&mut p, ordered(1, 3, 0), b"three", now + Duration::from_secs(61), &mut out);
        let payloads: Vec<&[u8]> = out.iter().map(|d| d.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"three".as_slice(), b"four"]);
    }

    #[rstest]
    #[case::idle_reclaimed(Duration::from_secs(31), 0)]
    #[case::recently_active(Duration::from_secs(29), 1)]
    fn test_idle_chain_reclaim(#[case] idle: Duration, #[case] expected_chains: usize) {
        let mut p = pipeline();
        let mut out = Vec::new();
        let now = Instant::now();

        push(&mut p, ordered(1, 1, 0), b"one", now, &mut out);
        p.tick(now + idle, &mut out);
        assert_eq!(p.chain_count(), expected_chains);
    }

    #[test]
    fn test_stalled_chain_not_reclaimed() {
        let mut p = InboundPipeline::new(Duration::from_secs(60), Duration::from_secs(1));
        let mut out = Vec::new();
        let now = Instant::now();

        push(&mut p, ordered(1, 2, 1), b"parked", now, &mut out);
        p.tick(now + Duration::from_secs(2), &mut out);
        assert_eq!(p.chain_count(), 1, "chains with parked frames must survive idle reclaim");
    }
}
