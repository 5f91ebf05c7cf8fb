//! Receiver-side reassembly of fragmented messages.
//!
//! A message whose serialized frame would exceed the datagram budget is split by the
//!  sender into fragments sharing a transfer id. Fragments are reliable, so every
//!  piece arrives eventually unless the connection dies; the table still carries a
//!  deadline per transfer so state from a dead transfer cannot linger forever.

use crate::message_frame::{FrameInfo, FragmentInfo, OrderingInfo};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A reassembled message: what the inbound pipeline dispatches.
#[derive(Debug, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub message_id: u32,
    pub ordering: Option<OrderingInfo>,
    pub payload: Vec<u8>,
}

struct PartialTransfer {
    message_id: u32,
    ordering: Option<OrderingInfo>,
    total: u32,
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
    deadline: Instant,
}

pub struct FragmentReassembly {
    transfers: FxHashMap<u16, PartialTransfer>,
    timeout: Duration,
    max_total_bytes: usize,
}

impl FragmentReassembly {
    pub fn new(timeout: Duration, max_total_bytes: usize) -> FragmentReassembly {
        FragmentReassembly {
            transfers: FxHashMap::default(),
            timeout,
            max_total_bytes,
        }
    }

    /// Feed one fragment frame. Returns the whole message once the last piece lands.
    pub fn on_fragment(
        &mut self,
        info: &FrameInfo,
        fragment: FragmentInfo,
        payload: Vec<u8>,
        now: Instant,
    ) -> Option<ReassembledMessage> {
        // a legitimate transfer splits into far fewer fragments than bytes; bounding
        //  the count keeps a forged total from reserving a huge chunk table
        let max_fragments = (self.max_total_bytes / 32).max(1);
        if fragment.total as usize > max_fragments {
            warn!(
                "fragment transfer {} declares {} fragments, over the limit of {} - ignoring",
                fragment.transfer_id, fragment.total, max_fragments
            );
            return None;
        }

        if let Some(existing) = self.transfers.get(&fragment.transfer_id) {
            if existing.total != fragment.total || existing.message_id != info.message_id {
                warn!(
                    "fragment transfer {} changed shape mid-flight (total {} -> {}) - discarding transfer",
                    fragment.transfer_id, existing.total, fragment.total
                );
                self.transfers.remove(&fragment.transfer_id);
                return None;
            }
            if existing.chunks[fragment.index as usize].is_some() {
                // the reliable dedupe window suppresses true duplicates; a replayed
                //  datagram can still get this far
                return None;
            }

            let assembled_size: usize =
                existing.chunks.iter().flatten().map(Vec::len).sum::<usize>() + payload.len();
            if assembled_size > self.max_total_bytes {
                warn!(
                    "fragment transfer {} exceeds the configured maximum of {} bytes - discarding",
                    fragment.transfer_id, self.max_total_bytes
                );
                self.transfers.remove(&fragment.transfer_id);
                return None;
            }
        } else if payload.len() > self.max_total_bytes {
            return None;
        }

        let transfer = self.transfers.entry(fragment.transfer_id).or_insert_with(|| {
            PartialTransfer {
                message_id: info.message_id,
                ordering: info.ordering,
                total: fragment.total,
                chunks: vec![None; fragment.total as usize],
                received: 0,
                deadline: now + self.timeout,
            }
        });

        transfer.chunks[fragment.index as usize] = Some(payload);
        transfer.received += 1;

        if transfer.received < transfer.total {
            return None;
        }

        let transfer = self.transfers.remove(&fragment.transfer_id).unwrap();
        let mut payload = Vec::new();
        for chunk in transfer.chunks {
            payload.extend_from_slice(&chunk.expect("all fragments received"));
        }

        Some(ReassembledMessage {
            message_id: transfer.message_id,
            ordering: transfer.ordering,
            payload,
        })
    }

    /// Drop partial transfers whose deadline passed.
    pub fn expire(&mut self, now: Instant) {
        self.transfers.retain(|transfer_id, transfer| {
            if now >= transfer.deadline {
                debug!(
                    "discarding partial fragment transfer {} ({}/{} fragments received)",
                    transfer_id, transfer.received, transfer.total
                );
                false
            } else {
                true
            }
        });
    }

    pub fn pending_transfers(&self) -> usize {
        self.transfers.len()
    }
}
