//! Receiver-side windows: the datagram sequence window that drives duplicate
//!  suppression and ack production, and the wider reliable-number window that makes
//!  delivery exactly-once even across retransmitted datagrams.

use crate::packet_header::AckInfo;
use crate::seq::{PacketSeq, ReliableNumber, SEQ_MODULUS};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WindowOutcome {
    /// First sighting; process the content.
    Fresh,
    /// Seen before (or serially at/behind the cumulative mark); drop silently.
    Duplicate,
    /// Ahead of the window by more than it can track; drop. With the congestion
    ///  window bounding what is in flight this does not happen in healthy operation.
    TooFarAhead,
}

/// Tracks the last 128 received datagram sequences relative to the highest contiguous
///  one. Doubles as the source of ack sections: bit `i` of the bitfield means
///  `cumulative + i + 1` was received.
pub struct SequenceWindow {
    cumulative: PacketSeq,
    bits: u128,
}

pub const SEQUENCE_WINDOW_DEPTH: u16 = 128;

impl SequenceWindow {
    pub fn new() -> SequenceWindow {
        // half the duplicate window plus the 32-bit ack window must stay below half
        //  the sequence space
        const _: () = assert!((SEQUENCE_WINDOW_DEPTH as u32 + 32) < (SEQ_MODULUS as u32) / 2);

        SequenceWindow {
            cumulative: PacketSeq::BEFORE_ZERO,
            bits: 0,
        }
    }

    pub fn record(&mut self, seq: PacketSeq) -> WindowOutcome {
        let d = seq.forward_distance(self.cumulative);

        if d == 0 || d >= SEQ_MODULUS / 2 {
            return WindowOutcome::Duplicate;
        }
        if d > SEQUENCE_WINDOW_DEPTH {
            return WindowOutcome::TooFarAhead;
        }

        let bit = 1u128 << (d - 1);
        if self.bits & bit != 0 {
            return WindowOutcome::Duplicate;
        }
        self.bits |= bit;

        // slide the cumulative mark over the contiguous prefix
        while self.bits & 1 != 0 {
            self.bits >>= 1;
            self.cumulative = self.cumulative.next();
        }

        WindowOutcome::Fresh
    }

    pub fn cumulative(&self) -> PacketSeq {
        self.cumulative
    }

    /// The ack section describing the current receive state. Producing it repeatedly
    ///  without new receipts yields identical, idempotent acks.
    pub fn ack_info(&self) -> AckInfo {
        AckInfo {
            cumulative: self.cumulative,
            bits: self.bits as u32,
        }
    }
}

const DEDUPE_WINDOW_BITS: u32 = 1024;
const DEDUPE_WORDS: usize = (DEDUPE_WINDOW_BITS / 64) as usize;

/// Sliding bitmap over the last 1024 reliable message numbers. Numbers that fall
///  behind the window are treated as already delivered - retransmission timing is
///  bounded well inside a window this deep.
pub struct ReliableDedupeWindow {
    /// lowest number still tracked; bit `i` covers `base + i`
    base: ReliableNumber,
    words: [u64; DEDUPE_WORDS],
}

impl ReliableDedupeWindow {
    pub fn new() -> ReliableDedupeWindow {
        ReliableDedupeWindow {
            base: ReliableNumber::FIRST,
            words: [0; DEDUPE_WORDS],
        }
    }

    pub fn record(&mut self, number: ReliableNumber) -> WindowOutcome {
        let d = number.forward_distance(self.base);

        if d >= 1 << 31 {
            // behind the window
            return WindowOutcome::Duplicate;
        }

        if d >= DEDUPE_WINDOW_BITS {
            let shift = d - (DEDUPE_WINDOW_BITS - 1);
            self.shift_down(shift);
            self.base = ReliableNumber::from_raw(self.base.to_raw().wrapping_add(shift));
        }

        let d = number.forward_distance(self.base);
        debug_assert!(d < DEDUPE_WINDOW_BITS);

        let word = (d / 64) as usize;
        let bit = 1u64 << (d % 64);
        if self.words[word] & bit != 0 {
            return WindowOutcome::Duplicate;
        }
        self.words[word] |= bit;
        WindowOutcome::Fresh
    }

    fn shift_down(&mut self, shift: u32) {
        if shift >= DEDUPE_WINDOW_BITS {
            self.words = [0; DEDUPE_WORDS];
            return;
        }

        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..DEDUPE_WORDS {
            let lower = self.words.get(i + word_shift).copied().unwrap_or(0);
            let upper = self.words.get(i + word_shift + 1).copied().unwrap_or(0);
            self.words[i] = if bit_shift == 0 {
                lower
            } else {
                (lower >> bit_shift) | (upper << (64 - bit_shift))
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seq(raw: u16) -> PacketSeq {
        PacketSeq::from_raw(raw)
    }

    fn rel(raw: u32) -> ReliableNumber {
        ReliableNumber::from_raw(raw)
    }

    #[test]
    fn test_in_order_reception() {
        let mut window = SequenceWindow::new();
        for i in 0..300 {
            assert_eq!(window.record(seq(i)), WindowOutcome::Fresh);
            assert_eq!(window.cumulative(), seq(i));
            assert_eq!(window.ack_info().bits, 0);
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let mut window = SequenceWindow::new();
        assert_eq!(window.record(seq(0)), WindowOutcome::Fresh);
        assert_eq!(window.record(seq(0)), WindowOutcome::Duplicate);
        assert_eq!(window.record(seq(1)), WindowOutcome::Fresh);
        assert_eq!(window.record(seq(0)), WindowOutcome::Duplicate);
        assert_eq!(window.record(seq(1)), WindowOutcome::Duplicate);
    }

    #[test]
    fn test_gap_produces_bitfield() {
        let mut window = SequenceWindow::new();
        window.record(seq(0));
        // 1 is lost; 2 and 3 arrive
        assert_eq!(window.record(seq(2)), WindowOutcome::Fresh);
        assert_eq!(window.record(seq(3)), WindowOutcome::Fresh);

        let ack = window.ack_info();
        assert_eq!(ack.cumulative, seq(0));
        assert_eq!(ack.bits, 0b110); // bit 1 => seq 2, bit 2 => seq 3

        // the hole fills; cumulative slides over the whole run
        assert_eq!(window.record(seq(1)), WindowOutcome::Fresh);
        let ack = window.ack_info();
        assert_eq!(ack.cumulative, seq(3));
        assert_eq!(ack.bits, 0);
    }

    #[test]
    fn test_nothing_received_yet() {
        let window = SequenceWindow::new();
        let ack = window.ack_info();
        assert_eq!(ack.cumulative, PacketSeq::BEFORE_ZERO);
        assert_eq!(ack.bits, 0);
        assert!(!ack.covers(seq(0)));
    }

    #[test]
    fn test_first_datagram_lost() {
        let mut window = SequenceWindow::new();
        // seq 0 never arrives
        assert_eq!(window.record(seq(1)), WindowOutcome::Fresh);

        let ack = window.ack_info();
        assert_eq!(ack.cumulative, PacketSeq::BEFORE_ZERO);
        assert!(ack.covers(seq(1)));
        assert!(!ack.covers(seq(0)), "an ack must never cover an unreceived sequence");
    }

    #[test]
    fn test_too_far_ahead_is_dropped() {
        let mut window = SequenceWindow::new();
        window.record(seq(0));
        assert_eq!(window.record(seq(200)), WindowOutcome::TooFarAhead);
        // state unchanged
        assert_eq!(window.cumulative(), seq(0));
    }

    #[test]
    fn test_wraparound() {
        let mut window = SequenceWindow::new();
        for i in 0..=0x3FF0u16 {
            window.record(seq(i));
        }

        let mut s = seq(0x3FF0);
        for _ in 0..32 {
            s = s.next();
            assert_eq!(window.record(s), WindowOutcome::Fresh);
        }
        assert_eq!(window.cumulative(), seq(16));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut window = SequenceWindow::new();
        let received = [0u16, 1, 3, 4, 7];
        for &r in &received {
            assert_eq!(window.record(seq(r)), WindowOutcome::Fresh);
        }
        let ack_before = window.ack_info();

        // replaying any subset changes nothing and yields only duplicates
        for &r in &[0u16, 3, 7, 1, 4] {
            assert_eq!(window.record(seq(r)), WindowOutcome::Duplicate);
        }
        assert_eq!(window.ack_info(), ack_before);
    }

    #[test]
    fn test_dedupe_basic() {
        let mut window = ReliableDedupeWindow::new();
        assert_eq!(window.record(rel(1)), WindowOutcome::Fresh);
        assert_eq!(window.record(rel(1)), WindowOutcome::Duplicate);
        assert_eq!(window.record(rel(2)), WindowOutcome::Fresh);
        assert_eq!(window.record(rel(100)), WindowOutcome::Fresh);
        assert_eq!(window.record(rel(100)), WindowOutcome::Duplicate);
        assert_eq!(window.record(rel(3)), WindowOutcome::Fresh);
    }

    #[test]
    fn test_dedupe_slides_forward() {
        let mut window = ReliableDedupeWindow::new();
        window.record(rel(1));
        window.record(rel(5000));

        // 1 fell behind the window and counts as delivered
        assert_eq!(window.record(rel(1)), WindowOutcome::Duplicate);
        assert_eq!(window.record(rel(5000)), WindowOutcome::Duplicate);

        // numbers inside the new window still dedupe exactly
        assert_eq!(window.record(rel(4500)), WindowOutcome::Fresh);
        assert_eq!(window.record(rel(4500)), WindowOutcome::Duplicate);
    }

    #[rstest]
    #[case::by_one(1024)]
    #[case::by_word(64 * 17)]
    #[case::by_window(5000)]
    fn test_dedupe_shift_preserves_recent_marks(#[case] jump: u32) {
        let mut window = ReliableDedupeWindow::new();
        for i in 1..=64u32 {
            assert_eq!(window.record(rel(i)), WindowOutcome::Fresh);
        }

        assert_eq!(window.record(rel(jump)), WindowOutcome::Fresh);
        assert_eq!(window.record(rel(jump)), WindowOutcome::Duplicate);

        // a fresh number just below the jump is still fresh exactly once
        assert_eq!(window.record(rel(jump - 1)), WindowOutcome::Fresh);
        assert_eq!(window.record(rel(jump - 1)), WindowOutcome::Duplicate);
    }

    #[test]
    fn test_dedupe_across_u32_wrap() {
        let mut window = ReliableDedupeWindow::new();
        let near_max = u32::MAX - 10;
        // pretend the counter has been running for a long time
        window.base = rel(near_max);
        window.words = [0; DEDUPE_WORDS];

        assert_eq!(window.record(rel(near_max)), WindowOutcome::Fresh);
        assert_eq!(window.record(rel(5)), WindowOutcome::Fresh); // wrapped
        assert_eq!(window.record(rel(5)), WindowOutcome::Duplicate);
        assert_eq!(window.record(rel(near_max)), WindowOutcome::Duplicate);
    }
}
