//! Serial-number arithmetic for the two counters that wrap in practice: the 14-bit
//!  datagram sequence and the 32-bit reliable message number.
//!
//! Comparisons use the half-window rule: `a` is newer than `b` iff the forward
//!  distance from `b` to `a` is non-zero and below half the sequence space. The
//!  sequence width is a tunable in principle; the invariant to keep is that the ack
//!  bitfield window plus the duplicate window stay below half the space.

use std::fmt::{Display, Formatter};

/// Width of the datagram sequence number in bits.
pub const SEQ_BITS: u32 = 14;
pub const SEQ_MODULUS: u16 = 1 << SEQ_BITS;
pub const SEQ_MASK: u16 = SEQ_MODULUS - 1;
const SEQ_HALF: u16 = SEQ_MODULUS / 2;

/// A 14-bit datagram sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketSeq(u16);

impl PacketSeq {
    pub const ZERO: PacketSeq = PacketSeq(0);

    /// The value serial-arithmetically one before zero; used as the initial cumulative
    ///  ack so that "nothing received yet" is expressible.
    pub const BEFORE_ZERO: PacketSeq = PacketSeq(SEQ_MASK);

    pub fn from_raw(value: u16) -> PacketSeq {
        PacketSeq(value & SEQ_MASK)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> PacketSeq {
        PacketSeq((self.0 + 1) & SEQ_MASK)
    }

    pub fn plus(self, n: u16) -> PacketSeq {
        PacketSeq(self.0.wrapping_add(n) & SEQ_MASK)
    }

    /// Forward distance from `other` to `self`, in `0..SEQ_MODULUS`.
    pub fn forward_distance(self, other: PacketSeq) -> u16 {
        self.0.wrapping_sub(other.0) & SEQ_MASK
    }

    /// Half-window comparison: true iff `self` is ahead of `other` by less than half
    ///  the sequence space.
    pub fn is_newer_than(self, other: PacketSeq) -> bool {
        let d = self.forward_distance(other);
        d != 0 && d < SEQ_HALF
    }

    /// `self <= other` in serial order.
    pub fn is_at_or_before(self, other: PacketSeq) -> bool {
        !self.is_newer_than(other)
    }
}

impl Display for PacketSeq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A 32-bit reliable message number. 0 is reserved on the wire for "unreliable", so
///  counting starts at 1.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ReliableNumber(u32);

impl ReliableNumber {
    pub const FIRST: ReliableNumber = ReliableNumber(1);

    pub fn from_raw(value: u32) -> ReliableNumber {
        ReliableNumber(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> ReliableNumber {
        let raw = self.0.wrapping_add(1);
        // skip the unreliable sentinel on wrap-around
        ReliableNumber(if raw == 0 { 1 } else { raw })
    }

    /// Forward distance from `other` to `self` modulo 2^32.
    pub fn forward_distance(self, other: ReliableNumber) -> u32 {
        self.0.wrapping_sub(other.0)
    }

    pub fn is_newer_than(self, other: ReliableNumber) -> bool {
        let d = self.forward_distance(other);
        d != 0 && d < 1 << 31
    }
}

impl Display for ReliableNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}
