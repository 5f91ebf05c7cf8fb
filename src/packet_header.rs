use crate::seq::PacketSeq;
use crate::serial;
use bytes::{Buf, BufMut};

/// The two-byte datagram header, optionally followed by a six-byte ack section.
///
/// Header bits: 0-13 sequence number, 14 ack-present, 15 reliable-frames-present.
///  The reliable bit lets a receiver know whether the datagram must be acknowledged
///  promptly or can ride the regular ack delay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq: PacketSeq,
    pub ack: Option<AckInfo>,
    pub has_reliable_frames: bool,
}

/// One cumulative sequence plus a forward bitfield: bit `i` set means
///  `cumulative + i + 1` was received.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AckInfo {
    pub cumulative: PacketSeq,
    pub bits: u32,
}

const ACK_PRESENT_BIT: u16 = 1 << 14;
const RELIABLE_PRESENT_BIT: u16 = 1 << 15;

impl PacketHeader {
    pub const BASE_LEN: usize = 2;
    pub const ACK_SECTION_LEN: usize = 6;

    pub fn serialized_len(&self) -> usize {
        Self::BASE_LEN + if self.ack.is_some() { Self::ACK_SECTION_LEN } else { 0 }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut word = self.seq.to_raw();
        if self.ack.is_some() {
            word |= ACK_PRESENT_BIT;
        }
        if self.has_reliable_frames {
            word |= RELIABLE_PRESENT_BIT;
        }
        buf.put_u16_le(word);

        if let Some(ack) = &self.ack {
            buf.put_u16_le(ack.cumulative.to_raw());
            buf.put_u32_le(ack.bits);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let word = serial::try_get_u16_le(buf, "packet header")?;
        let seq = PacketSeq::from_raw(word);
        let has_reliable_frames = word & RELIABLE_PRESENT_BIT != 0;

        let ack = if word & ACK_PRESENT_BIT != 0 {
            let cumulative = PacketSeq::from_raw(serial::try_get_u16_le(buf, "ack cumulative")?);
            let bits = serial::try_get_u32_le(buf, "ack bitfield")?;
            Some(AckInfo { cumulative, bits })
        } else {
            None
        };

        Ok(PacketHeader { seq, ack, has_reliable_frames })
    }
}

impl AckInfo {
    /// All sequences this ack covers: the cumulative range is implicit, the bitfield
    ///  adds up to 32 individual sequences ahead of it.
    pub fn covers(&self, seq: PacketSeq) -> bool {
        if seq.is_at_or_before(self.cumulative) {
            return true;
        }
        let d = seq.forward_distance(self.cumulative);
        d >= 1 && d <= 32 && self.bits & (1 << (d - 1)) != 0
    }
}
