use crate::seq::ReliableNumber;
use crate::serial;
use bytes::{Buf, BufMut};

/// Message ids below 8 are reserved for the engine: 1..=7 carry control frames,
///  0 never appears on the wire.
pub const MAX_CONTROL_ID: u32 = 7;

pub fn is_control_id(message_id: u32) -> bool {
    (1..=MAX_CONTROL_ID).contains(&message_id)
}

/// Whether an id is unavailable to applications (values < 8).
pub fn is_reserved_id(message_id: u32) -> bool {
    message_id <= MAX_CONTROL_ID
}

const FLAG_FRAGMENT: u8 = 0x01;

/// Everything about a frame except its payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub message_id: u32,
    /// `None` for unreliable frames (wire value 0).
    pub reliable_number: Option<ReliableNumber>,
    /// `None` for frames outside any in-order chain (wire chain id 0).
    pub ordering: Option<OrderingInfo>,
    pub fragment: Option<FragmentInfo>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OrderingInfo {
    /// Non-zero chain id; chains are independent ordering channels.
    pub chain_id: u32,
    /// Position within the chain, starting at 1.
    pub index: u32,
    /// Chain index of the last reliable in-order message before this one, 0 if
    ///  none. Lets the receiver tell a hole that will be retransmitted apart from
    ///  one that never will.
    pub reliable_barrier: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Groups the fragments of one oversized message; per-connection monotonic.
    pub transfer_id: u16,
    pub total: u32,
    /// 0-based.
    pub index: u32,
}

/// A parsed frame with its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFrame {
    pub info: FrameInfo,
    pub payload: Vec<u8>,
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

impl FrameInfo {
    pub fn plain(message_id: u32) -> FrameInfo {
        FrameInfo {
            message_id,
            reliable_number: None,
            ordering: None,
            fragment: None,
        }
    }

    /// Exact on-wire size of a frame with this header and a payload of `payload_len`
    ///  bytes. The scheduler uses this to decide what still fits into the current
    ///  datagram without serializing speculatively.
    pub fn serialized_len(&self, payload_len: usize) -> usize {
        let mut len = 1; // flags
        len += varint_len(self.message_id as u64);
        len += varint_len(self.reliable_number.map(ReliableNumber::to_raw).unwrap_or(0) as u64);
        match &self.ordering {
            Some(ordering) => {
                len += varint_len(ordering.chain_id as u64);
                len += varint_len(ordering.index as u64);
                len += varint_len(ordering.reliable_barrier as u64);
            }
            None => len += 1, // chain id 0
        }
        if let Some(fragment) = &self.fragment {
            len += varint_len(fragment.transfer_id as u64);
            len += varint_len(fragment.total as u64);
            len += varint_len(fragment.index as u64);
        }
        len += varint_len(payload_len as u64);
        len + payload_len
    }

    pub fn ser(&self, payload: &[u8], buf: &mut impl BufMut) {
        let mut flags = 0u8;
        if self.fragment.is_some() {
            flags |= FLAG_FRAGMENT;
        }
        buf.put_u8(flags);

        serial::put_u32_varint(buf, self.message_id);
        serial::put_u32_varint(buf, self.reliable_number.map(ReliableNumber::to_raw).unwrap_or(0));
        match &self.ordering {
            Some(ordering) => {
                debug_assert!(ordering.chain_id != 0);
                serial::put_u32_varint(buf, ordering.chain_id);
                serial::put_u32_varint(buf, ordering.index);
                serial::put_u32_varint(buf, ordering.reliable_barrier);
            }
            None => serial::put_u32_varint(buf, 0),
        }
        if let Some(fragment) = &self.fragment {
            serial::put_u32_varint(buf, fragment.transfer_id as u32);
            serial::put_u32_varint(buf, fragment.total);
            serial::put_u32_varint(buf, fragment.index);
        }
        serial::put_bytes(buf, payload);
    }
}

impl MessageFrame {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageFrame> {
        let flags = serial::try_get_u8(buf, "frame flags")?;

        let message_id = serial::try_get_u32_varint(buf, "message id")?;

        let reliable_raw = serial::try_get_u32_varint(buf, "reliable message number")?;
        let reliable_number = if reliable_raw != 0 {
            Some(ReliableNumber::from_raw(reliable_raw))
        } else {
            None
        };

        let chain_id = serial::try_get_u32_varint(buf, "chain id")?;
        let ordering = if chain_id != 0 {
            let index = serial::try_get_u32_varint(buf, "ordering index")?;
            let reliable_barrier = serial::try_get_u32_varint(buf, "reliable barrier")?;
            Some(OrderingInfo { chain_id, index, reliable_barrier })
        } else {
            None
        };

        let fragment = if flags & FLAG_FRAGMENT != 0 {
            let transfer_raw = serial::try_get_u32_varint(buf, "fragment transfer id")?;
            if transfer_raw > u16::MAX as u32 {
                return Err(serial::malformed("fragment transfer id"));
            }
            let total = serial::try_get_u32_varint(buf, "fragment total")?;
            let index = serial::try_get_u32_varint(buf, "fragment index")?;
            if total == 0 || index >= total {
                return Err(serial::malformed("fragment bounds"));
            }
            Some(FragmentInfo { transfer_id: transfer_raw as u16, total, index })
        } else {
            None
        };

        let payload = serial::try_get_bytes(buf, "frame payload")?;

        Ok(MessageFrame {
            info: FrameInfo { message_id, reliable_number, ordering, fragment },
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn round_trip(info: FrameInfo, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        info.ser(payload, &mut buf);
        assert_eq!(buf.len(), info.serialized_len(payload.len()), "serialized_len must be exact");

        let mut read = &buf[..];
        let frame = MessageFrame::deser(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(frame.info, info);
        assert_eq!(frame.payload, payload);

        buf.to_vec()
    }

    #[test]
    fn test_plain_unreliable_frame() {
        let bytes = round_trip(FrameInfo::plain(191), b"abc");
        // flags, id 191 (2 var-int bytes), reliable 0, chain 0, len 3, payload
        assert_eq!(bytes, vec![0, 0xBF, 0x01, 0, 0, 3, 97, 98, 99]);
    }

    #[test]
    fn test_reliable_ordered_frame() {
        let info = FrameInfo {
            message_id: 9,
            reliable_number: Some(ReliableNumber::from_raw(300)),
            ordering: Some(OrderingInfo { chain_id: 1, index: 42, reliable_barrier: 41 }),
            fragment: None,
        };
        let bytes = round_trip(info, b"x");
        assert_eq!(bytes, vec![0, 9, 0xAC, 0x02, 1, 42, 41, 1, 120]);
    }

    #[test]
    fn test_fragment_frame() {
        let info = FrameInfo {
            message_id: 20,
            reliable_number: Some(ReliableNumber::from_raw(7)),
            ordering: None,
            fragment: Some(FragmentInfo { transfer_id: 3, total: 29, index: 28 }),
        };
        let bytes = round_trip(info, &[0xAA; 5]);
        assert_eq!(bytes[0], 0x01); // fragment flag
    }

    #[rstest]
    #[case::empty_payload(FrameInfo::plain(8), vec![])]
    #[case::large_id(FrameInfo::plain(1_000_000), vec![1, 2, 3])]
    #[case::big_payload(FrameInfo::plain(8), vec![7u8; 1000])]
    fn test_round_trip_various(#[case] info: FrameInfo, #[case] payload: Vec<u8>) {
        round_trip(info, &payload);
    }

    #[test]
    fn test_deser_any_truncated_prefix_fails() {
        let info = FrameInfo {
            message_id: 191,
            reliable_number: Some(ReliableNumber::from_raw(77)),
            ordering: Some(OrderingInfo { chain_id: 2, index: 5, reliable_barrier: 4 }),
            fragment: Some(FragmentInfo { transfer_id: 1, total: 2, index: 0 }),
        };
        let mut buf = BytesMut::new();
        info.ser(b"hello", &mut buf);

        for cut in 0..buf.len() {
            let mut read = &buf[..cut];
            assert!(MessageFrame::deser(&mut read).is_err(), "prefix of length {} must not parse", cut);
        }
    }

    #[rstest]
    #[case::zero_total(FragmentInfo { transfer_id: 1, total: 0, index: 0 })]
    #[case::index_out_of_bounds(FragmentInfo { transfer_id: 1, total: 3, index: 3 })]
    fn test_deser_rejects_bad_fragment_bounds(#[case] fragment: FragmentInfo) {
        let mut buf = BytesMut::new();
        buf.put_u8(FLAG_FRAGMENT);
        serial::put_u32_varint(&mut buf, 20);
        serial::put_u32_varint(&mut buf, 1);
        serial::put_u32_varint(&mut buf, 0);
        serial::put_u32_varint(&mut buf, fragment.transfer_id as u32);
        serial::put_u32_varint(&mut buf, fragment.total);
        serial::put_u32_varint(&mut buf, fragment.index);
        serial::put_bytes(&mut buf, b"x");

        let mut read = &buf[..];
        assert!(MessageFrame::deser(&mut read).is_err());
    }

    #[rstest]
    #[case::control_low(1, true)]
    #[case::control_high(7, true)]
    #[case::zero(0, false)]
    #[case::application(8, false)]
    fn test_is_control_id(#[case] id: u32, #[case] expected: bool) {
        assert_eq!(is_control_id(id), expected);
    }

    #[rstest]
    #[case::zero(0, true)]
    #[case::control_low(1, true)]
    #[case::control_high(7, true)]
    #[case::first_application(8, false)]
    #[case::large(1_000_000, false)]
    fn test_is_reserved_id(#[case] id: u32, #[case] expected: bool) {
        assert_eq!(is_reserved_id(id), expected);
    }

    #[test]
    fn test_payload_declared_longer_than_buffer() {
        let mut buf = BytesMut::new();
        FrameInfo::plain(9).ser(b"abcdef", &mut buf);
        // truncate mid-payload: declared length exceeds what remains
        let mut read = &buf[..buf.len() - 2];
        assert!(MessageFrame::deser(&mut read).is_err());
    }
}
