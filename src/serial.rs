//! Small helpers shared by the wire codecs: bounds-checked reads that fail with a
//!  uniform "malformed payload" error, and length-prefixed byte strings.
//!
//! Fixed-width integers are little-endian; var-ints use the 7-bits-per-byte
//!  continuation encoding of `bytes-varint`.

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn malformed(what: &str) -> anyhow::Error {
    anyhow!("malformed payload: {}", what)
}

pub fn try_get_u8(buf: &mut impl Buf, what: &str) -> anyhow::Result<u8> {
    if buf.remaining() < 1 {
        return Err(malformed(what));
    }
    Ok(buf.get_u8())
}

pub fn try_get_u16_le(buf: &mut impl Buf, what: &str) -> anyhow::Result<u16> {
    if buf.remaining() < 2 {
        return Err(malformed(what));
    }
    Ok(buf.get_u16_le())
}

pub fn try_get_u32_le(buf: &mut impl Buf, what: &str) -> anyhow::Result<u32> {
    if buf.remaining() < 4 {
        return Err(malformed(what));
    }
    Ok(buf.get_u32_le())
}

pub fn try_get_u32_varint(buf: &mut impl Buf, what: &str) -> anyhow::Result<u32> {
    VarIntSupport::try_get_u32_varint(buf).map_err(|_| malformed(what))
}

pub fn try_get_usize_varint(buf: &mut impl Buf, what: &str) -> anyhow::Result<usize> {
    VarIntSupport::try_get_usize_varint(buf).map_err(|_| malformed(what))
}

pub fn put_u32_varint(buf: &mut impl BufMut, value: u32) {
    VarIntSupportMut::put_u32_varint(buf, value);
}

pub fn put_usize_varint(buf: &mut impl BufMut, value: usize) {
    VarIntSupportMut::put_usize_varint(buf, value);
}

/// Length-prefixed byte string: var-int length followed by the raw bytes, no
///  terminator.
pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    put_usize_varint(buf, bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf, what: &str) -> anyhow::Result<Vec<u8>> {
    let len = try_get_usize_varint(buf, what)?;
    if buf.remaining() < len {
        return Err(malformed(what));
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf, what: &str) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf, what)?;
    String::from_utf8(raw).map_err(|_| malformed(what))
}
