//! Payload codecs for the reserved control frames (message ids 1..=7).
//!
//! Control frames ride inside datagrams like any other frame; `Connect` / `ConnectAck`
//!  are driven by the handshake timer while a connection is `Pending`, the client's
//!  confirming `ConnectAck` and the disconnect pair go through the regular reliable
//!  machinery.

use crate::serial;
use bytes::{Buf, BufMut};

pub const MSG_ID_CONNECT: u32 = 1;
pub const MSG_ID_CONNECT_ACK: u32 = 2;
pub const MSG_ID_DISCONNECT: u32 = 3;
pub const MSG_ID_DISCONNECT_ACK: u32 = 4;
pub const MSG_ID_PING: u32 = 5;
pub const MSG_ID_PONG: u32 = 6;
pub const MSG_ID_FLOW_CONTROL: u32 = 7;

pub const PROTOCOL_VERSION: u8 = 1;

/// Client's opening frame: a random challenge the server must echo.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub challenge: u32,
    pub protocol_version: u8,
}

impl Connect {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.challenge);
        buf.put_u8(self.protocol_version);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Connect> {
        let challenge = serial::try_get_u32_le(buf, "connect challenge")?;
        let protocol_version = serial::try_get_u8(buf, "connect protocol version")?;
        Ok(Connect { challenge, protocol_version })
    }
}

/// Server's response (echo + own challenge + chosen version), and also the client's
///  confirmation (echo of the server challenge, own challenge 0).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectAck {
    pub echoed_challenge: u32,
    pub own_challenge: u32,
    pub protocol_version: u8,
}

impl ConnectAck {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.echoed_challenge);
        buf.put_u32_le(self.own_challenge);
        buf.put_u8(self.protocol_version);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectAck> {
        let echoed_challenge = serial::try_get_u32_le(buf, "connect ack echo")?;
        let own_challenge = serial::try_get_u32_le(buf, "connect ack challenge")?;
        let protocol_version = serial::try_get_u8(buf, "connect ack protocol version")?;
        Ok(ConnectAck { echoed_challenge, own_challenge, protocol_version })
    }
}

/// Graceful shutdown request / acknowledgement. No payload; both directions drain
///  their sent-not-acked tables before reaching `Closed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Disconnect;

impl Disconnect {
    pub fn ser(&self, _buf: &mut impl BufMut) {}

    pub fn deser(_buf: &mut impl Buf) -> anyhow::Result<Disconnect> {
        Ok(Disconnect)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DisconnectAck;

impl DisconnectAck {
    pub fn ser(&self, _buf: &mut impl BufMut) {}

    pub fn deser(_buf: &mut impl Buf) -> anyhow::Result<DisconnectAck> {
        Ok(DisconnectAck)
    }
}

/// Keepalive probe; the token correlates the `Pong` for RTT sampling on idle
///  connections.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub token: u32,
}

impl Ping {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.token);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Ping> {
        Ok(Ping { token: serial::try_get_u32_le(buf, "ping token")? })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub token: u32,
}

impl Pong {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.token);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Pong> {
        Ok(Pong { token: serial::try_get_u32_le(buf, "pong token")? })
    }
}

/// Receiver-advertised cap on the datagram rate the peer may send, folded into the
///  sender's pacing limit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlowControl {
    pub max_datagrams_per_second: u32,
}

impl FlowControl {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.max_datagrams_per_second);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FlowControl> {
        Ok(FlowControl {
            max_datagrams_per_second: serial::try_get_u32_le(buf, "flow control rate")?,
        })
    }
}
