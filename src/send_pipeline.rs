//! The socket seam between the worker and the operating system, introduced so the
//!  datagram path can be exercised in tests without real sockets.

use std::io;
use std::net::SocketAddr;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// Non-blocking datagram I/O. The worker never awaits socket readiness directly; it
///  sweeps sockets with `try_*` calls from its bounded poll loop.
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync {
    fn try_send_datagram(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;
    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A socket `connect`ed to one peer: the client side of a connection. Connecting lets
///  the OS route ICMP errors (port unreachable) back to us as `ConnectionRefused`.
pub struct ConnectedUdp {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl ConnectedUdp {
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> ConnectedUdp {
        ConnectedUdp { socket, peer }
    }
}

impl DatagramSocket for ConnectedUdp {
    fn try_send_datagram(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        debug_assert_eq!(to, self.peer);
        trace!("sending {} byte datagram to {:?}", buf.len(), to);
        self.socket.try_send(buf)
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let len = self.socket.try_recv(buf)?;
        Ok((len, self.peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// An unconnected socket serving many peers: the server side.
pub struct ListenerUdp {
    socket: UdpSocket,
}

impl ListenerUdp {
    pub fn new(socket: UdpSocket) -> ListenerUdp {
        ListenerUdp { socket }
    }
}

impl DatagramSocket for ListenerUdp {
    fn try_send_datagram(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        trace!("sending {} byte datagram to {:?}", buf.len(), to);
        self.socket.try_send_to(buf, to)
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.try_recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
