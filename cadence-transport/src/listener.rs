//! Listening sockets that hand out one socket per flow
//!
//! UDP has no accept(), so a new flow is detected by the first datagram from
//! an unknown peer. The listening socket is connected to that peer and handed
//! off, and a fresh socket is bound to the same address for the next flow.
//! Both sockets carry `SO_REUSEADDR`/`SO_REUSEPORT`; the kernel delivers a
//! peer's datagrams to the socket connected to it.

use crate::poll::wait_readable;
use crate::Result;
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrStorage};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Bind a UDP socket with address and port reuse enabled
pub fn bind_reuse_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let fd = socket::socket(family, SockType::Datagram, SockFlag::empty(), None)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    socket::setsockopt(&fd, sockopt::ReusePort, &true)?;
    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    Ok(UdpSocket::from(fd))
}

pub struct UdpListener {
    socket: UdpSocket,
    addr: SocketAddr,
}

impl UdpListener {
    /// Bind to `addr`; port 0 picks an ephemeral port that later rebinds reuse
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = bind_reuse_udp(addr)?;
        let addr = socket.local_addr()?;
        tracing::debug!("UDP listener bound on {}", addr);
        Ok(Self { socket, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait up to `timeout` for the first datagram of a new flow
    ///
    /// The datagram stays queued on the returned socket, which is connected
    /// to the peer. `None` means nothing arrived in time.
    pub fn accept(&mut self, timeout: Duration) -> Result<Option<(UdpSocket, SocketAddr)>> {
        if !wait_readable(&self.socket, timeout)? {
            return Ok(None);
        }

        let mut probe = [0u8; 1];
        let (_, peer) = self.socket.peek_from(&mut probe)?;
        self.socket.connect(peer)?;

        let fresh = bind_reuse_udp(self.addr)?;
        let connected = std::mem::replace(&mut self.socket, fresh);
        tracing::debug!("UDP flow from {} accepted on {}", peer, self.addr);
        Ok(Some((connected, peer)))
    }
}

pub struct TcpFlowListener {
    listener: TcpListener,
}

impl TcpFlowListener {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        tracing::debug!("TCP listener bound on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait up to `timeout` for a connection
    pub fn accept(&mut self, timeout: Duration) -> Result<Option<(TcpStream, SocketAddr)>> {
        if !wait_readable(&self.listener, timeout)? {
            return Ok(None);
        }
        let (stream, peer) = self.listener.accept()?;
        Ok(Some((stream, peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_accept_hands_off_and_rebinds() {
        let mut listener = UdpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        assert!(listener.accept(Duration::from_millis(10)).unwrap().is_none());

        let first = UdpSocket::bind("127.0.0.1:0").unwrap();
        first.send_to(b"one", addr).unwrap();
        let (flow, peer) = listener.accept(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(peer, first.local_addr().unwrap());

        // The first datagram is still queued on the handed-off socket
        let mut buf = [0u8; 16];
        assert_eq!(flow.recv(&mut buf).unwrap(), 3);

        // Further datagrams from the same peer go to the connected socket
        first.send_to(b"two", addr).unwrap();
        flow.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(flow.recv(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"two");

        // A second peer is picked up by the rebound listener
        let second = UdpSocket::bind("127.0.0.1:0").unwrap();
        second.send_to(b"hi", addr).unwrap();
        let (_, peer) = listener.accept(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(peer, second.local_addr().unwrap());
    }

    #[test]
    fn test_tcp_accept() {
        let mut listener = TcpFlowListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(listener.accept(Duration::from_millis(10)).unwrap().is_none());

        let client = TcpStream::connect(addr).unwrap();
        let (_, peer) = listener.accept(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
