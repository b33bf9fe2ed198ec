//! Connected UDP flow sockets
//!
//! A flow socket is connected to exactly one peer. Receives are blocking with
//! an optional timeout, so a flow thread wakes up periodically even when the
//! sender stalls.
//!
//! ## Kernel Timestamps (Linux only)
//!
//! With [`RxTimestampConfig::kernel`] set, receives go through `recvmsg()` and
//! the kernel arrival stamp is reported instead of a user-space clock read.

use crate::poll::wait_readable;
use crate::{Result, Timestamp};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

#[cfg(target_os = "linux")]
use crate::rx_timestamp;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

/// Kernel receive timestamp configuration
#[derive(Debug, Clone, Default)]
pub struct RxTimestampConfig {
    /// Use kernel arrival timestamps when the platform supports them
    pub kernel: bool,
    /// Also request raw NIC timestamps
    pub hardware: bool,
    /// Bind the socket to this interface (e.g. "eth0")
    pub interface: Option<String>,
}

impl RxTimestampConfig {
    pub fn kernel() -> Self {
        Self { kernel: true, ..Self::default() }
    }
}

/// Result of one receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A datagram of `len` bytes arrived at `timestamp`
    ///
    /// `kernel` is set when the timestamp came from ancillary data.
    Data { len: usize, timestamp: Timestamp, kernel: bool },
    /// The receive timed out or would block
    WouldBlock { timestamp: Timestamp },
    /// Zero-length read
    Closed,
}

/// Datagram source and sink for one flow
pub trait FlowSocket: Send {
    /// Receive the next measurement datagram into `buf`
    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome>;

    /// Send a datagram to the flow's peer
    fn send(&mut self, buf: &[u8]) -> Result<usize>;

    /// Wait until the peer's datagram socket is readable
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool>;

    /// Read a datagram from the peer's datagram socket, ignoring capture
    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether `recv` delivers whole link-layer frames
    fn l2_frames(&self) -> bool {
        false
    }

    /// Drop datagrams queued on the datagram socket that `recv` already
    /// delivered through another path, returning how many were dropped
    fn discard_delivered(&mut self) -> Result<usize> {
        Ok(0)
    }
}

/// Connected UDP socket carrying one flow
pub struct UdpFlowSocket {
    socket: UdpSocket,
    peer: SocketAddr,
    kernel_timestamps: bool,
}

impl UdpFlowSocket {
    /// Wrap a socket that is already connected to its peer
    pub fn new(socket: UdpSocket, config: &RxTimestampConfig) -> Result<Self> {
        let peer = socket.peer_addr()?;
        socket.set_nonblocking(false)?;

        #[cfg(target_os = "linux")]
        let kernel_timestamps = Self::configure_timestamping(&socket, config);
        #[cfg(not(target_os = "linux"))]
        let kernel_timestamps = {
            let _ = config;
            false
        };

        Ok(Self { socket, peer, kernel_timestamps })
    }

    /// Bind an ephemeral local port and connect it to `target`
    pub fn connect(target: SocketAddr, config: &RxTimestampConfig) -> Result<Self> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(target)?;
        Self::new(socket, config)
    }

    #[cfg(target_os = "linux")]
    fn configure_timestamping(socket: &UdpSocket, config: &RxTimestampConfig) -> bool {
        let fd = socket.as_raw_fd();
        if let Some(ref interface) = config.interface {
            if let Err(e) = rx_timestamp::bind_to_device(fd, interface) {
                tracing::warn!("Could not bind to device '{}': {}", interface, e);
            }
        }
        if !config.kernel {
            return false;
        }
        match rx_timestamp::enable_rx_timestamping(fd, config.hardware) {
            Ok(mode) => {
                tracing::debug!("Kernel receive timestamps enabled ({:?})", mode);
                true
            }
            Err(e) => {
                tracing::warn!("Could not enable kernel timestamping: {}", e);
                false
            }
        }
    }

    /// Set the receive timeout, `None` blocks indefinitely
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        // A zero duration is rejected by the socket layer
        let timeout = timeout.filter(|t| !t.is_zero());
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn kernel_timestamps(&self) -> bool {
        self.kernel_timestamps
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    fn recv_inner(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<Timestamp>)> {
        #[cfg(target_os = "linux")]
        if self.kernel_timestamps {
            return rx_timestamp::recvmsg_with_timestamp(self.socket.as_raw_fd(), buf, 0);
        }
        self.socket.recv(buf).map(|n| (n, None))
    }
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl FlowSocket for UdpFlowSocket {
    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        loop {
            return match self.recv_inner(buf) {
                Ok((0, _)) => Ok(RecvOutcome::Closed),
                Ok((len, Some(timestamp))) => {
                    Ok(RecvOutcome::Data { len, timestamp, kernel: true })
                }
                Ok((len, None)) => {
                    Ok(RecvOutcome::Data { len, timestamp: Timestamp::now(), kernel: false })
                }
                Err(e) if is_timeout(&e) => {
                    Ok(RecvOutcome::WouldBlock { timestamp: Timestamp::now() })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.socket.send(buf)?)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        wait_readable(&self.socket, timeout)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket.recv(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(config: &RxTimestampConfig) -> (UdpFlowSocket, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let flow = UdpFlowSocket::connect(peer.local_addr().unwrap(), config).unwrap();
        peer.connect(flow.local_addr().unwrap()).unwrap();
        (flow, peer)
    }

    #[test]
    fn test_recv_data() {
        let (mut flow, peer) = pair(&RxTimestampConfig::default());
        peer.send(b"hello").unwrap();
        let mut buf = [0u8; 64];
        match flow.recv(&mut buf).unwrap() {
            RecvOutcome::Data { len, kernel, .. } => {
                assert_eq!(&buf[..len], b"hello");
                assert!(!kernel);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_recv_kernel_timestamp() {
        let (mut flow, peer) = pair(&RxTimestampConfig::kernel());
        assert!(flow.kernel_timestamps());
        peer.send(b"hello").unwrap();
        let mut buf = [0u8; 64];
        match flow.recv(&mut buf).unwrap() {
            RecvOutcome::Data { len, kernel, .. } => {
                assert_eq!(len, 5);
                assert!(kernel);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_recv_timeout_and_close() {
        let (mut flow, peer) = pair(&RxTimestampConfig::default());
        flow.set_recv_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(flow.recv(&mut buf).unwrap(), RecvOutcome::WouldBlock { .. }));

        peer.send(&[]).unwrap();
        assert_eq!(flow.recv(&mut buf).unwrap(), RecvOutcome::Closed);
    }

    #[test]
    fn test_send_and_wait_readable() {
        let (mut flow, peer) = pair(&RxTimestampConfig::default());
        assert!(!flow.wait_readable(Duration::from_millis(5)).unwrap());
        flow.send(b"ack").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(peer.recv(&mut buf).unwrap(), 3);

        peer.send(b"fin").unwrap();
        assert!(flow.wait_readable(Duration::from_secs(1)).unwrap());
        assert_eq!(flow.recv_datagram(&mut buf).unwrap(), 3);
    }
}
