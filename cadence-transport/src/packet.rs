//! AF_PACKET capture for link-layer frame checks (Linux only)
//!
//! When L2 checks are enabled a flow is read from a packet socket bound to an
//! interface, so the receive buffer holds the complete Ethernet frame. The
//! capture sees every frame on the interface; anything that is not a UDP
//! datagram from the flow's peer to the flow's port is dropped here, and so
//! is the copy of every frame the host transmits itself (on loopback each
//! datagram is seen once leaving and once arriving). Replies (the ack) still
//! go out on the regular UDP socket.

use crate::rx_timestamp;
use crate::udp::{is_timeout, FlowSocket, RecvOutcome, RxTimestampConfig, UdpFlowSocket};
use crate::{Error, Result, Timestamp};
use cadence_common::l2::udp_endpoints;
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockProtocol, SockType};
use nix::sys::time::TimeVal;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::{Duration, Instant};

/// `linux/if_packet.h`
const PACKET_IGNORE_OUTGOING: libc::c_int = 23;

/// Whether a captured frame was transmitted by this host
pub fn is_outgoing(source: &libc::sockaddr_ll) -> bool {
    source.sll_pkttype == libc::PACKET_OUTGOING as u8
}

pub struct PacketFlowSocket {
    packet: OwnedFd,
    datagram: UdpFlowSocket,
    peer: SocketAddr,
    local_port: u16,
    kernel_timestamps: bool,
    recv_timeout: Option<Duration>,
}

impl PacketFlowSocket {
    /// Open a capture on `interface` for the flow carried by `datagram`
    pub fn open(
        interface: &str,
        datagram: UdpFlowSocket,
        config: &RxTimestampConfig,
    ) -> Result<Self> {
        let packet = socket::socket(
            AddressFamily::Packet,
            SockType::Raw,
            SockFlag::empty(),
            SockProtocol::EthAll,
        )
        .map_err(|e| {
            Error::Setup(format!("Failed to open packet socket (needs CAP_NET_RAW): {e}"))
        })?;

        let ifindex = nix::net::if_::if_nametoindex(interface)
            .map_err(|e| Error::Setup(format!("Unknown interface '{}': {}", interface, e)))?;

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex as i32;
        let ret = unsafe {
            libc::bind(
                packet.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Setup(format!(
                "Failed to bind packet socket to '{}': {}",
                interface,
                io::Error::last_os_error()
            )));
        }

        // Linux 4.20+; older kernels fall back to the per-frame check in recv
        let ignore = 1 as libc::c_int;
        let ret = unsafe {
            libc::setsockopt(
                packet.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_IGNORE_OUTGOING,
                &ignore as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            tracing::debug!("PACKET_IGNORE_OUTGOING unavailable: {}", io::Error::last_os_error());
        }

        let kernel_timestamps = config.kernel
            && match rx_timestamp::enable_rx_timestamping(packet.as_raw_fd(), config.hardware) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Could not enable capture timestamps: {}", e);
                    false
                }
            };

        let peer = datagram.peer_addr();
        let local_port = datagram.local_addr()?.port();
        tracing::debug!("L2 capture on {} for {} -> port {}", interface, peer, local_port);

        Ok(Self {
            packet,
            datagram,
            peer,
            local_port,
            kernel_timestamps,
            recv_timeout: None,
        })
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        let tv = match timeout {
            Some(t) => TimeVal::new(t.as_secs() as _, t.subsec_micros() as _),
            None => TimeVal::new(0, 0),
        };
        socket::setsockopt(&self.packet, sockopt::ReceiveTimeout, &tv)?;
        self.recv_timeout = timeout;
        Ok(())
    }

    fn belongs_to_flow(&self, frame: &[u8]) -> bool {
        match udp_endpoints(frame) {
            Some(ep) => {
                ep.src == self.peer.ip()
                    && ep.src_port == self.peer.port()
                    && ep.dst_port == self.local_port
            }
            None => false,
        }
    }
}

impl FlowSocket for PacketFlowSocket {
    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        let start = Instant::now();
        loop {
            let mut source: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let received =
                rx_timestamp::recvmsg_with_source(self.packet.as_raw_fd(), buf, 0, &mut source);

            match received {
                Ok((0, _)) => return Ok(RecvOutcome::Closed),
                Ok((len, timestamp)) => {
                    if !is_outgoing(&source) && self.belongs_to_flow(&buf[..len]) {
                        let timestamp = timestamp.filter(|_| self.kernel_timestamps);
                        let kernel = timestamp.is_some();
                        let timestamp = timestamp.unwrap_or_else(Timestamp::now);
                        return Ok(RecvOutcome::Data { len, timestamp, kernel });
                    }
                    // Foreign traffic must not hold off the flow's timeout
                    if self.recv_timeout.is_some_and(|t| start.elapsed() >= t) {
                        return Ok(RecvOutcome::WouldBlock { timestamp: Timestamp::now() });
                    }
                }
                Err(e) if is_timeout(&e) => {
                    return Ok(RecvOutcome::WouldBlock { timestamp: Timestamp::now() });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.datagram.send(buf)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        self.datagram.wait_readable(timeout)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.datagram.recv_datagram(buf)
    }

    fn l2_frames(&self) -> bool {
        true
    }

    /// The datagram socket queues a copy of every frame the capture returned
    fn discard_delivered(&mut self) -> Result<usize> {
        let mut scratch = [0u8; 64];
        let mut dropped = 0;
        while self.datagram.wait_readable(Duration::ZERO)? {
            match self.datagram.recv_datagram(&mut scratch) {
                Ok(_) => dropped += 1,
                Err(e) => {
                    tracing::debug!("Stopped draining datagram socket: {}", e);
                    break;
                }
            }
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_frames_recognized() {
        let mut source: libc::sockaddr_ll = unsafe { mem::zeroed() };
        source.sll_pkttype = libc::PACKET_HOST as u8;
        assert!(!is_outgoing(&source));
        source.sll_pkttype = libc::PACKET_OUTGOING as u8;
        assert!(is_outgoing(&source));
    }
}
