//! Link-layer frame arithmetic
//!
//! When L2 checks are enabled the receive buffer holds a whole Ethernet frame:
//!
//! ```text
//! {Ethernet header}{IPv4 | IPv6 header}{UDP header}{datagram payload}
//! ```
//!
//! IP headers are treated as fixed-size (no IPv4 options, no IPv6 extension
//! headers). The expected frame length is recomputed from the UDP length field
//! so a reporter can account for truncated or padded frames.

use crate::wire::{read_u16, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const ETHER_HEADER_LEN: usize = 14;
pub const ETHER_MAX_LEN: usize = 1518;
pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
const IPPROTO_UDP: u8 = 17;

/// Network-layer version of the captured frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl IpVersion {
    pub const fn header_len(self) -> usize {
        match self {
            IpVersion::V4 => IPV4_HEADER_LEN,
            IpVersion::V6 => IPV6_HEADER_LEN,
        }
    }

    /// Offset of the UDP header from the start of the frame
    pub const fn l4_offset(self) -> usize {
        ETHER_HEADER_LEN + self.header_len()
    }

    /// Offset of the datagram payload from the start of the frame
    pub const fn payload_offset(self) -> usize {
        self.l4_offset() + UDP_HEADER_LEN
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

/// Lengths derived from a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct L2Lengths {
    /// UDP payload length according to the UDP header
    pub payload_len: usize,
    /// Frame length implied by the UDP header and fixed L2/L3 header sizes
    pub expected_len: usize,
}

/// Recompute the expected frame length from the UDP length field
pub fn l2_lengths(frame: &[u8], ip: IpVersion) -> Result<L2Lengths> {
    let l4_offset = ip.l4_offset();
    let udp_len = usize::from(read_u16(frame, l4_offset + 4)?);
    let payload_len = udp_len.saturating_sub(UDP_HEADER_LEN);
    Ok(L2Lengths {
        payload_len,
        expected_len: payload_len + l4_offset + UDP_HEADER_LEN,
    })
}

/// UDP addressing extracted from a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpEndpoints {
    pub ip: IpVersion,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Parse the addressing of a UDP frame, `None` for anything else
pub fn udp_endpoints(frame: &[u8]) -> Option<UdpEndpoints> {
    let ethertype = read_u16(frame, 12).ok()?;
    let (ip, src, dst) = match ethertype {
        ETHERTYPE_IPV4 => {
            let base = ETHER_HEADER_LEN;
            if frame.len() < base + IPV4_HEADER_LEN || frame[base + 9] != IPPROTO_UDP {
                return None;
            }
            let src: [u8; 4] = frame[base + 12..base + 16].try_into().ok()?;
            let dst: [u8; 4] = frame[base + 16..base + 20].try_into().ok()?;
            (IpVersion::V4, IpAddr::V4(Ipv4Addr::from(src)), IpAddr::V4(Ipv4Addr::from(dst)))
        }
        ETHERTYPE_IPV6 => {
            let base = ETHER_HEADER_LEN;
            if frame.len() < base + IPV6_HEADER_LEN || frame[base + 6] != IPPROTO_UDP {
                return None;
            }
            let src: [u8; 16] = frame[base + 8..base + 24].try_into().ok()?;
            let dst: [u8; 16] = frame[base + 24..base + 40].try_into().ok()?;
            (IpVersion::V6, IpAddr::V6(Ipv6Addr::from(src)), IpAddr::V6(Ipv6Addr::from(dst)))
        }
        _ => return None,
    };

    // A frame cut inside the UDP header carries no datagram
    if frame.len() < ip.payload_offset() {
        return None;
    }
    let l4 = ip.l4_offset();
    Some(UdpEndpoints {
        ip,
        src,
        dst,
        src_port: read_u16(frame, l4).ok()?,
        dst_port: read_u16(frame, l4 + 2).ok()?,
    })
}
