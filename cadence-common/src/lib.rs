//! Common formats for cadence
//!
//! This crate provides the byte-level layouts shared by the sender and the
//! receiver:
//! - `wire`: datagram header, isochronous frame descriptor, ack server header
//! - `l2`: Ethernet/IP/UDP header arithmetic for captured frames
//! - `murmur3`: frame fingerprints

pub mod l2;
pub mod murmur3;
pub mod wire;

pub use l2::{IpVersion, L2Lengths, UdpEndpoints};
pub use murmur3::murmur3_32;
pub use wire::{
    DatagramHeader, IsochPayload, PacketId, SentTime, SequenceWidth, ServerHeader,
    TransitExtension, WireError,
};
