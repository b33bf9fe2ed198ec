//! Per-receive packet records handed to reporters

use cadence_common::IsochPayload;
use cadence_transport::Timestamp;

/// Everything the receive loop learned from one receive call
///
/// An empty record stands for a receive that timed out; only its
/// `received` time is meaningful. Reporters use it to flush interval
/// reports on a stalled flow.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacketRecord {
    /// Sequence number with the termination flag removed
    pub packet_id: u64,
    pub terminal: bool,
    /// Sender wall clock from the datagram header
    pub sent: Timestamp,
    /// Receiver wall clock at arrival
    pub received: Timestamp,
    /// `received` came from kernel ancillary data
    pub kernel_timestamp: bool,
    /// Bytes read (payload for sockets, whole frame for captures)
    pub len: usize,
    /// Captured frame length, zero without L2 checks
    pub l2_len: usize,
    /// Frame length implied by the UDP header, zero without L2 checks
    pub expected_l2_len: usize,
    pub isoch: Option<IsochPayload>,
    pub empty: bool,
    /// Murmur3 of the whole captured frame
    pub frame_hash: Option<u32>,
    /// Murmur3 of the destination and source MAC addresses
    pub mac_hash: Option<u32>,
}

impl PacketRecord {
    /// Record for a receive that produced no data
    pub fn empty(received: Timestamp) -> Self {
        Self { received, empty: true, ..Self::default() }
    }

    /// Record for a stream read, which carries no header
    pub fn stream(len: usize, received: Timestamp) -> Self {
        Self { len, received, ..Self::default() }
    }

    /// One-way transit time in seconds
    pub fn transit(&self) -> f64 {
        self.received.sub_secs(&self.sent)
    }

    /// Captured frame length disagrees with the UDP header
    pub fn l2_mismatch(&self) -> bool {
        self.l2_len != 0 && self.l2_len != self.expected_l2_len
    }
}
