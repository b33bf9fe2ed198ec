//! UDP receive loop
//!
//! Each receive is decoded into a [`PacketRecord`], handed to the reporter,
//! and then classified: the loop goes on unless the datagram carried the
//! termination flag or the session deadline has passed. A zero-byte read or
//! a hard receive error also ends the flow. Only a FIN is answered with an
//! ack.

use super::ack::{build_ack, send_ack, AckOutcome};
use super::Termination;
use crate::config::AckSettings;
use crate::record::PacketRecord;
use crate::stats::{FlowSummary, Reporter};
use crate::{Error, Result};
use cadence_common::l2::{
    l2_lengths, udp_endpoints, ETHER_HEADER_LEN, IPV6_HEADER_LEN, UDP_HEADER_LEN,
};
use cadence_common::murmur3::{murmur3_32, FRAME_SEED};
use cadence_common::wire::{DATAGRAM_HEADER_LEN, ISOCH_PAYLOAD_LEN};
use cadence_common::{DatagramHeader, IsochPayload, SequenceWidth};
use cadence_transport::{FlowSocket, RecvOutcome, Timestamp};

/// Length of the two MAC addresses at the start of a frame
const MAC_PAIR_LEN: usize = 12;

/// Decoding and teardown options for one UDP flow
#[derive(Debug, Clone, Default)]
pub struct UdpFlowOptions {
    pub sequence: SequenceWidth,
    pub isochronous: bool,
    pub frame_hashes: bool,
    /// Receive length, also the ack length
    pub buffer_len: usize,
    /// End the flow after the first packet stamped later than this
    pub deadline: Option<Timestamp>,
    pub enhanced: bool,
    pub ack: AckSettings,
}

#[derive(Debug, Clone)]
pub struct UdpFlowResult {
    pub summary: FlowSummary,
    pub termination: Termination,
    pub ack: Option<AckOutcome>,
}

/// A decoded receive and where its datagram header sits in the buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classified {
    pub record: PacketRecord,
    pub header_offset: usize,
}

/// Decode a received buffer; `l2` means it holds a whole Ethernet frame
pub fn decode_datagram(
    buf: &[u8],
    l2: bool,
    options: &UdpFlowOptions,
    received: Timestamp,
    kernel_timestamp: bool,
) -> Result<Classified> {
    let mut record = PacketRecord { received, kernel_timestamp, ..PacketRecord::default() };

    let header_offset = if l2 {
        let endpoints = udp_endpoints(buf)
            .ok_or_else(|| Error::Malformed("captured frame is not a UDP datagram".into()))?;
        let lengths = l2_lengths(buf, endpoints.ip)?;
        let offset = endpoints.ip.payload_offset();
        record.l2_len = buf.len();
        record.expected_l2_len = lengths.expected_len;
        record.len = lengths.payload_len.min(buf.len().saturating_sub(offset));
        if options.frame_hashes {
            record.frame_hash = Some(murmur3_32(buf, FRAME_SEED, true));
            record.mac_hash = Some(murmur3_32(&buf[..MAC_PAIR_LEN], FRAME_SEED, true));
        }
        offset
    } else {
        record.len = buf.len();
        0
    };

    let payload = buf.get(header_offset..).ok_or_else(|| {
        Error::Malformed(format!("{} byte frame ends inside its headers", buf.len()))
    })?;
    let header = DatagramHeader::decode(payload, options.sequence)?;
    record.packet_id = header.id.value;
    record.terminal = header.id.terminal;
    record.sent = Timestamp::from_wire(header.sent.sec, header.sent.usec);

    // A FIN carries no frame descriptor
    if options.isochronous
        && !record.terminal
        && payload.len() >= DATAGRAM_HEADER_LEN + ISOCH_PAYLOAD_LEN
    {
        record.isoch = Some(IsochPayload::decode(payload)?);
    }

    Ok(Classified { record, header_offset })
}

/// Whether `record` ends the flow
pub fn classify(record: &PacketRecord, deadline: Option<Timestamp>) -> Option<Termination> {
    if record.terminal {
        Some(Termination::Fin)
    } else if deadline.is_some_and(|d| d.before(&record.received)) {
        Some(Termination::Deadline)
    } else {
        None
    }
}

/// Receive a flow until it terminates, then close the reporter and ack a FIN
pub fn run_udp_flow<S, R>(
    socket: &mut S,
    reporter: &mut R,
    options: &UdpFlowOptions,
) -> Result<UdpFlowResult>
where
    S: FlowSocket + ?Sized,
    R: Reporter + ?Sized,
{
    let l2 = socket.l2_frames();
    let capacity = if l2 {
        options.buffer_len + ETHER_HEADER_LEN + IPV6_HEADER_LEN + UDP_HEADER_LEN
    } else {
        options.buffer_len
    };
    let mut buf = vec![0u8; capacity.max(DATAGRAM_HEADER_LEN)];
    let mut fin = [0u8; DATAGRAM_HEADER_LEN];
    let mut last = Timestamp::now();

    let termination = loop {
        match socket.recv(&mut buf) {
            Err(e) => {
                tracing::debug!("Receive failed, ending flow: {}", e);
                break Termination::ReadError;
            }
            Ok(RecvOutcome::Closed) => break Termination::Closed,
            Ok(RecvOutcome::WouldBlock { timestamp }) => {
                let record = PacketRecord::empty(timestamp);
                reporter.report_packet(&record);
                if let Some(t) = classify(&record, options.deadline) {
                    last = timestamp;
                    break t;
                }
            }
            Ok(RecvOutcome::Data { len, timestamp, kernel }) => {
                let decoded = decode_datagram(&buf[..len], l2, options, timestamp, kernel);
                let classified = match decoded {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!("Dropping malformed datagram: {}", e);
                        continue;
                    }
                };
                let record = classified.record;
                tracing::trace!("datagram {} ({} bytes)", record.packet_id, record.len);
                reporter.report_packet(&record);
                last = timestamp;

                if let Some(t) = classify(&record, options.deadline) {
                    if t == Termination::Fin {
                        let start = classified.header_offset;
                        fin.copy_from_slice(&buf[start..start + DATAGRAM_HEADER_LEN]);
                    }
                    break t;
                }
            }
        }
    };

    let summary = reporter.close(last);
    let ack = if termination == Termination::Fin {
        match socket.discard_delivered() {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Discarded {} captured datagram(s) before the ack", n),
            Err(e) => tracing::debug!("Could not drain datagram socket: {}", e),
        }
        let header = summary.server_header(options.enhanced);
        let ack = build_ack(&fin, &header, options.sequence, options.buffer_len)?;
        match send_ack(socket, &ack, options.sequence, &options.ack) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!("Failed to send ack: {}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(UdpFlowResult { summary, termination, ack })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::stats::{FlowReporter, ReportSettings};
    use cadence_common::{PacketId, SentTime, ServerHeader};
    use std::collections::VecDeque;
    use std::time::Duration;

    fn payload(id: PacketId, width: SequenceWidth, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        DatagramHeader { id, sent: SentTime { sec: 100, usec: 0 } }
            .encode(&mut buf, width)
            .unwrap();
        buf
    }

    /// Replays a fixed script of receive outcomes
    struct Scripted {
        script: VecDeque<std::result::Result<Vec<u8>, ()>>,
        sent: Vec<Vec<u8>>,
    }

    impl FlowSocket for Scripted {
        fn recv(&mut self, buf: &mut [u8]) -> cadence_transport::Result<RecvOutcome> {
            let timestamp = Timestamp::new(100, 1_000);
            match self.script.pop_front() {
                Some(Ok(data)) if data.is_empty() => Ok(RecvOutcome::WouldBlock { timestamp }),
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(RecvOutcome::Data { len: data.len(), timestamp, kernel: false })
                }
                Some(Err(())) => Err(cadence_transport::Error::Connection("reset".into())),
                None => Ok(RecvOutcome::Closed),
            }
        }

        fn send(&mut self, buf: &[u8]) -> cadence_transport::Result<usize> {
            self.sent.push(buf.to_vec());
            Ok(buf.len())
        }

        fn wait_readable(&mut self, _timeout: Duration) -> cadence_transport::Result<bool> {
            Ok(false)
        }

        fn recv_datagram(&mut self, _buf: &mut [u8]) -> cadence_transport::Result<usize> {
            Ok(0)
        }
    }

    /// Ethernet/IPv4/UDP frame from 10.0.0.1 to 10.0.0.2 around `data`
    fn ipv4_frame(data: &[u8], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 42];
        frame[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[14] = 0x45;
        frame[16..18].copy_from_slice(&((20 + 8 + data.len()) as u16).to_be_bytes());
        frame[22] = 64;
        frame[23] = 17;
        frame[26..30].copy_from_slice(&[10, 0, 0, 1]);
        frame[30..34].copy_from_slice(&[10, 0, 0, 2]);
        frame[34..36].copy_from_slice(&src_port.to_be_bytes());
        frame[36..38].copy_from_slice(&dst_port.to_be_bytes());
        frame[38..40].copy_from_slice(&((8 + data.len()) as u16).to_be_bytes());
        frame.extend_from_slice(data);
        frame
    }

    fn reporter() -> FlowReporter {
        FlowReporter::new("test", Protocol::Udp, &ReportSettings::default()).unwrap()
    }

    fn options() -> UdpFlowOptions {
        UdpFlowOptions { buffer_len: 128, ..Default::default() }
    }

    #[test]
    fn test_decode_32bit_termination() {
        let buf = payload(PacketId::terminal(0x7fff_ffff), SequenceWidth::Bits32, 64);
        assert_eq!(&buf[..4], &[0xff, 0xff, 0xff, 0xff]);
        let c = decode_datagram(&buf, false, &options(), Timestamp::new(100, 5), true).unwrap();
        assert_eq!(c.record.packet_id, 0x7fff_ffff);
        assert!(c.record.terminal);
        assert!(c.record.kernel_timestamp);
        assert_eq!(c.record.len, 64);
        assert_eq!(c.record.sent, Timestamp::new(100, 0));
        assert_eq!(classify(&c.record, None), Some(Termination::Fin));
    }

    #[test]
    fn test_decode_64bit_sequence() {
        let opts = UdpFlowOptions { sequence: SequenceWidth::Bits64, ..options() };
        let buf = payload(PacketId::new(0x1_0000_0005), SequenceWidth::Bits64, 32);
        let c = decode_datagram(&buf, false, &opts, Timestamp::new(100, 5), false).unwrap();
        assert_eq!(c.record.packet_id, 0x1_0000_0005);
        assert!(!c.record.terminal);
        assert_eq!(classify(&c.record, None), None);
    }

    #[test]
    fn test_decode_isochronous_descriptor() {
        let opts = UdpFlowOptions { isochronous: true, ..options() };
        let mut buf = payload(PacketId::new(3), SequenceWidth::Bits32, 40);
        let isoch =
            IsochPayload { frame_id: 9, prev_frame_id: 8, burst_size: 4000, remaining: 1200 };
        isoch.encode(&mut buf).unwrap();
        let c = decode_datagram(&buf, false, &opts, Timestamp::new(100, 5), false).unwrap();
        assert_eq!(c.record.isoch, Some(isoch));

        // Too short for a descriptor: decoded without one
        let short = payload(PacketId::new(4), SequenceWidth::Bits32, 20);
        let c = decode_datagram(&short, false, &opts, Timestamp::new(100, 5), false).unwrap();
        assert_eq!(c.record.isoch, None);
    }

    #[test]
    fn test_decode_frame() {
        let opts = UdpFlowOptions { frame_hashes: true, ..options() };
        let data = payload(PacketId::new(12), SequenceWidth::Bits32, 100);
        let frame = ipv4_frame(&data, 40000, 5001);
        let c = decode_datagram(&frame, true, &opts, Timestamp::new(100, 5), false).unwrap();
        assert_eq!(c.header_offset, 42);
        assert_eq!(c.record.packet_id, 12);
        assert_eq!(c.record.len, 100);
        assert_eq!(c.record.l2_len, frame.len());
        assert_eq!(c.record.expected_l2_len, 142);
        assert!(!c.record.l2_mismatch());
        assert!(c.record.frame_hash.is_some());
        assert!(c.record.mac_hash.is_some());

        assert!(decode_datagram(&data, true, &opts, Timestamp::new(100, 5), false).is_err());
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let short = decode_datagram(&[0u8; 10], false, &options(), Timestamp::default(), false);
        assert!(short.is_err());
    }

    #[test]
    fn test_frame_cut_inside_udp_header_rejected() {
        let frame = ipv4_frame(&[], 40000, 5001);
        for len in [40, 41] {
            let cut = decode_datagram(&frame[..len], true, &options(), Timestamp::default(), false);
            assert!(matches!(cut, Err(Error::Malformed(_))), "{len} byte frame decoded");
        }
    }

    #[test]
    fn test_deadline_classification() {
        let record = PacketRecord { received: Timestamp::new(10, 1), ..Default::default() };
        assert_eq!(classify(&record, Some(Timestamp::new(10, 1))), None);
        assert_eq!(classify(&record, Some(Timestamp::new(10, 0))), Some(Termination::Deadline));
        let empty = PacketRecord::empty(Timestamp::new(11, 0));
        assert_eq!(classify(&empty, Some(Timestamp::new(10, 0))), Some(Termination::Deadline));
    }

    #[test]
    fn test_flow_ends_on_fin_and_acks() {
        let width = SequenceWidth::Bits32;
        let mut socket = Scripted {
            script: VecDeque::from(vec![
                Ok(payload(PacketId::new(1), width, 100)),
                Ok(Vec::new()),
                Ok(payload(PacketId::new(2), width, 100)),
                Ok(payload(PacketId::terminal(3), width, 100)),
                Ok(payload(PacketId::new(4), width, 100)),
            ]),
            sent: Vec::new(),
        };
        let mut reporter = reporter();
        let result = run_udp_flow(&mut socket, &mut reporter, &options()).unwrap();

        assert_eq!(result.termination, Termination::Fin);
        assert_eq!(result.summary.datagrams, 3);
        assert_eq!(result.ack, Some(AckOutcome::Delivered { rounds: 1 }));
        // The datagram after the FIN was never read
        assert_eq!(socket.script.len(), 1);

        let ack = &socket.sent[0];
        assert_eq!(ack.len(), 128);
        assert_eq!(&ack[..4], &[0x80, 0, 0, 3]);
        let header = ServerHeader::decode(&ack[DATAGRAM_HEADER_LEN..], width).unwrap();
        assert_eq!(header.datagrams, 3);
        assert_eq!(header.total_len, 300);
        assert_eq!(header.error_cnt, 0);
    }

    #[test]
    fn test_flow_ends_on_read_error_without_ack() {
        let mut socket = Scripted {
            script: VecDeque::from(vec![
                Ok(payload(PacketId::new(1), SequenceWidth::Bits32, 50)),
                Err(()),
            ]),
            sent: Vec::new(),
        };
        let result = run_udp_flow(&mut socket, &mut reporter(), &options()).unwrap();
        assert_eq!(result.termination, Termination::ReadError);
        assert_eq!(result.summary.datagrams, 1);
        assert!(result.ack.is_none());
        assert!(socket.sent.is_empty());
    }

    #[test]
    fn test_flow_ends_on_close_and_skips_garbage() {
        let mut socket = Scripted {
            script: VecDeque::from(vec![
                Ok(vec![1, 2, 3]),
                Ok(payload(PacketId::new(1), SequenceWidth::Bits32, 50)),
            ]),
            sent: Vec::new(),
        };
        let result = run_udp_flow(&mut socket, &mut reporter(), &options()).unwrap();
        assert_eq!(result.termination, Termination::Closed);
        assert_eq!(result.summary.datagrams, 1);
    }

    #[test]
    fn test_flow_ends_at_deadline() {
        let opts = UdpFlowOptions { deadline: Some(Timestamp::new(99, 0)), ..options() };
        let mut socket = Scripted {
            script: VecDeque::from(vec![
                Ok(payload(PacketId::new(1), SequenceWidth::Bits32, 50)),
                Ok(payload(PacketId::new(2), SequenceWidth::Bits32, 50)),
            ]),
            sent: Vec::new(),
        };
        let result = run_udp_flow(&mut socket, &mut reporter(), &opts).unwrap();
        assert_eq!(result.termination, Termination::Deadline);
        // The packet past the deadline is still reported
        assert_eq!(result.summary.datagrams, 1);
        assert!(result.ack.is_none());
    }
}
