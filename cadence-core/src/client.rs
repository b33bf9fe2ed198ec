//! Traffic generator
//!
//! Emission is paced by a [`FrameCounter`]. In bandwidth mode every tick
//! sends one datagram, at `rate / (8 * buffer_len)` ticks per second. In
//! isochronous mode every tick is a frame of `rate / (8 * fps)` bytes sent
//! as a back-to-back burst, each datagram carrying the frame descriptor.
//!
//! Sequence numbers start at 1. A UDP flow ends with a FIN, the next
//! sequence number with the termination flag set, which is retransmitted
//! until the receiver's ack arrives or the attempts run out.

use crate::config::{ClientSettings, Protocol};
use crate::timing::FrameCounter;
use crate::Result;
use cadence_common::wire::{DATAGRAM_HEADER_LEN, ISOCH_PAYLOAD_LEN};
use cadence_common::{
    DatagramHeader, IsochPayload, PacketId, SentTime, SequenceWidth, ServerHeader,
};
use cadence_transport::{FlowSocket, RxTimestampConfig, TcpFlowStream, Timestamp, UdpFlowSocket};
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the sender did, plus the receiver's view when it acked
#[derive(Debug, Clone, PartialEq)]
pub struct ClientReport {
    pub protocol: Protocol,
    pub datagrams: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Ticks whose deadline had already passed
    pub slips: u64,
    pub frames: u64,
    /// FINs sent before the ack arrived
    pub fin_attempts: u32,
    pub ack: Option<ServerHeader>,
}

impl ClientReport {
    /// Offered bits per second
    pub fn bandwidth(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 * 8.0 / secs
        } else {
            0.0
        }
    }
}

pub struct Client {
    settings: ClientSettings,
}

fn stamp(buf: &mut [u8], id: PacketId, width: SequenceWidth) -> Result<()> {
    let (sec, usec) = Timestamp::now().to_wire();
    DatagramHeader { id, sent: SentTime { sec, usec } }.encode(buf, width)?;
    Ok(())
}

impl Client {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn run(&self) -> Result<ClientReport> {
        let report = match self.settings.protocol {
            Protocol::Udp => self.run_udp()?,
            Protocol::Tcp => self.run_tcp()?,
        };
        tracing::info!(
            "Sent {} bytes in {:.2} sec ({:.0} bits/sec), {} slips",
            report.bytes,
            report.elapsed.as_secs_f64(),
            report.bandwidth(),
            report.slips
        );
        Ok(report)
    }

    fn run_udp(&self) -> Result<ClientReport> {
        let s = &self.settings;
        let mut socket = UdpFlowSocket::connect(s.target, &RxTimestampConfig::default())?;
        tracing::info!("Sending UDP to {} for {:?}", s.target, s.duration);

        let mut report = ClientReport {
            protocol: Protocol::Udp,
            datagrams: 0,
            bytes: 0,
            elapsed: Duration::ZERO,
            slips: 0,
            frames: 0,
            fin_attempts: 0,
            ack: None,
        };
        let mut buf = vec![0u8; s.buffer_len];
        let mut id = 1u64;
        let start = Instant::now();

        match s.frame_bytes() {
            None => {
                let mut fc = FrameCounter::with_strategy(s.packet_rate(), s.delay_strategy)?;
                while start.elapsed() < s.duration {
                    fc.wait_tick();
                    stamp(&mut buf, PacketId::new(id), s.sequence)?;
                    id += 1;
                    self.send(&mut socket, &buf, &mut report);
                }
                report.slips = fc.slip_count();
            }
            Some(frame_bytes) => {
                let fps = s.isochronous.as_ref().map_or(60.0, |i| i.fps);
                let mut fc = FrameCounter::with_strategy(fps, s.delay_strategy)?;
                let mut prev_frame = 0u32;
                while start.elapsed() < s.duration {
                    let frame = fc.wait_tick() as u32;
                    if fc.slip() {
                        tracing::debug!("Frame {} started late", frame);
                        fc.clear_slip();
                    }
                    let mut remaining = frame_bytes;
                    while remaining > 0 {
                        let len = (remaining as usize).min(s.buffer_len);
                        remaining -= len as u64;
                        stamp(&mut buf, PacketId::new(id), s.sequence)?;
                        id += 1;
                        IsochPayload {
                            frame_id: frame,
                            prev_frame_id: prev_frame,
                            burst_size: frame_bytes as u32,
                            remaining: remaining as u32,
                        }
                        .encode(&mut buf)?;
                        let wire_len = len.max(DATAGRAM_HEADER_LEN + ISOCH_PAYLOAD_LEN);
                        self.send(&mut socket, &buf[..wire_len], &mut report);
                    }
                    prev_frame = frame;
                    report.frames += 1;
                }
                report.slips = fc.slip_count();
            }
        }
        report.elapsed = start.elapsed();

        let (attempts, ack) = self.finish(&mut socket, id)?;
        report.fin_attempts = attempts;
        report.ack = ack;
        Ok(report)
    }

    fn send(&self, socket: &mut UdpFlowSocket, buf: &[u8], report: &mut ClientReport) {
        match socket.send(buf) {
            Ok(n) => {
                report.datagrams += 1;
                report.bytes += n as u64;
            }
            // An unreachable port shows up as a refused send on a connected socket
            Err(e) => tracing::trace!("Send failed: {}", e),
        }
    }

    /// Send the FIN until the ack arrives
    fn finish(&self, socket: &mut UdpFlowSocket, id: u64) -> Result<(u32, Option<ServerHeader>)> {
        let s = &self.settings;
        let mut fin = vec![0u8; s.buffer_len];
        let mut ack = vec![0u8; s.buffer_len.max(DATAGRAM_HEADER_LEN + 256)];

        for attempt in 1..=s.fin_attempts {
            stamp(&mut fin, PacketId::terminal(id), s.sequence)?;
            if let Err(e) = socket.send(&fin) {
                tracing::debug!("FIN {} not sent: {}", attempt, e);
            }
            if !socket.wait_readable(s.fin_wait)? {
                continue;
            }
            match socket.recv_datagram(&mut ack) {
                Ok(n) if n > DATAGRAM_HEADER_LEN => {
                    let echoed = PacketId::decode(&ack[..n], s.sequence)?;
                    if !echoed.terminal {
                        continue;
                    }
                    match ServerHeader::decode(&ack[DATAGRAM_HEADER_LEN..n], s.sequence) {
                        Ok(header) => {
                            log_ack(&header);
                            return Ok((attempt, Some(header)));
                        }
                        Err(e) => tracing::debug!("Malformed ack: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Waiting for ack: {}", e),
            }
        }
        tracing::warn!("No ack from {} after {} FINs", s.target, s.fin_attempts);
        Ok((s.fin_attempts, None))
    }

    fn run_tcp(&self) -> Result<ClientReport> {
        let s = &self.settings;
        let mut stream = TcpFlowStream::connect(&s.target, CONNECT_TIMEOUT)?;
        tracing::info!("Sending TCP to {} for {:?}", s.target, s.duration);

        let buf = vec![0u8; s.buffer_len];
        let mut fc = FrameCounter::with_strategy(s.packet_rate(), s.delay_strategy)?;
        let mut bytes = 0u64;
        let mut writes = 0u64;
        let start = Instant::now();
        while start.elapsed() < s.duration {
            fc.wait_tick();
            stream.send_all(&buf)?;
            bytes += buf.len() as u64;
            writes += 1;
        }
        let elapsed = start.elapsed();
        stream.shutdown()?;

        Ok(ClientReport {
            protocol: Protocol::Tcp,
            datagrams: writes,
            bytes,
            elapsed,
            slips: fc.slip_count(),
            frames: 0,
            fin_attempts: 0,
            ack: None,
        })
    }
}

fn log_ack(header: &ServerHeader) {
    let bandwidth =
        if header.stop_time > 0.0 { header.total_len as f64 * 8.0 / header.stop_time } else { 0.0 };
    tracing::info!(
        "Server report: {} bytes in {:.2} sec ({:.0} bits/sec) jitter {:.3} ms {}/{} lost {} out-of-order",
        header.total_len,
        header.stop_time,
        bandwidth,
        header.jitter * 1e3,
        header.error_cnt,
        header.datagrams,
        header.outorder_cnt
    );
    if let Some(ext) = &header.extend {
        tracing::info!(
            "Server transit mean/min/max {:.3}/{:.3}/{:.3} ms over {} samples",
            ext.mean * 1e3,
            ext.min * 1e3,
            ext.max * 1e3,
            ext.count
        );
    }
}
