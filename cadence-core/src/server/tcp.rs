//! TCP receive loop
//!
//! Reads until the peer closes, a read fails, or the session deadline
//! passes. With a read rate set, reads are paced by a token bucket filled
//! at `rate / 8` bytes per second: a read is issued only while the bucket
//! is non-negative and drains it by the bytes read.

use super::udp::classify;
use super::Termination;
use crate::record::PacketRecord;
use crate::stats::{FlowSummary, Reporter};
use crate::timing::{time_ns, Delay, DelayStrategy};
use crate::Result;
use cadence_transport::{RecvOutcome, TcpFlowStream, Timestamp};

/// Wait between token bucket refills
const TOKEN_WAIT_US: u64 = 4;

#[derive(Debug, Clone, Default)]
pub struct TcpFlowOptions {
    pub buffer_len: usize,
    pub deadline: Option<Timestamp>,
    /// Read-side pacing in bits per second
    pub read_rate: Option<u64>,
    pub delay_strategy: DelayStrategy,
}

#[derive(Debug, Clone)]
pub struct TcpFlowResult {
    pub summary: FlowSummary,
    pub termination: Termination,
}

struct TokenBucket {
    bytes_per_sec: f64,
    tokens: f64,
    last_fill: u64,
}

impl TokenBucket {
    fn new(bits_per_sec: u64) -> Self {
        Self { bytes_per_sec: bits_per_sec as f64 / 8.0, tokens: 0.0, last_fill: time_ns() }
    }

    /// Refill and report whether a read may be issued
    fn ready(&mut self) -> bool {
        let now = time_ns();
        self.tokens += now.saturating_sub(self.last_fill) as f64 / 1e9 * self.bytes_per_sec;
        self.last_fill = now;
        self.tokens >= 0.0
    }

    fn consume(&mut self, bytes: usize) {
        self.tokens -= bytes as f64;
    }
}

pub fn run_tcp_flow<R: Reporter + ?Sized>(
    stream: &mut TcpFlowStream,
    reporter: &mut R,
    options: &TcpFlowOptions,
) -> Result<TcpFlowResult> {
    let mut buf = vec![0u8; options.buffer_len.max(1)];
    let mut bucket = options.read_rate.map(TokenBucket::new);
    let mut delay = Delay::new(options.delay_strategy);
    let mut last = Timestamp::now();

    let termination = loop {
        if let Some(bucket) = bucket.as_mut() {
            if !bucket.ready() {
                delay.delay_us(TOKEN_WAIT_US);
                continue;
            }
        }

        let record = match stream.recv(&mut buf) {
            Err(e) => {
                tracing::debug!("Read failed, ending flow: {}", e);
                break Termination::ReadError;
            }
            Ok(RecvOutcome::Closed) => break Termination::Closed,
            Ok(RecvOutcome::WouldBlock { timestamp }) => PacketRecord::empty(timestamp),
            Ok(RecvOutcome::Data { len, timestamp, .. }) => {
                if let Some(bucket) = bucket.as_mut() {
                    bucket.consume(len);
                }
                PacketRecord::stream(len, timestamp)
            }
        };
        reporter.report_packet(&record);
        last = record.received;
        if let Some(t) = classify(&record, options.deadline) {
            break t;
        }
    };

    let summary = reporter.close(last);
    Ok(TcpFlowResult { summary, termination })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::stats::{FlowReporter, ReportSettings};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    fn pair() -> (TcpFlowStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TcpFlowStream::new(server).unwrap(), client)
    }

    fn reporter() -> FlowReporter {
        FlowReporter::new("tcp", Protocol::Tcp, &ReportSettings::default()).unwrap()
    }

    #[test]
    fn test_reads_until_close() {
        let (mut server, mut client) = pair();
        let writer = std::thread::spawn(move || {
            client.write_all(&[7u8; 10_000]).unwrap();
        });
        let options = TcpFlowOptions { buffer_len: 4096, ..Default::default() };
        let result = run_tcp_flow(&mut server, &mut reporter(), &options).unwrap();
        writer.join().unwrap();

        assert_eq!(result.termination, Termination::Closed);
        assert_eq!(result.summary.total_bytes, 10_000);
        assert_eq!(result.summary.datagrams, 0);
    }

    #[test]
    fn test_deadline_ends_idle_flow() {
        let (mut server, _client) = pair();
        server.set_recv_timeout(Some(Duration::from_millis(20))).unwrap();
        let options = TcpFlowOptions {
            buffer_len: 1024,
            deadline: Some(Timestamp::now().add(Duration::from_millis(50))),
            ..Default::default()
        };
        let result = run_tcp_flow(&mut server, &mut reporter(), &options).unwrap();
        assert_eq!(result.termination, Termination::Deadline);
        assert_eq!(result.summary.total_bytes, 0);
    }

    #[test]
    #[cfg(not(tarpaulin))]
    fn test_read_rate_paces_reads() {
        let (mut server, mut client) = pair();
        let writer = std::thread::spawn(move || {
            client.write_all(&[1u8; 20_000]).unwrap();
        });
        // 100 kB/s with 1000-byte reads
        let options = TcpFlowOptions {
            buffer_len: 1000,
            read_rate: Some(800_000),
            delay_strategy: DelayStrategy::Hybrid,
            ..Default::default()
        };
        let start = Instant::now();
        let result = run_tcp_flow(&mut server, &mut reporter(), &options).unwrap();
        let elapsed = start.elapsed();
        writer.join().unwrap();

        assert_eq!(result.summary.total_bytes, 20_000);
        assert!(elapsed >= Duration::from_millis(150), "paced read took {elapsed:?}");
    }
}
