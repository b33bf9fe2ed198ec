//! Results output formatting

use anyhow::Result;
use cadence_core::server::AckOutcome;
use cadence_core::{ClientReport, FlowReport};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One flow as seen by the receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResults {
    pub peer: String,
    pub protocol: String,
    pub termination: String,
    pub duration_secs: f64,
    pub total_bytes: u64,
    pub datagrams: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub bandwidth_bps: f64,
    pub jitter_ms: f64,
    pub transit: TransitResults,
    pub l2_errors: u64,
    pub isoch_frames: u64,
    pub isoch_slips: u64,
    /// Acks sent, for flows that ended with a FIN
    pub ack_rounds: Option<u32>,
    pub ack_delivered: Option<bool>,
    pub histogram: Option<String>,
}

/// Transit statistics in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitResults {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub stddev_ms: f64,
    pub p50_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

/// Sender-side results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResults {
    pub target: String,
    pub protocol: String,
    pub elapsed_secs: f64,
    pub datagrams: u64,
    pub bytes: u64,
    pub bandwidth_bps: f64,
    pub slips: u64,
    pub frames: u64,
    pub fin_attempts: u32,
    pub acked: bool,
    /// Receiver's count from the ack
    pub server_datagrams: Option<u64>,
    pub server_lost: Option<u64>,
}

impl FlowResults {
    pub fn from_report(report: &FlowReport) -> Self {
        let s = &report.summary;
        let (ack_rounds, ack_delivered) = match report.ack {
            Some(AckOutcome::Delivered { rounds }) => (Some(rounds), Some(true)),
            Some(AckOutcome::GaveUp { rounds }) => (Some(rounds), Some(false)),
            None => (None, None),
        };
        Self {
            peer: report.peer.to_string(),
            protocol: s.protocol.to_string(),
            termination: format!("{:?}", report.termination),
            duration_secs: s.duration,
            total_bytes: s.total_bytes,
            datagrams: s.datagrams,
            lost: s.lost,
            out_of_order: s.out_of_order,
            bandwidth_bps: s.bandwidth(),
            jitter_ms: s.jitter * 1e3,
            transit: TransitResults {
                count: s.transit.count,
                min_ms: s.transit.min * 1e3,
                mean_ms: s.transit.mean * 1e3,
                max_ms: s.transit.max * 1e3,
                stddev_ms: s.transit.variance().sqrt() * 1e3,
                p50_ms: s.percentiles.map(|p| p.p50 * 1e3),
                p99_ms: s.percentiles.map(|p| p.p99 * 1e3),
            },
            l2_errors: s.l2_errors,
            isoch_frames: s.isoch_frames,
            isoch_slips: s.isoch_slips,
            ack_rounds,
            ack_delivered,
            histogram: s.histogram.clone(),
        }
    }

    /// Print results to stdout in human-readable format
    pub fn print_human(&self) {
        println!("\n{}", "=".repeat(60));
        println!("Flow from {} ({}, ended by {})", self.peer, self.protocol, self.termination);
        println!("{}", "=".repeat(60));
        println!("  Duration:        {:.2}s", self.duration_secs);
        println!("  Bytes:           {}", self.total_bytes);
        println!("  Bandwidth:       {:.0} bits/s", self.bandwidth_bps);
        if self.protocol == "udp" {
            println!("  Datagrams:       {}", self.datagrams);
            println!("  Lost:            {}", self.lost);
            println!("  Out of order:    {}", self.out_of_order);
            println!("  Jitter:          {:.3} ms", self.jitter_ms);
            println!(
                "  Transit:         {:.3}/{:.3}/{:.3}/{:.3} ms (min/mean/max/stddev)",
                self.transit.min_ms,
                self.transit.mean_ms,
                self.transit.max_ms,
                self.transit.stddev_ms
            );
            if let (Some(p50), Some(p99)) = (self.transit.p50_ms, self.transit.p99_ms) {
                println!("  Transit p50/p99: {:.3}/{:.3} ms", p50, p99);
            }
        }
        if self.isoch_frames > 0 {
            println!("  Frames:          {} ({} slips)", self.isoch_frames, self.isoch_slips);
        }
        if self.l2_errors > 0 {
            println!("  L2 errors:       {}", self.l2_errors);
        }
        if let Some(rounds) = self.ack_rounds {
            let state = if self.ack_delivered == Some(true) { "delivered" } else { "gave up" };
            println!("  Ack:             {} after {} round(s)", state, rounds);
        }
        if let Some(histogram) = &self.histogram {
            println!("  Histogram:       {}", histogram);
        }
    }
}

impl SendResults {
    pub fn from_report(target: impl Into<String>, report: &ClientReport) -> Self {
        Self {
            target: target.into(),
            protocol: report.protocol.to_string(),
            elapsed_secs: report.elapsed.as_secs_f64(),
            datagrams: report.datagrams,
            bytes: report.bytes,
            bandwidth_bps: report.bandwidth(),
            slips: report.slips,
            frames: report.frames,
            fin_attempts: report.fin_attempts,
            acked: report.ack.is_some(),
            server_datagrams: report.ack.as_ref().map(|a| a.datagrams),
            server_lost: report.ack.as_ref().map(|a| u64::from(a.error_cnt)),
        }
    }

    /// Print results to stdout in human-readable format
    pub fn print_human(&self) {
        println!("\n{}", "=".repeat(60));
        println!("Sent to {} ({})", self.target, self.protocol);
        println!("{}", "=".repeat(60));
        println!("  Elapsed:         {:.2}s", self.elapsed_secs);
        println!("  Writes:          {}", self.datagrams);
        println!("  Bytes:           {}", self.bytes);
        println!("  Bandwidth:       {:.0} bits/s", self.bandwidth_bps);
        println!("  Slips:           {}", self.slips);
        if self.frames > 0 {
            println!("  Frames:          {}", self.frames);
        }
        if self.protocol == "udp" {
            match (self.server_datagrams, self.server_lost) {
                (Some(datagrams), Some(lost)) => println!(
                    "  Receiver:        {} datagrams, {} lost (ack after {} FIN(s))",
                    datagrams, lost, self.fin_attempts
                ),
                _ => println!("  Receiver:        no ack after {} FIN(s)", self.fin_attempts),
            }
        }
    }
}

/// Write any results value to a JSON file
pub fn write_json<T: Serialize>(results: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    tracing::info!("Results written to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::ServerHeader;
    use cadence_core::Protocol;
    use std::time::Duration;

    fn client_report(ack: Option<ServerHeader>) -> ClientReport {
        ClientReport {
            protocol: Protocol::Udp,
            datagrams: 100,
            bytes: 147_000,
            elapsed: Duration::from_secs(1),
            slips: 2,
            frames: 0,
            fin_attempts: 1,
            ack,
        }
    }

    #[test]
    fn test_send_results_creation() {
        let ack = ServerHeader { datagrams: 101, error_cnt: 3, ..Default::default() };
        let results = SendResults::from_report("127.0.0.1:5001", &client_report(Some(ack)));

        assert_eq!(results.protocol, "udp");
        assert_eq!(results.bandwidth_bps, 1_176_000.0);
        assert!(results.acked);
        assert_eq!(results.server_datagrams, Some(101));
        assert_eq!(results.server_lost, Some(3));
    }

    #[test]
    fn test_json_serialization() {
        let results = SendResults::from_report("127.0.0.1:5001", &client_report(None));
        let json = serde_json::to_string(&results).unwrap();
        assert!(json.contains("\"protocol\":\"udp\""));
        assert!(json.contains("\"acked\":false"));
        assert!(json.contains("\"server_datagrams\":null"));
    }

    #[test]
    fn test_write_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("send.json");
        let results = SendResults::from_report("127.0.0.1:5001", &client_report(None));
        write_json(&results, &path).unwrap();

        let parsed: SendResults =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.bytes, 147_000);
    }
}
