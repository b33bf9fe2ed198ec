//! Per-flow reporting
//!
//! A [`FlowReporter`] consumes the packet records of one flow in receipt
//! order. It keeps running totals for the final summary and, when an
//! interval is configured, logs a report every time a record crosses an
//! interval boundary. Timed-out receives arrive as empty records, so a
//! stalled flow still reports.

use super::histogram::{Histogram, HistogramSettings};
use crate::config::Protocol;
use crate::record::PacketRecord;
use crate::{Error, Result};
use cadence_common::{ServerHeader, TransitExtension};
use cadence_transport::Timestamp;
use std::time::Duration;

/// Consumer of a flow's packet records
pub trait Reporter {
    /// Account one receive, in receipt order
    fn report_packet(&mut self, record: &PacketRecord);

    /// Finish the flow at `end` and return its totals
    fn close(&mut self, end: Timestamp) -> FlowSummary;
}

/// Reporting options for one flow
#[derive(Debug, Clone, Default)]
pub struct ReportSettings {
    pub interval: Option<Duration>,
    pub histogram: Option<HistogramSettings>,
}

// =============================================================================
// Transit statistics
// =============================================================================

/// Running transit-time moments (Welford)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransitStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
    pub m2: f64,
}

impl TransitStats {
    pub fn record(&mut self, transit: f64) {
        if self.count == 0 {
            self.min = transit;
            self.max = transit;
        } else {
            self.min = self.min.min(transit);
            self.max = self.max.max(transit);
        }
        self.count += 1;
        self.sum += transit;
        let delta = transit - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (transit - self.mean);
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

/// Transit percentiles in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub p999: f64,
}

// =============================================================================
// Summary
// =============================================================================

/// Totals for a finished flow
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSummary {
    pub name: String,
    pub protocol: Protocol,
    /// Seconds from the first datagram to the end of the flow
    pub duration: f64,
    pub total_bytes: u64,
    pub datagrams: u64,
    /// Datagrams missing from the sequence, out-of-order arrivals excluded
    pub lost: u64,
    pub out_of_order: u64,
    /// RFC 1889 interarrival jitter, in seconds
    pub jitter: f64,
    pub transit: TransitStats,
    pub percentiles: Option<TransitPercentiles>,
    pub l2_errors: u64,
    pub duplicate_frames: u64,
    pub mac_changes: u64,
    pub isoch_frames: u64,
    pub isoch_slips: u64,
    /// Cumulative transit histogram
    pub histogram: Option<String>,
}

impl FlowSummary {
    /// Bits per second over the flow's duration
    pub fn bandwidth(&self) -> f64 {
        if self.duration > 0.0 {
            self.total_bytes as f64 * 8.0 / self.duration
        } else {
            0.0
        }
    }

    /// Header returned to the sender in the ack
    pub fn server_header(&self, enhanced: bool) -> ServerHeader {
        let extend = enhanced.then(|| TransitExtension {
            min: self.transit.min,
            max: self.transit.max,
            sum: self.transit.sum,
            mean: self.transit.mean,
            m2: self.transit.m2,
            variance: self.transit.variance(),
            count: self.transit.count as u32,
            ipg_count: if self.duration > 0.0 {
                (self.datagrams as f64 / self.duration) as u32
            } else {
                0
            },
            ipg_sum: 1,
        });
        ServerHeader {
            flags: 0,
            total_len: self.total_bytes,
            stop_time: self.duration,
            error_cnt: self.lost as u32,
            outorder_cnt: self.out_of_order as u32,
            datagrams: self.datagrams,
            jitter: self.jitter,
            extend,
        }
    }
}

// =============================================================================
// Reporter
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    bytes: u64,
    datagrams: u64,
    gaps: u64,
    out_of_order: u64,
}

pub struct FlowReporter {
    name: String,
    protocol: Protocol,
    interval: Option<Duration>,
    start: Option<Timestamp>,
    interval_start: Timestamp,
    next_report: Option<Timestamp>,

    total: Counters,
    at_interval: Counters,
    last_id: u64,
    jitter: f64,
    last_transit: Option<f64>,
    transit: TransitStats,
    transit_us: hdrhistogram::Histogram<u64>,
    histogram: Option<Histogram>,

    l2_errors: u64,
    duplicate_frames: u64,
    mac_changes: u64,
    last_frame_hash: Option<u32>,
    last_mac_hash: Option<u32>,

    isoch_frames: u64,
    isoch_slips: u64,
    last_frame_id: Option<u32>,
}

impl FlowReporter {
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        settings: &ReportSettings,
    ) -> Result<Self> {
        let name = name.into();
        let histogram = match &settings.histogram {
            Some(hs) => Some(Histogram::new(format!("{name}-transit"), hs.clone())?),
            None => None,
        };
        let transit_us = hdrhistogram::Histogram::<u64>::new(3)
            .map_err(|e| Error::Histogram(format!("Failed to create transit histogram: {e}")))?;

        Ok(Self {
            name,
            protocol,
            interval: settings.interval.filter(|i| !i.is_zero()),
            start: None,
            interval_start: Timestamp::default(),
            next_report: None,
            total: Counters::default(),
            at_interval: Counters::default(),
            last_id: 0,
            jitter: 0.0,
            last_transit: None,
            transit: TransitStats::default(),
            transit_us,
            histogram,
            l2_errors: 0,
            duplicate_frames: 0,
            mac_changes: 0,
            last_frame_hash: None,
            last_mac_hash: None,
            isoch_frames: 0,
            isoch_slips: 0,
            last_frame_id: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datagrams(&self) -> u64 {
        self.total.datagrams
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.bytes
    }

    pub fn histogram(&self) -> Option<&Histogram> {
        self.histogram.as_ref()
    }

    /// Emit every interval report due at `now`
    fn flush_intervals(&mut self, now: Timestamp) {
        let Some(interval) = self.interval else {
            return;
        };
        while let Some(due) = self.next_report {
            if now.before(&due) {
                break;
            }
            self.report_interval(due);
            self.interval_start = due;
            self.next_report = Some(due.add(interval));
        }
    }

    fn report_interval(&mut self, end: Timestamp) {
        let secs = end.sub_secs(&self.interval_start);
        let bytes = self.total.bytes - self.at_interval.bytes;
        let bandwidth = if secs > 0.0 { bytes as f64 * 8.0 / secs } else { 0.0 };
        let offset_start = self.start.map_or(0.0, |s| self.interval_start.sub_secs(&s));
        let offset_end = self.start.map_or(0.0, |s| end.sub_secs(&s));

        match self.protocol {
            Protocol::Tcp => {
                tracing::info!(
                    "[{}] {:.2}-{:.2} sec {} bytes {:.0} bits/sec",
                    self.name,
                    offset_start,
                    offset_end,
                    bytes,
                    bandwidth
                );
            }
            Protocol::Udp => {
                let datagrams = self.total.datagrams - self.at_interval.datagrams;
                let gaps = self.total.gaps - self.at_interval.gaps;
                let ooo = self.total.out_of_order - self.at_interval.out_of_order;
                tracing::info!(
                    "[{}] {:.2}-{:.2} sec {} bytes {:.0} bits/sec jitter {:.3} ms {}/{} lost {} out-of-order",
                    self.name,
                    offset_start,
                    offset_end,
                    bytes,
                    bandwidth,
                    self.jitter * 1e3,
                    gaps.saturating_sub(ooo),
                    datagrams,
                    ooo
                );
                if let Some(histogram) = self.histogram.as_mut() {
                    tracing::info!("[{}] {}", self.name, histogram.render_interval_delta());
                }
            }
        }
        self.at_interval = self.total;
    }

    fn account_sequence(&mut self, id: u64) {
        if id != self.last_id + 1 {
            if id <= self.last_id {
                self.total.out_of_order += 1;
                tracing::trace!(
                    "[{}] datagram {} out of order (last {})",
                    self.name,
                    id,
                    self.last_id
                );
            } else {
                self.total.gaps += id - self.last_id - 1;
            }
        }
        self.last_id = self.last_id.max(id);
    }

    fn account_transit(&mut self, record: &PacketRecord) {
        let transit = record.transit();
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
        self.transit.record(transit);
        self.transit_us.saturating_record((transit * 1e6).max(0.0) as u64);
        if let Some(histogram) = self.histogram.as_mut() {
            // Out-of-range values land in the histogram's own tally
            if let Err(side) = histogram.insert(transit) {
                tracing::trace!("[{}] transit {:.6}s out of range ({:?})", self.name, transit, side);
            }
        }
    }

    fn account_frame(&mut self, record: &PacketRecord) {
        if record.l2_mismatch() {
            self.l2_errors += 1;
            tracing::debug!(
                "[{}] L2 length {} does not match expected {}",
                self.name,
                record.l2_len,
                record.expected_l2_len
            );
        }
        if let Some(hash) = record.frame_hash {
            if self.last_frame_hash == Some(hash) {
                self.duplicate_frames += 1;
            }
            self.last_frame_hash = Some(hash);
        }
        if let Some(hash) = record.mac_hash {
            if self.last_mac_hash.is_some_and(|last| last != hash) {
                self.mac_changes += 1;
            }
            self.last_mac_hash = Some(hash);
        }
        if let Some(isoch) = record.isoch {
            if self.last_frame_id != Some(isoch.frame_id) {
                self.isoch_frames += 1;
                if self.last_frame_id.is_some_and(|last| last != isoch.prev_frame_id) {
                    self.isoch_slips += 1;
                }
                self.last_frame_id = Some(isoch.frame_id);
            }
        }
    }

    fn percentiles(&self) -> Option<TransitPercentiles> {
        if self.transit_us.is_empty() {
            return None;
        }
        let at = |q: f64| self.transit_us.value_at_quantile(q) as f64 / 1e6;
        Some(TransitPercentiles { p50: at(0.5), p90: at(0.9), p99: at(0.99), p999: at(0.999) })
    }
}

impl Reporter for FlowReporter {
    fn report_packet(&mut self, record: &PacketRecord) {
        if record.empty {
            self.flush_intervals(record.received);
            return;
        }

        if self.start.is_none() {
            self.start = Some(record.received);
            self.interval_start = record.received;
            self.next_report = self.interval.map(|i| record.received.add(i));
        }
        self.flush_intervals(record.received);

        self.total.bytes += record.len as u64;
        if self.protocol == Protocol::Tcp {
            return;
        }

        self.total.datagrams += 1;
        self.account_sequence(record.packet_id);
        self.account_transit(record);
        self.account_frame(record);
    }

    fn close(&mut self, end: Timestamp) -> FlowSummary {
        if self.interval.is_some() && self.start.is_some() {
            self.flush_intervals(end);
            if self.total.bytes != self.at_interval.bytes {
                self.report_interval(end);
                self.interval_start = end;
            }
        }

        let duration = self.start.map_or(0.0, |s| end.sub_secs(&s).max(0.0));
        let summary = FlowSummary {
            name: self.name.clone(),
            protocol: self.protocol,
            duration,
            total_bytes: self.total.bytes,
            datagrams: self.total.datagrams,
            lost: self.total.gaps.saturating_sub(self.total.out_of_order),
            out_of_order: self.total.out_of_order,
            jitter: self.jitter,
            transit: self.transit,
            percentiles: self.percentiles(),
            l2_errors: self.l2_errors,
            duplicate_frames: self.duplicate_frames,
            mac_changes: self.mac_changes,
            isoch_frames: self.isoch_frames,
            isoch_slips: self.isoch_slips,
            histogram: self.histogram.as_ref().map(Histogram::render_cumulative),
        };

        match self.protocol {
            Protocol::Tcp => tracing::info!(
                "[{}] 0.00-{:.2} sec {} bytes {:.0} bits/sec (final)",
                self.name,
                summary.duration,
                summary.total_bytes,
                summary.bandwidth()
            ),
            Protocol::Udp => {
                tracing::info!(
                    "[{}] 0.00-{:.2} sec {} bytes {:.0} bits/sec jitter {:.3} ms {}/{} lost {} out-of-order (final)",
                    self.name,
                    summary.duration,
                    summary.total_bytes,
                    summary.bandwidth(),
                    summary.jitter * 1e3,
                    summary.lost,
                    summary.datagrams,
                    summary.out_of_order
                );
                if let Some(p) = summary.percentiles {
                    tracing::info!(
                        "[{}] transit mean/min/max/stdev {:.3}/{:.3}/{:.3}/{:.3} ms p50/p90/p99/p99.9 {:.3}/{:.3}/{:.3}/{:.3} ms",
                        self.name,
                        summary.transit.mean * 1e3,
                        summary.transit.min * 1e3,
                        summary.transit.max * 1e3,
                        summary.transit.variance().sqrt() * 1e3,
                        p.p50 * 1e3,
                        p.p90 * 1e3,
                        p.p99 * 1e3,
                        p.p999 * 1e3
                    );
                }
                if summary.l2_errors + summary.duplicate_frames + summary.mac_changes > 0 {
                    tracing::info!(
                        "[{}] L2 length errors {} duplicate frames {} MAC changes {}",
                        self.name,
                        summary.l2_errors,
                        summary.duplicate_frames,
                        summary.mac_changes
                    );
                }
                if summary.isoch_frames > 0 {
                    tracing::info!(
                        "[{}] isochronous frames {} slips {}",
                        self.name,
                        summary.isoch_frames,
                        summary.isoch_slips
                    );
                }
                if let Some(histogram) = &summary.histogram {
                    tracing::info!("[{}] {}", self.name, histogram);
                }
            }
        }
        summary
    }
}
