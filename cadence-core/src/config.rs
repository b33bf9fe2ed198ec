//! Configuration types for cadence core
//!
//! Durations are written as humantime strings ("500ms", "10s") in profiles.

use crate::stats::{HistogramSettings, ReportSettings};
use crate::threading::CpuPinning;
use crate::timing::DelayStrategy;
use cadence_common::wire::{DATAGRAM_HEADER_LEN, ISOCH_PAYLOAD_LEN};
use cadence_common::SequenceWidth;
use cadence_transport::RxTimestampConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Largest UDP payload over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Transport carrying a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Ack retransmission policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct AckSettings {
    /// How long to wait for a retransmitted FIN after each ack
    #[serde(with = "humantime_serde")]
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub wait: Duration,
    /// Maximum number of acks sent
    pub rounds: u32,
}

impl Default for AckSettings {
    fn default() -> Self {
        Self { wait: Duration::from_secs(1), rounds: 10 }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Receiver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct ServerSettings {
    /// Listening address
    pub bind: SocketAddr,
    pub protocol: Protocol,
    /// Sequence number width expected in datagrams
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub sequence: SequenceWidth,
    /// Interval between reports, none for a final report only
    #[serde(with = "humantime_serde")]
    #[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
    pub interval: Option<Duration>,
    /// End each flow this long after it starts
    #[serde(with = "humantime_serde")]
    #[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
    pub session_time: Option<Duration>,
    /// Receive buffer length; also the ack length
    pub buffer_len: usize,
    /// Send transit statistics in the ack
    pub enhanced: bool,
    /// Decode isochronous frame descriptors
    pub isochronous: bool,
    /// Validate Ethernet frame lengths from an AF_PACKET capture
    pub l2_checks: bool,
    /// Murmur3 fingerprints of captured frames and MAC addresses
    pub frame_hashes: bool,
    /// Interface for captures and SO_BINDTODEVICE
    pub interface: Option<String>,
    /// Prefer kernel receive timestamps
    pub kernel_timestamps: bool,
    /// Also request raw NIC timestamps
    pub hardware_timestamps: bool,
    /// Transit histogram reported per interval
    pub histogram: Option<HistogramSettings>,
    /// Stop listening after this many flows
    pub max_flows: Option<usize>,
    /// TCP read-side pacing in bits per second
    pub read_rate: Option<u64>,
    pub delay_strategy: DelayStrategy,
    pub cpu_pinning: CpuPinning,
    pub ack: AckSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5001)),
            protocol: Protocol::Udp,
            sequence: SequenceWidth::Bits32,
            interval: None,
            session_time: None,
            buffer_len: 1470,
            enhanced: false,
            isochronous: false,
            l2_checks: false,
            frame_hashes: false,
            interface: None,
            kernel_timestamps: true,
            hardware_timestamps: false,
            histogram: None,
            max_flows: None,
            read_rate: None,
            delay_strategy: DelayStrategy::Auto,
            cpu_pinning: CpuPinning::None,
            ack: AckSettings::default(),
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        let min_len = match (self.protocol, self.isochronous) {
            (Protocol::Tcp, _) => 1,
            (Protocol::Udp, false) => DATAGRAM_HEADER_LEN,
            (Protocol::Udp, true) => DATAGRAM_HEADER_LEN + ISOCH_PAYLOAD_LEN,
        };
        if self.buffer_len < min_len {
            anyhow::bail!("buffer_len must be at least {} bytes, got {}", min_len, self.buffer_len);
        }
        if self.protocol == Protocol::Udp && self.buffer_len > MAX_UDP_PAYLOAD {
            anyhow::bail!("buffer_len {} exceeds the largest UDP payload", self.buffer_len);
        }
        if self.interval.is_some_and(|i| i.is_zero()) {
            anyhow::bail!("interval must be positive");
        }
        if self.session_time.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("session_time must be positive");
        }
        if self.l2_checks {
            if self.protocol != Protocol::Udp {
                anyhow::bail!("l2_checks only apply to UDP flows");
            }
            if self.interface.is_none() {
                anyhow::bail!("l2_checks require an interface to capture on");
            }
            if !cfg!(target_os = "linux") {
                anyhow::bail!("l2_checks are only supported on Linux");
            }
        }
        if self.frame_hashes && !self.l2_checks {
            anyhow::bail!("frame_hashes require l2_checks");
        }
        if self.read_rate == Some(0) {
            anyhow::bail!("read_rate must be positive");
        }
        if self.ack.rounds == 0 {
            anyhow::bail!("ack.rounds must be at least 1");
        }
        if self.max_flows == Some(0) {
            anyhow::bail!("max_flows must be at least 1");
        }
        if let Some(histogram) = &self.histogram {
            histogram.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        Ok(())
    }

    /// Receive timeout: half the interval, else half the session time
    pub fn recv_timeout(&self) -> Option<Duration> {
        self.interval.or(self.session_time).map(|d| d / 2)
    }

    pub fn report_settings(&self) -> ReportSettings {
        ReportSettings { interval: self.interval, histogram: self.histogram.clone() }
    }

    pub fn rx_timestamp_config(&self) -> RxTimestampConfig {
        RxTimestampConfig {
            kernel: self.kernel_timestamps,
            hardware: self.hardware_timestamps,
            interface: self.interface.clone(),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Isochronous traffic shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct IsochSettings {
    /// Frames per second
    pub fps: f64,
}

impl Default for IsochSettings {
    fn default() -> Self {
        Self { fps: 60.0 }
    }
}

/// Sender settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct ClientSettings {
    /// Receiver address
    pub target: SocketAddr,
    pub protocol: Protocol,
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub sequence: SequenceWidth,
    /// How long to send
    #[serde(with = "humantime_serde")]
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub duration: Duration,
    /// Datagram or write length
    pub buffer_len: usize,
    /// Offered load in bits per second
    pub rate: u64,
    /// Send frames of `rate / (8 * fps)` bytes at a fixed frame rate
    pub isochronous: Option<IsochSettings>,
    pub delay_strategy: DelayStrategy,
    /// FIN transmissions before giving up on the ack
    pub fin_attempts: u32,
    /// Wait for the ack after each FIN
    #[serde(with = "humantime_serde")]
    #[cfg_attr(feature = "schema", schemars(with = "String"))]
    pub fin_wait: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([127, 0, 0, 1], 5001)),
            protocol: Protocol::Udp,
            sequence: SequenceWidth::Bits32,
            duration: Duration::from_secs(10),
            buffer_len: 1470,
            rate: 1_000_000,
            isochronous: None,
            delay_strategy: DelayStrategy::Auto,
            fin_attempts: 10,
            fin_wait: Duration::from_millis(250),
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        let min_len = match (self.protocol, self.isochronous.is_some()) {
            (Protocol::Tcp, _) => 1,
            (Protocol::Udp, false) => DATAGRAM_HEADER_LEN,
            (Protocol::Udp, true) => DATAGRAM_HEADER_LEN + ISOCH_PAYLOAD_LEN,
        };
        if self.buffer_len < min_len {
            anyhow::bail!("buffer_len must be at least {} bytes, got {}", min_len, self.buffer_len);
        }
        if self.protocol == Protocol::Udp && self.buffer_len > MAX_UDP_PAYLOAD {
            anyhow::bail!("buffer_len {} exceeds the largest UDP payload", self.buffer_len);
        }
        if self.rate == 0 {
            anyhow::bail!("rate must be positive");
        }
        if self.duration.is_zero() {
            anyhow::bail!("duration must be positive");
        }
        if let Some(isoch) = &self.isochronous {
            if self.protocol != Protocol::Udp {
                anyhow::bail!("isochronous traffic is UDP only");
            }
            if !(isoch.fps.is_finite() && isoch.fps > 0.0) {
                anyhow::bail!("isochronous.fps must be positive, got {}", isoch.fps);
            }
        }
        if self.fin_attempts == 0 {
            anyhow::bail!("fin_attempts must be at least 1");
        }
        Ok(())
    }

    /// Packets per second in bandwidth mode
    pub fn packet_rate(&self) -> f64 {
        self.rate as f64 / (8.0 * self.buffer_len as f64)
    }

    /// Bytes per isochronous frame
    pub fn frame_bytes(&self) -> Option<u64> {
        self.isochronous
            .as_ref()
            .map(|isoch| ((self.rate as f64 / (8.0 * isoch.fps)).ceil() as u64).max(1))
    }
}
