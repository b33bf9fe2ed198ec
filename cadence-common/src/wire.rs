//! UDP datagram wire format
//!
//! Every measurement datagram starts with a fixed 16-byte header, all fields
//! 32-bit big-endian:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │    id    │  tv_sec  │ tv_usec  │   id2    │
//! │  [0,4)   │  [4,8)   │  [8,12)  │ [12,16)  │
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `id` carries the low 32 bits of the sequence number and `id2` the high 32
//! bits when 64-bit sequence numbers are negotiated. The sender marks its last
//! datagram by setting the top bit of the (32- or 64-bit) sequence number.
//!
//! Isochronous traffic appends a 16-byte frame descriptor right after the
//! header. The server acknowledges the final datagram with a [`ServerHeader`]
//! placed after a copy of the datagram header.

use std::fmt;

/// Length of the base datagram header
pub const DATAGRAM_HEADER_LEN: usize = 16;

/// Length of the isochronous frame descriptor
pub const ISOCH_PAYLOAD_LEN: usize = 16;

/// Termination flag in 32-bit sequence mode
pub const SEQ32_TERMINATE: u32 = 0x8000_0000;

/// Termination flag in 64-bit sequence mode
pub const SEQ64_TERMINATE: u64 = 0x8000_0000_0000_0000;

/// Server header flag bits
pub mod flags {
    /// Header is present and valid
    pub const HEADER_VERSION1: u32 = 0x8000_0000;
    /// Transit extension block follows the base header
    pub const HEADER_EXTEND: u32 = 0x4000_0000;
}

/// Decoding or encoding ran past the end of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    Truncated { needed: usize, available: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated { needed, available } => {
                write!(f, "buffer truncated: need {needed} bytes, have {available}")
            }
        }
    }
}

impl std::error::Error for WireError {}

pub type Result<T> = std::result::Result<T, WireError>;

// =============================================================================
// Field readers
// =============================================================================

#[inline]
fn check(buf_len: usize, offset: usize, width: usize) -> Result<()> {
    let needed = offset + width;
    if needed > buf_len {
        return Err(WireError::Truncated { needed, available: buf_len });
    }
    Ok(())
}

/// Read a big-endian `u16` at `offset`
#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    check(buf.len(), offset, 2)?;
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

/// Read a big-endian `u32` at `offset`
#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    check(buf.len(), offset, 4)?;
    Ok(u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]))
}

#[inline]
fn read_i32(buf: &[u8], offset: usize) -> Result<i32> {
    read_u32(buf, offset).map(|v| v as i32)
}

/// Write a big-endian `u32` at `offset`
#[inline]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    check(buf.len(), offset, 4)?;
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
fn write_i32(buf: &mut [u8], offset: usize, value: i32) -> Result<()> {
    write_u32(buf, offset, value as u32)
}

// =============================================================================
// Datagram header
// =============================================================================

/// Width of the sequence number carried in each datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceWidth {
    /// 31-bit sequence number plus termination flag in `id`
    #[default]
    Bits32,
    /// 63-bit sequence number split across `id` (low) and `id2` (high)
    Bits64,
}

/// Decoded sequence number with the termination flag stripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketId {
    pub value: u64,
    pub terminal: bool,
}

impl PacketId {
    pub fn new(value: u64) -> Self {
        Self { value, terminal: false }
    }

    pub fn terminal(value: u64) -> Self {
        Self { value, terminal: true }
    }

    /// Decode the sequence number from a datagram payload
    pub fn decode(payload: &[u8], width: SequenceWidth) -> Result<Self> {
        match width {
            SequenceWidth::Bits32 => {
                let raw = read_u32(payload, 0)?;
                Ok(Self {
                    value: u64::from(raw & !SEQ32_TERMINATE),
                    terminal: raw & SEQ32_TERMINATE != 0,
                })
            }
            SequenceWidth::Bits64 => {
                let low = read_u32(payload, 0)?;
                let high = read_u32(payload, 12)?;
                let raw = (u64::from(high) << 32) | u64::from(low);
                Ok(Self {
                    value: raw & !SEQ64_TERMINATE,
                    terminal: raw & SEQ64_TERMINATE != 0,
                })
            }
        }
    }

    /// Encode the sequence number, setting the top bit when terminal
    ///
    /// Values wider than the sequence width wrap.
    pub fn encode(&self, payload: &mut [u8], width: SequenceWidth) -> Result<()> {
        match width {
            SequenceWidth::Bits32 => {
                let mut raw = (self.value as u32) & !SEQ32_TERMINATE;
                if self.terminal {
                    raw |= SEQ32_TERMINATE;
                }
                write_u32(payload, 0, raw)
            }
            SequenceWidth::Bits64 => {
                let mut raw = self.value & !SEQ64_TERMINATE;
                if self.terminal {
                    raw |= SEQ64_TERMINATE;
                }
                check(payload.len(), 0, DATAGRAM_HEADER_LEN)?;
                write_u32(payload, 0, raw as u32)?;
                write_u32(payload, 12, (raw >> 32) as u32)
            }
        }
    }
}

/// Sender timestamp carried in the datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SentTime {
    pub sec: u32,
    pub usec: u32,
}

/// Base datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatagramHeader {
    pub id: PacketId,
    pub sent: SentTime,
}

impl DatagramHeader {
    pub fn decode(payload: &[u8], width: SequenceWidth) -> Result<Self> {
        let id = PacketId::decode(payload, width)?;
        let sent = SentTime {
            sec: read_u32(payload, 4)?,
            usec: read_u32(payload, 8)?,
        };
        Ok(Self { id, sent })
    }

    /// Encode into the first [`DATAGRAM_HEADER_LEN`] bytes of `payload`
    ///
    /// In 32-bit mode the `id2` word is zeroed.
    pub fn encode(&self, payload: &mut [u8], width: SequenceWidth) -> Result<()> {
        check(payload.len(), 0, DATAGRAM_HEADER_LEN)?;
        if width == SequenceWidth::Bits32 {
            write_u32(payload, 12, 0)?;
        }
        self.id.encode(payload, width)?;
        write_u32(payload, 4, self.sent.sec)?;
        write_u32(payload, 8, self.sent.usec)
    }
}

// =============================================================================
// Isochronous frame descriptor
// =============================================================================

/// Per-frame metadata carried by isochronous traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsochPayload {
    pub frame_id: u32,
    pub prev_frame_id: u32,
    pub burst_size: u32,
    pub remaining: u32,
}

impl IsochPayload {
    /// Decode the descriptor that follows the datagram header
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let base = DATAGRAM_HEADER_LEN;
        Ok(Self {
            frame_id: read_u32(payload, base)?,
            prev_frame_id: read_u32(payload, base + 4)?,
            burst_size: read_u32(payload, base + 8)?,
            remaining: read_u32(payload, base + 12)?,
        })
    }

    pub fn encode(&self, payload: &mut [u8]) -> Result<()> {
        let base = DATAGRAM_HEADER_LEN;
        check(payload.len(), base, ISOCH_PAYLOAD_LEN)?;
        write_u32(payload, base, self.frame_id)?;
        write_u32(payload, base + 4, self.prev_frame_id)?;
        write_u32(payload, base + 8, self.burst_size)?;
        write_u32(payload, base + 12, self.remaining)
    }
}

// =============================================================================
// Server acknowledgement header
// =============================================================================

/// Transit-time statistics appended when [`flags::HEADER_EXTEND`] is set
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransitExtension {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
    pub m2: f64,
    pub variance: f64,
    pub count: u32,
    pub ipg_count: u32,
    pub ipg_sum: u32,
}

/// Aggregate flow statistics returned to the sender in the ack datagram
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ServerHeader {
    pub flags: u32,
    pub total_len: u64,
    /// Flow duration in seconds
    pub stop_time: f64,
    pub error_cnt: u32,
    pub outorder_cnt: u32,
    pub datagrams: u64,
    /// Jitter in seconds
    pub jitter: f64,
    pub extend: Option<TransitExtension>,
}

const BASE_WORDS_32: usize = 10;
const BASE_WORDS_64: usize = 11;
const EXTEND_WORDS: usize = 15;

/// Split a float into integer and micro-fraction words
fn split_float(value: f64) -> (i32, i32) {
    let whole = value.trunc();
    (whole as i32, ((value - whole) * 1e6) as i32)
}

fn join_float(whole: i32, micros: i32) -> f64 {
    f64::from(whole) + f64::from(micros) / 1e6
}

impl ServerHeader {
    /// Encoded size in bytes for the given sequence width and extension
    pub fn encoded_len(width: SequenceWidth, extended: bool) -> usize {
        let base = match width {
            SequenceWidth::Bits32 => BASE_WORDS_32,
            SequenceWidth::Bits64 => BASE_WORDS_64,
        };
        4 * (base + if extended { EXTEND_WORDS } else { 0 })
    }

    /// Encode at the start of `buf`, returning the number of bytes written
    ///
    /// The [`flags::HEADER_EXTEND`] bit is derived from `extend`.
    pub fn encode(&self, buf: &mut [u8], width: SequenceWidth) -> Result<usize> {
        let len = Self::encoded_len(width, self.extend.is_some());
        check(buf.len(), 0, len)?;

        let mut flags = self.flags | flags::HEADER_VERSION1;
        if self.extend.is_some() {
            flags |= flags::HEADER_EXTEND;
        } else {
            flags &= !flags::HEADER_EXTEND;
        }

        let mut words: Vec<i32> = Vec::with_capacity(len / 4);
        words.push(flags as i32);
        words.push((self.total_len >> 32) as i32);
        words.push(self.total_len as u32 as i32);
        let (stop_sec, stop_usec) = split_float(self.stop_time);
        words.push(stop_sec);
        words.push(stop_usec);
        words.push(self.error_cnt as i32);
        words.push(self.outorder_cnt as i32);
        if width == SequenceWidth::Bits64 {
            words.push((self.datagrams >> 32) as i32);
        }
        words.push(self.datagrams as u32 as i32);
        let (jitter1, jitter2) = split_float(self.jitter);
        words.push(jitter1);
        words.push(jitter2);

        if let Some(ext) = &self.extend {
            for value in [ext.min, ext.max, ext.sum, ext.mean, ext.m2, ext.variance] {
                let (whole, micros) = split_float(value);
                words.push(whole);
                words.push(micros);
            }
            words.push(ext.count as i32);
            words.push(ext.ipg_count as i32);
            words.push(ext.ipg_sum as i32);
        }

        for (i, word) in words.iter().enumerate() {
            write_i32(buf, i * 4, *word)?;
        }
        Ok(len)
    }

    pub fn decode(buf: &[u8], width: SequenceWidth) -> Result<Self> {
        let mut off = 0;
        let mut next = |buf: &[u8]| -> Result<i32> {
            let v = read_i32(buf, off)?;
            off += 4;
            Ok(v)
        };

        let flags = next(buf)? as u32;
        let total_hi = next(buf)? as u32;
        let total_lo = next(buf)? as u32;
        let stop_sec = next(buf)?;
        let stop_usec = next(buf)?;
        let error_cnt = next(buf)? as u32;
        let outorder_cnt = next(buf)? as u32;
        let datagrams_hi = match width {
            SequenceWidth::Bits64 => next(buf)? as u32,
            SequenceWidth::Bits32 => 0,
        };
        let datagrams_lo = next(buf)? as u32;
        let jitter1 = next(buf)?;
        let jitter2 = next(buf)?;

        let extend = if flags & flags::HEADER_EXTEND != 0 {
            let mut floats = [0.0f64; 6];
            for slot in floats.iter_mut() {
                let whole = next(buf)?;
                let micros = next(buf)?;
                *slot = join_float(whole, micros);
            }
            Some(TransitExtension {
                min: floats[0],
                max: floats[1],
                sum: floats[2],
                mean: floats[3],
                m2: floats[4],
                variance: floats[5],
                count: next(buf)? as u32,
                ipg_count: next(buf)? as u32,
                ipg_sum: next(buf)? as u32,
            })
        } else {
            None
        };

        Ok(Self {
            flags,
            total_len: (u64::from(total_hi) << 32) | u64::from(total_lo),
            stop_time: join_float(stop_sec, stop_usec),
            error_cnt,
            outorder_cnt,
            datagrams: (u64::from(datagrams_hi) << 32) | u64::from(datagrams_lo),
            jitter: join_float(jitter1, jitter2),
            extend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_32bit_terminal() {
        let mut buf = [0u8; DATAGRAM_HEADER_LEN];
        buf[0..4].copy_from_slice(&0x8000_002Au32.to_be_bytes());
        let id = PacketId::decode(&buf, SequenceWidth::Bits32).unwrap();
        assert_eq!(id.value, 42);
        assert!(id.terminal);

        buf[0..4].copy_from_slice(&0x7FFF_FFFFu32.to_be_bytes());
        let id = PacketId::decode(&buf, SequenceWidth::Bits32).unwrap();
        assert_eq!(id.value, 0x7FFF_FFFF);
        assert!(!id.terminal);
    }

    #[test]
    fn test_decode_64bit_terminal() {
        let mut buf = [0u8; DATAGRAM_HEADER_LEN];
        // low word in id, high word in id2
        buf[0..4].copy_from_slice(&0x0000_0005u32.to_be_bytes());
        buf[12..16].copy_from_slice(&0x8000_0001u32.to_be_bytes());
        let id = PacketId::decode(&buf, SequenceWidth::Bits64).unwrap();
        assert_eq!(id.value, 0x0000_0001_0000_0005);
        assert!(id.terminal);
    }

    #[test]
    fn test_64bit_low_word_top_bit_is_not_terminal() {
        let mut buf = [0u8; DATAGRAM_HEADER_LEN];
        buf[0..4].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        let id = PacketId::decode(&buf, SequenceWidth::Bits64).unwrap();
        assert_eq!(id.value, 0x8000_0000);
        assert!(!id.terminal);
    }

    #[test]
    fn test_header_encode_matches_layout() {
        let header = DatagramHeader {
            id: PacketId::terminal(7),
            sent: SentTime { sec: 1_700_000_000, usec: 250_000 },
        };
        let mut buf = [0xFFu8; 20];
        header.encode(&mut buf, SequenceWidth::Bits32).unwrap();
        assert_eq!(&buf[0..4], &0x8000_0007u32.to_be_bytes());
        assert_eq!(&buf[4..8], &1_700_000_000u32.to_be_bytes());
        assert_eq!(&buf[8..12], &250_000u32.to_be_bytes());
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);
        assert_eq!(&buf[16..20], &[0xFF; 4]);

        let decoded = DatagramHeader::decode(&buf, SequenceWidth::Bits32).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_truncated_payload() {
        let buf = [0u8; 10];
        let err = DatagramHeader::decode(&buf, SequenceWidth::Bits32).unwrap_err();
        assert_eq!(err, WireError::Truncated { needed: 12, available: 10 });
        assert!(PacketId::decode(&buf, SequenceWidth::Bits64).is_err());
    }

    #[test]
    fn test_isoch_offsets() {
        let mut buf = [0u8; DATAGRAM_HEADER_LEN + ISOCH_PAYLOAD_LEN];
        buf[16..20].copy_from_slice(&9u32.to_be_bytes());
        buf[20..24].copy_from_slice(&8u32.to_be_bytes());
        buf[24..28].copy_from_slice(&4500u32.to_be_bytes());
        buf[28..32].copy_from_slice(&1500u32.to_be_bytes());
        let isoch = IsochPayload::decode(&buf).unwrap();
        assert_eq!(
            isoch,
            IsochPayload { frame_id: 9, prev_frame_id: 8, burst_size: 4500, remaining: 1500 }
        );
    }

    #[test]
    fn test_server_header_base_layout() {
        let hdr = ServerHeader {
            flags: 0,
            total_len: 0x1_0000_0010,
            stop_time: 10.5,
            error_cnt: 3,
            outorder_cnt: 1,
            datagrams: 1000,
            jitter: 0.25,
            extend: None,
        };
        let mut buf = [0u8; 64];
        let n = hdr.encode(&mut buf, SequenceWidth::Bits32).unwrap();
        assert_eq!(n, 40);
        assert_eq!(read_u32(&buf, 0).unwrap(), flags::HEADER_VERSION1);
        assert_eq!(read_u32(&buf, 4).unwrap(), 1);
        assert_eq!(read_u32(&buf, 8).unwrap(), 0x10);
        assert_eq!(read_u32(&buf, 12).unwrap(), 10);
        assert_eq!(read_u32(&buf, 16).unwrap(), 500_000);
        assert_eq!(read_u32(&buf, 28).unwrap(), 1000);
        assert_eq!(read_u32(&buf, 32).unwrap(), 0);
        assert_eq!(read_u32(&buf, 36).unwrap(), 250_000);

        let decoded = ServerHeader::decode(&buf, SequenceWidth::Bits32).unwrap();
        assert_eq!(decoded.total_len, hdr.total_len);
        assert_eq!(decoded.datagrams, 1000);
        assert!((decoded.jitter - 0.25).abs() < 1e-9);
        assert!(decoded.extend.is_none());
    }

    #[test]
    fn test_server_header_extended_64bit() {
        let hdr = ServerHeader {
            flags: flags::HEADER_VERSION1,
            total_len: 42,
            stop_time: 2.25,
            error_cnt: 0,
            outorder_cnt: 0,
            datagrams: 0x2_0000_0001,
            jitter: 0.001,
            extend: Some(TransitExtension {
                min: 0.000_1,
                max: 0.003,
                sum: 1.5,
                mean: 0.001_5,
                m2: 0.000_02,
                variance: 0.000_001,
                count: 1000,
                ipg_count: 500,
                ipg_sum: 1,
            }),
        };
        let mut buf = [0u8; 128];
        let n = hdr.encode(&mut buf, SequenceWidth::Bits64).unwrap();
        assert_eq!(n, 44 + 60);
        assert_ne!(read_u32(&buf, 0).unwrap() & flags::HEADER_EXTEND, 0);
        // datagrams2 precedes datagrams in 64-bit mode
        assert_eq!(read_u32(&buf, 28).unwrap(), 2);
        assert_eq!(read_u32(&buf, 32).unwrap(), 1);

        let decoded = ServerHeader::decode(&buf, SequenceWidth::Bits64).unwrap();
        assert_eq!(decoded.datagrams, 0x2_0000_0001);
        let ext = decoded.extend.unwrap();
        assert_eq!(ext.count, 1000);
        assert!((ext.max - 0.003).abs() < 2e-6);
        assert!((ext.sum - 1.5).abs() < 2e-6);
    }

    #[test]
    fn test_server_header_short_buffer() {
        let hdr = ServerHeader::default();
        let mut buf = [0u8; 16];
        assert!(hdr.encode(&mut buf, SequenceWidth::Bits32).is_err());
    }
}
