//! Wall-clock timestamps for transit measurement
//!
//! Transit time is the difference between the sender's wall clock (carried in
//! the datagram header) and the receiver's wall clock at arrival. Both sides
//! therefore use `CLOCK_REALTIME` with microsecond resolution, matching the
//! `{sec, usec}` pair on the wire.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const USEC_PER_SEC: i64 = 1_000_000;

/// Point in wall-clock time with microsecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    sec: i64,
    usec: i64,
}

impl Timestamp {
    /// Build a timestamp, normalizing `usec` into `[0, 1_000_000)`
    pub fn new(sec: i64, usec: i64) -> Self {
        Self {
            sec: sec + usec.div_euclid(USEC_PER_SEC),
            usec: usec.rem_euclid(USEC_PER_SEC),
        }
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since_epoch.as_secs() as i64,
            usec: i64::from(since_epoch.subsec_micros()),
        }
    }

    pub fn from_timeval(tv: &libc::timeval) -> Self {
        Self::new(tv.tv_sec as i64, tv.tv_usec as i64)
    }

    /// Nanoseconds are truncated to microseconds
    pub fn from_timespec(ts: &libc::timespec) -> Self {
        Self::new(ts.tv_sec as i64, ts.tv_nsec as i64 / 1_000)
    }

    /// Timestamp carried in a datagram header
    pub fn from_wire(sec: u32, usec: u32) -> Self {
        Self::new(i64::from(sec), i64::from(usec))
    }

    /// `(sec, usec)` truncated to the 32-bit wire words
    pub fn to_wire(&self) -> (u32, u32) {
        (self.sec as u32, self.usec as u32)
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn usec(&self) -> i64 {
        self.usec
    }

    /// Signed difference `self - earlier` in seconds
    #[inline]
    pub fn sub_secs(&self, earlier: &Timestamp) -> f64 {
        (self.sec - earlier.sec) as f64 + (self.usec - earlier.usec) as f64 / 1e6
    }

    /// Signed difference `self - earlier` in microseconds
    #[inline]
    pub fn sub_usecs(&self, earlier: &Timestamp) -> i64 {
        (self.sec - earlier.sec) * USEC_PER_SEC + (self.usec - earlier.usec)
    }

    pub fn add(&self, duration: Duration) -> Self {
        Self::new(
            self.sec + duration.as_secs() as i64,
            self.usec + i64::from(duration.subsec_micros()),
        )
    }

    /// Strictly earlier than `other`
    #[inline]
    pub fn before(&self, other: &Timestamp) -> bool {
        self < other
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.usec as f64 / 1e6
    }
}
