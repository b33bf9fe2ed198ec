//! Fixed-frequency tick scheduler
//!
//! Tick `n` is due at `start + n / frequency`, computed from the fixed origin
//! every time so rounding never accumulates. The first tick is one period
//! after creation. A caller that comes back after its next deadline has
//! already passed gets a slip instead of a wait, and the sequence moves on
//! either way.

use super::delay::{Delay, DelayStrategy};
use super::time_ns;
use crate::{Error, Result};
use std::time::Duration;

#[derive(Debug)]
pub struct FrameCounter {
    frequency: f64,
    period_ns: f64,
    start_ns: u64,
    next: u64,
    slip: bool,
    slip_count: u64,
    delay: Delay,
}

impl FrameCounter {
    /// Frame counter paced by the Kalman delay engine
    pub fn new(frequency: f64) -> Result<Self> {
        Self::with_strategy(frequency, DelayStrategy::Kalman)
    }

    pub fn with_strategy(frequency: f64, strategy: DelayStrategy) -> Result<Self> {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(Error::Config(format!(
                "frame frequency must be positive, got {frequency}"
            )));
        }
        Ok(Self {
            frequency,
            period_ns: 1e9 / frequency,
            start_ns: time_ns(),
            next: 1,
            slip: false,
            slip_count: 0,
            delay: Delay::new(strategy),
        })
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns as u64)
    }

    /// Absolute deadline of tick `n`, in [`time_ns`] units
    pub fn deadline(&self, n: u64) -> u64 {
        self.start_ns + (n as f64 * self.period_ns) as u64
    }

    /// Block until the next tick and return its sequence number
    pub fn wait_tick(&mut self) -> u64 {
        let n = self.next;
        let remaining = self.deadline(n) as i128 - time_ns() as i128;
        if remaining > 0 {
            self.delay.delay_ns(remaining as u64);
        } else {
            self.slip = true;
            self.slip_count += 1;
        }
        self.next += 1;
        n
    }

    /// Whether a deadline was missed since the last [`clear_slip`](Self::clear_slip)
    pub fn slip(&self) -> bool {
        self.slip
    }

    pub fn clear_slip(&mut self) {
        self.slip = false;
    }

    /// Total number of missed deadlines
    pub fn slip_count(&self) -> u64 {
        self.slip_count
    }

    /// Sequence number the next [`wait_tick`](Self::wait_tick) will wait for
    pub fn next_frame(&self) -> u64 {
        self.next
    }

    /// Frame index implied by the time elapsed since the origin
    pub fn current_frame(&self) -> u64 {
        let elapsed = time_ns().saturating_sub(self.start_ns) as f64;
        (elapsed / self.period_ns) as u64 + 1
    }

    /// Re-anchor the origin at the current time
    pub fn reset(&mut self) {
        self.start_ns = time_ns();
        self.next = 1;
        self.slip = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_frequency() {
        assert!(FrameCounter::new(0.0).is_err());
        assert!(FrameCounter::new(-5.0).is_err());
        assert!(FrameCounter::new(f64::NAN).is_err());
    }

    #[test]
    fn test_deadlines_from_origin() {
        let fc = FrameCounter::new(100.0).unwrap();
        assert_eq!(fc.deadline(1) - fc.deadline(0), 10_000_000);
        assert_eq!(fc.deadline(300) - fc.deadline(0), 3_000_000_000);
        assert_eq!(fc.period(), Duration::from_millis(10));
    }

    #[test]
    fn test_sequence_advances_on_every_wait() {
        let mut fc = FrameCounter::with_strategy(10_000.0, DelayStrategy::BusyLoop).unwrap();
        assert_eq!(fc.wait_tick(), 1);
        assert_eq!(fc.wait_tick(), 2);
        assert_eq!(fc.next_frame(), 3);
    }

    #[test]
    #[cfg(not(tarpaulin))]
    fn test_no_drift() {
        let mut fc = FrameCounter::new(500.0).unwrap();
        let start = time_ns();
        for _ in 0..100 {
            fc.wait_tick();
        }
        let elapsed = time_ns() - start;
        // 100 ticks at 2ms each; the last deadline bounds the total
        assert!(elapsed >= 198_000_000, "elapsed {elapsed}ns");
        assert!(elapsed < 260_000_000, "elapsed {elapsed}ns");
    }

    #[test]
    fn test_slip_detected_and_cleared() {
        let mut fc = FrameCounter::with_strategy(100.0, DelayStrategy::BusyLoop).unwrap();
        fc.wait_tick();
        assert!(!fc.slip());

        std::thread::sleep(Duration::from_millis(25));
        fc.wait_tick();
        assert!(fc.slip());
        assert_eq!(fc.slip_count(), 1);

        fc.clear_slip();
        assert!(!fc.slip());
        assert_eq!(fc.slip_count(), 1);
    }

    #[test]
    fn test_reset_and_current_frame() {
        let mut fc = FrameCounter::with_strategy(100.0, DelayStrategy::BusyLoop).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        assert!(fc.current_frame() >= 3);

        fc.wait_tick();
        fc.reset();
        assert_eq!(fc.next_frame(), 1);
        assert!(!fc.slip());
        assert!(fc.current_frame() <= 2);
    }
}
