//! Timing diagnostics
//!
//! `check-delay` measures how long the delay engine really blocks for a
//! requested interval. `check-isoch` ticks a frame counter and injects one
//! over-long delay so the slip detection can be seen working.

use anyhow::Result;
use cadence_core::stats::{Histogram, HistogramSettings};
use cadence_core::timing::{delay_loop, Delay, DelayStrategy, FrameCounter};
use std::fmt;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tick at which `check-isoch` injects its over-long delay
const SLIP_INJECTION_TICK: u64 = 8;

/// Parameters of a delay measurement
#[derive(Debug, Clone)]
pub struct DelayCheck {
    pub delay_us: u64,
    pub iterations: u64,
    pub strategy: DelayStrategy,
    /// Time a clock read instead of a delay
    pub clock_overhead: bool,
}

/// Observed delays in nanoseconds
#[derive(Debug)]
pub struct DelayMeasurement {
    /// Iterations that did not straddle a second boundary
    pub samples: u64,
    pub mean_ns: f64,
    pub min_ns: u64,
    pub max_ns: u64,
    /// Overshoot past the requested delay, 1 us bins
    pub errors: Histogram,
}

impl fmt::Display for DelayMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delay={:.0}/{}/{} ns (mean/min/max)", self.mean_ns, self.min_ns, self.max_ns)
    }
}

fn wall_clock() -> (u64, u32) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_secs(), now.subsec_nanos())
}

/// Run `check.iterations` delays and collect their real durations
pub fn measure_delay(check: &DelayCheck) -> Result<DelayMeasurement> {
    let settings = HistogramSettings {
        bincount: 1000,
        binwidth: 1000.0,
        units: 1.0,
        ..Default::default()
    };
    let mut errors = Histogram::new("delay-error", settings)?;
    let mut delay = Delay::new(check.strategy);
    let requested_ns = if check.clock_overhead { 0 } else { check.delay_us * 1_000 };

    let mut samples = 0u64;
    let mut sum = 0.0;
    let mut min = u64::MAX;
    let mut max = 0u64;
    for _ in 0..check.iterations {
        let (sec0, nsec0) = wall_clock();
        if check.clock_overhead {
            std::hint::black_box(wall_clock());
        } else {
            delay.delay_us(check.delay_us);
        }
        let (sec1, nsec1) = wall_clock();
        // Only same-second pairs are compared, like a tv_nsec difference
        if sec0 != sec1 || nsec1 < nsec0 {
            continue;
        }
        let delta = u64::from(nsec1 - nsec0);
        min = min.min(delta);
        max = max.max(delta);
        sum += delta as f64;
        samples += 1;
        let _ = errors.insert(delta as f64 - requested_ns as f64);
    }

    Ok(DelayMeasurement {
        samples,
        mean_ns: if samples > 0 { sum / samples as f64 } else { 0.0 },
        min_ns: if samples > 0 { min } else { 0 },
        max_ns: max,
        errors,
    })
}

/// Result of a frame counter check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsochCheck {
    pub ticks: u64,
    pub slips: u64,
}

/// Tick a frame counter `count` times at `fps`, writing one line per tick
///
/// Eight ticks before the end the loop stalls for slightly more than a
/// period, which the counter reports as a slip.
pub fn check_isoch<W: Write>(
    count: u64,
    fps: f64,
    strategy: DelayStrategy,
    out: &mut W,
) -> Result<IsochCheck> {
    let mut fc = FrameCounter::with_strategy(fps, strategy)?;
    writeln!(out, "Timestamping {} times at {} fps", count, fps)?;

    let stall_us = (1e6 / fps) as u64 + 10;
    let mut slips = 0;
    let mut remaining = count;
    while remaining > 0 {
        remaining -= 1;
        if remaining == SLIP_INJECTION_TICK {
            delay_loop(stall_us);
        }
        fc.wait_tick();
        let (sec, nsec) = wall_clock();
        writeln!(out, "{:.6} counter({})", sec as f64 + f64::from(nsec) / 1e9, remaining)?;
        if fc.slip() {
            writeln!(out, "Slip occurred")?;
            slips += 1;
            fc.clear_slip();
        }
    }
    out.flush()?;
    Ok(IsochCheck { ticks: count, slips })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_overhead_measurement() {
        let check = DelayCheck {
            delay_us: 1,
            iterations: 1000,
            strategy: DelayStrategy::BusyLoop,
            clock_overhead: true,
        };
        let m = measure_delay(&check).unwrap();
        assert!(m.samples > 0);
        assert!(m.min_ns <= m.max_ns);
        assert!(m.mean_ns >= m.min_ns as f64 && m.mean_ns <= m.max_ns as f64);
        assert_eq!(m.errors.population(), m.samples);
        assert!(m.to_string().starts_with("delay="));
    }

    #[test]
    #[cfg(not(tarpaulin))]
    fn test_delay_measurement_bounds() {
        let check = DelayCheck {
            delay_us: 100,
            iterations: 50,
            strategy: DelayStrategy::BusyLoop,
            clock_overhead: false,
        };
        let m = measure_delay(&check).unwrap();
        assert!(m.samples > 0);
        // Busy waiting never returns early
        assert!(m.min_ns >= 99_000, "min {} ns", m.min_ns);
        assert_eq!(m.errors.population(), m.samples);
    }

    #[test]
    #[cfg(not(tarpaulin))]
    fn test_isoch_check_reports_injected_slip() {
        let mut out = Vec::new();
        let result = check_isoch(12, 100.0, DelayStrategy::Hybrid, &mut out).unwrap();
        assert_eq!(result.ticks, 12);
        assert!(result.slips >= 1);

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Timestamping 12 times at 100 fps"));
        assert_eq!(text.lines().filter(|l| l.contains("counter(")).count(), 12);
        assert!(text.contains("counter(0)"));
        assert_eq!(text.matches("Slip occurred").count() as u64, result.slips);
    }

    #[test]
    fn test_isoch_check_rejects_bad_rate() {
        let mut out = Vec::new();
        assert!(check_isoch(3, 0.0, DelayStrategy::Hybrid, &mut out).is_err());
    }
}
