//! Adaptive delay engine
//!
//! Short delays spin on the monotonic clock; longer ones sleep in the kernel.
//! The Kalman strategy shortens each sleep by the filter's overshoot estimate
//! and then spins to the full target, so it neither wakes late nor returns
//! early.
//!
//! The strategy is picked once, either from configuration or by probing the
//! clock resolution, and never changes afterwards.

use super::kalman::Kalman;
use super::{busy_wait_until, time_ns};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::OnceLock;
use std::time::Duration;

/// Requests below this many microseconds are busy-waited
pub const BUSY_WAIT_THRESHOLD_US: u64 = 1000;

const BUSY_WAIT_THRESHOLD_NS: u64 = BUSY_WAIT_THRESHOLD_US * 1_000;

/// How the delay engine waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum DelayStrategy {
    /// Probe the clock resolution at startup
    #[default]
    Auto,
    /// Always spin
    BusyLoop,
    /// Always sleep in the kernel
    Sleep,
    /// Spin below the threshold, sleep above it
    Hybrid,
    /// Hybrid with Kalman-compensated sleeps
    Kalman,
}

impl DelayStrategy {
    /// Replace `Auto` with a concrete strategy for this host
    pub fn resolve(self) -> DelayStrategy {
        if self != DelayStrategy::Auto {
            return self;
        }
        let resolved = match clock_resolution() {
            Some(res) if res <= Duration::from_micros(1) => DelayStrategy::Kalman,
            Some(res) if res <= Duration::from_millis(1) => DelayStrategy::Hybrid,
            _ => DelayStrategy::Sleep,
        };
        tracing::debug!("Delay strategy resolved to {:?}", resolved);
        resolved
    }
}

#[cfg(unix)]
fn clock_resolution() -> Option<Duration> {
    use nix::time::{clock_getres, ClockId};
    clock_getres(ClockId::CLOCK_MONOTONIC).ok().map(Duration::from)
}

#[cfg(not(unix))]
fn clock_resolution() -> Option<Duration> {
    None
}

/// Sleep for `ns` nanoseconds against an absolute monotonic deadline
///
/// A signal interrupts the sleep, which then resumes with the time that is
/// left. Any other failure is fatal.
#[cfg(target_os = "linux")]
fn sleep_ns(ns: u64) {
    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};

    let now = match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(now) => now,
        Err(e) => fatal_sleep_error(e),
    };
    let deadline = now + TimeSpec::from(Duration::from_nanos(ns));

    loop {
        let flags = ClockNanosleepFlags::TIMER_ABSTIME;
        match clock_nanosleep(ClockId::CLOCK_MONOTONIC, flags, &deadline) {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => fatal_sleep_error(e),
        }
    }
}

#[cfg(target_os = "linux")]
fn fatal_sleep_error(err: nix::errno::Errno) -> ! {
    tracing::error!("clock_nanosleep failed: {}", err);
    std::process::exit(1);
}

#[cfg(not(target_os = "linux"))]
fn sleep_ns(ns: u64) {
    std::thread::sleep(Duration::from_nanos(ns));
}

/// Delay engine with its own Kalman state
///
/// One instance per pacing scope; the filter state is never shared.
#[derive(Debug, Clone)]
pub struct Delay {
    strategy: DelayStrategy,
    kalman: Kalman,
}

impl Delay {
    pub fn new(strategy: DelayStrategy) -> Self {
        Self { strategy: strategy.resolve(), kalman: Kalman::new() }
    }

    pub fn strategy(&self) -> DelayStrategy {
        self.strategy
    }

    /// Filter state, in nanoseconds
    pub fn kalman(&self) -> &Kalman {
        &self.kalman
    }

    /// Block for about `usec` microseconds
    #[inline]
    pub fn delay_us(&mut self, usec: u64) {
        self.delay_ns(usec.saturating_mul(1_000));
    }

    #[inline]
    pub fn delay(&mut self, duration: Duration) {
        self.delay_ns(duration.as_nanos().min(u128::from(u64::MAX)) as u64);
    }

    pub fn delay_ns(&mut self, ns: u64) {
        if ns == 0 {
            return;
        }
        match self.strategy {
            DelayStrategy::BusyLoop => busy_wait_until(time_ns() + ns),
            DelayStrategy::Sleep => sleep_ns(ns),
            DelayStrategy::Hybrid if ns < BUSY_WAIT_THRESHOLD_NS => {
                busy_wait_until(time_ns() + ns)
            }
            DelayStrategy::Hybrid => sleep_ns(ns),
            DelayStrategy::Kalman if ns < BUSY_WAIT_THRESHOLD_NS => {
                busy_wait_until(time_ns() + ns)
            }
            DelayStrategy::Kalman => self.delay_kalman(ns),
            // resolve() never leaves Auto behind
            DelayStrategy::Auto => sleep_ns(ns),
        }
    }

    fn delay_kalman(&mut self, ns: u64) {
        let start = time_ns();
        let target = start + ns;

        let adjusted = ns as f64 - self.kalman.estimate();
        if adjusted > 0.0 {
            sleep_ns(adjusted as u64);
        }
        busy_wait_until(target);

        let elapsed = time_ns() - start;
        self.kalman.update(elapsed as f64 - ns as f64);
    }
}

// =============================================================================
// Per-thread convenience form
// =============================================================================

static DEFAULT_STRATEGY: OnceLock<DelayStrategy> = OnceLock::new();

thread_local! {
    static THREAD_DELAY: RefCell<Option<Delay>> = const { RefCell::new(None) };
}

/// Fix the strategy used by [`delay_loop`]
///
/// Returns `false` if a strategy was already in place.
pub fn set_default_strategy(strategy: DelayStrategy) -> bool {
    DEFAULT_STRATEGY.set(strategy.resolve()).is_ok()
}

/// The strategy used by [`delay_loop`]
pub fn default_strategy() -> DelayStrategy {
    *DEFAULT_STRATEGY.get_or_init(|| DelayStrategy::Auto.resolve())
}

/// Block the calling thread for about `usec` microseconds
///
/// Each thread keeps its own engine, so Kalman state is never shared between
/// threads.
pub fn delay_loop(usec: u64) {
    THREAD_DELAY.with(|cell| {
        let mut slot = cell.borrow_mut();
        slot.get_or_insert_with(|| Delay::new(default_strategy())).delay_us(usec);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_keeps_explicit_strategy() {
        assert_eq!(DelayStrategy::Hybrid.resolve(), DelayStrategy::Hybrid);
        assert_ne!(DelayStrategy::Auto.resolve(), DelayStrategy::Auto);
    }

    #[test]
    fn test_strategy_serde() {
        let s: DelayStrategy = serde_json::from_str("\"busy_loop\"").unwrap();
        assert_eq!(s, DelayStrategy::BusyLoop);
        assert_eq!(serde_json::to_string(&DelayStrategy::Kalman).unwrap(), "\"kalman\"");
    }

    #[test]
    fn test_busy_path_never_returns_early() {
        let mut delay = Delay::new(DelayStrategy::Hybrid);
        for usec in [1u64, 10, 100, 999] {
            let start = time_ns();
            delay.delay_us(usec);
            assert!(time_ns() - start >= usec * 1_000, "returned early for {usec}us");
        }
    }

    #[test]
    fn test_zero_delay_returns() {
        let mut delay = Delay::new(DelayStrategy::Sleep);
        delay.delay_us(0);
    }

    #[test]
    #[cfg(not(tarpaulin))]
    fn test_kalman_delay_accuracy() {
        let mut delay = Delay::new(DelayStrategy::Kalman);
        let mut total = 0u64;
        let iterations = 20;
        for _ in 0..iterations {
            let start = time_ns();
            delay.delay_us(2_000);
            let elapsed = time_ns() - start;
            assert!(elapsed >= 2_000_000, "kalman delay returned early: {elapsed}ns");
            total += elapsed;
        }
        let mean = total / iterations;
        assert!(mean < 4_000_000, "mean delay {mean}ns too far from 2ms");
        // The filter has seen every sleep
        assert!(delay.kalman().gain() > 0.0);
    }

    #[test]
    #[cfg(not(tarpaulin))]
    fn test_sleep_delay_lower_bound() {
        let mut delay = Delay::new(DelayStrategy::Sleep);
        let start = time_ns();
        delay.delay_us(3_000);
        let elapsed = time_ns() - start;
        assert!(elapsed >= 3_000_000);
        assert!(elapsed < 50_000_000);
    }

    #[test]
    fn test_delay_loop_per_thread() {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                std::thread::spawn(|| {
                    let start = time_ns();
                    delay_loop(50);
                    time_ns() - start
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap() >= 50_000);
        }
    }
}
