//! Nanosecond-precision timing and pacing
//!
//! - [`delay`]: adaptive delay engine (busy-wait / sleep / Kalman hybrid)
//! - [`kalman`]: overshoot estimator used by the delay engine
//! - [`frame_counter`]: drift-free tick deadlines at a fixed frequency
//!
//! All waits are measured on the monotonic clock behind [`time_ns`].

use std::sync::OnceLock;
use std::time::Instant;

pub mod delay;
pub mod frame_counter;
pub mod kalman;

pub use delay::{delay_loop, Delay, DelayStrategy};
pub use frame_counter::FrameCounter;
pub use kalman::Kalman;

/// Process-wide origin for monotonic nanosecond timestamps
static START: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process
///
/// # Example
/// ```
/// use cadence_core::timing::time_ns;
///
/// let start = time_ns();
/// let elapsed = time_ns() - start;
/// assert!(elapsed < 1_000_000_000);
/// ```
#[inline]
pub fn time_ns() -> u64 {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Spin until [`time_ns`] reaches `target_ns`
#[inline]
pub fn busy_wait_until(target_ns: u64) {
    while time_ns() < target_ns {
        std::hint::spin_loop();
    }
}

/// Spin for `duration_ns` nanoseconds
#[inline]
pub fn busy_wait_ns(duration_ns: u64) {
    busy_wait_until(time_ns() + duration_ns);
}
