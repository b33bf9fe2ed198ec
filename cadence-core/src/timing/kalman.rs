//! Scalar Kalman filter for sleep overshoot estimation
//!
//! The delay engine feeds the filter the difference between how long a
//! compensated sleep actually took and how long it was asked to take. The
//! estimate `x` accumulates that error and is subtracted from the next sleep
//! request, so systematic wakeup latency is absorbed by the sleep and the
//! remainder is covered by a short busy-wait.

/// Process noise
pub const PROCESS_NOISE: f64 = 0.00001;
/// Measurement noise
pub const MEASUREMENT_NOISE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kalman {
    q: f64,
    r: f64,
    x: f64,
    p: f64,
    k: f64,
}

impl Default for Kalman {
    fn default() -> Self {
        Self::new()
    }
}

impl Kalman {
    pub fn new() -> Self {
        Self { q: PROCESS_NOISE, r: MEASUREMENT_NOISE, x: 0.0, p: 1.0, k: 0.0 }
    }

    /// Fold one measured error into the estimate
    #[inline]
    pub fn update(&mut self, error: f64) {
        self.p += self.q;
        self.k = self.p / (self.p + self.r);
        self.x += self.k * error;
        self.p *= 1.0 - self.k;
    }

    /// Current overshoot estimate, in the units of the measurements
    #[inline]
    pub fn estimate(&self) -> f64 {
        self.x
    }

    pub fn gain(&self) -> f64 {
        self.k
    }

    pub fn covariance(&self) -> f64 {
        self.p
    }
}
