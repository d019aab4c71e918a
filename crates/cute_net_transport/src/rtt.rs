//! See [`RttEstimator`].

use std::time::Duration;

/// Tracks a round-trip-time estimate for one connection as a plain
/// exponential moving average over acked-fragment samples.
///
/// Advisory only: nothing in this crate gates a timeout or resend decision
/// on it, so the smoothing here favors a simple, auditable update rule over
/// a congestion-control-grade estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: Duration,
    min: Duration,
}

/// Weight given to each new sample when folding it into `smoothed`.
const SMOOTHING_ALPHA: f64 = 0.125;

impl RttEstimator {
    /// Creates a new estimator from a given initial RTT.
    #[must_use]
    pub const fn new(initial_rtt: Duration) -> Self {
        Self {
            smoothed: initial_rtt,
            min: initial_rtt,
        }
    }

    /// Gets the current best RTT estimate.
    #[must_use]
    pub const fn get(&self) -> Duration {
        self.smoothed
    }

    /// Gets the minimum RTT registered so far.
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Folds a new RTT sample into the estimate.
    pub fn update(&mut self, rtt: Duration) {
        self.min = self.min.min(rtt);

        let smoothed_secs = self.smoothed.as_secs_f64();
        let sample_secs = rtt.as_secs_f64();
        let next = smoothed_secs + SMOOTHING_ALPHA * (sample_secs - smoothed_secs);
        self.smoothed = Duration::from_secs_f64(next.max(0.0));
    }
}

/// Default initial RTT before any sample has arrived.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_minimum() {
        let mut rtt = RttEstimator::new(Duration::from_millis(500));
        assert_eq!(Duration::from_millis(500), rtt.min());

        rtt.update(Duration::from_millis(750));
        assert_eq!(Duration::from_millis(500), rtt.min());

        rtt.update(Duration::from_millis(250));
        assert_eq!(Duration::from_millis(250), rtt.min());
    }

    #[test]
    fn smooths_toward_samples() {
        let mut rtt = RttEstimator::default();
        for _ in 0..50 {
            rtt.update(Duration::from_millis(50));
        }
        assert!(rtt.get() < Duration::from_millis(100));
        assert!(rtt.get() > Duration::from_millis(40));
    }
}
