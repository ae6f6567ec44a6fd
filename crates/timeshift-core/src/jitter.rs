//! Inter-arrival jitter estimation
//!
//! Jitter is the exponentially smoothed absolute deviation of observed
//! inter-arrival intervals from the source's nominal packet period,
//! with the 1/16 smoothing constant from RFC 3550. The estimate feeds
//! the dispatch rate controller's target depth and the stats surface.

use std::time::{Duration, Instant};

/// Smoothing constant; each observation contributes 1/16 of its
/// deviation to the running estimate
const JITTER_GAIN: f64 = 1.0 / 16.0;

/// Per-stream arrival jitter estimator
#[derive(Debug, Clone)]
pub struct ArrivalJitter {
    /// Arrival time of the previous packet
    last_arrival: Option<Instant>,
    /// Smoothed absolute deviation in milliseconds
    jitter_ms: f64,
}

impl ArrivalJitter {
    /// New estimator with no history
    pub fn new() -> Self {
        Self {
            last_arrival: None,
            jitter_ms: 0.0,
        }
    }

    /// Record a packet arrival against the stream's nominal period
    pub fn on_arrival(&mut self, arrival: Instant, nominal_period: Duration) {
        if let Some(last) = self.last_arrival {
            let interval = arrival.saturating_duration_since(last).as_secs_f64() * 1_000.0;
            let nominal = nominal_period.as_secs_f64() * 1_000.0;
            let deviation = (interval - nominal).abs();
            self.jitter_ms += (deviation - self.jitter_ms) * JITTER_GAIN;
        }
        self.last_arrival = Some(arrival);
    }

    /// Current smoothed jitter in milliseconds
    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms
    }

    /// Arrival time of the most recent packet
    pub fn last_arrival(&self) -> Option<Instant> {
        self.last_arrival
    }

    /// Forget all history (stream anchor reset)
    pub fn reset(&mut self) {
        self.last_arrival = None;
        self.jitter_ms = 0.0;
    }
}

impl Default for ArrivalJitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_arrivals_converge_to_zero_jitter() {
        let mut est = ArrivalJitter::new();
        let period = Duration::from_millis(6);
        let start = Instant::now();
        for i in 0..100u32 {
            est.on_arrival(start + period * i, period);
        }
        assert!(est.jitter_ms() < 0.01);
    }

    #[test]
    fn irregular_arrivals_raise_the_estimate() {
        let mut est = ArrivalJitter::new();
        let period = Duration::from_millis(6);
        let start = Instant::now();
        let mut t = start;
        for i in 0..50u32 {
            // alternate 2 ms early / 2 ms late
            let jitter = if i % 2 == 0 { 4 } else { 8 };
            t += Duration::from_millis(jitter);
            est.on_arrival(t, period);
        }
        assert!(est.jitter_ms() > 1.0);
    }

    #[test]
    fn reset_clears_history() {
        let mut est = ArrivalJitter::new();
        let period = Duration::from_millis(6);
        let now = Instant::now();
        est.on_arrival(now, period);
        est.on_arrival(now + Duration::from_millis(20), period);
        assert!(est.jitter_ms() > 0.0);
        est.reset();
        assert_eq!(est.jitter_ms(), 0.0);
        assert!(est.last_arrival().is_none());
    }
}
