//! Playback rate control
//!
//! Each cursor carries a PI controller steering its effective playback
//! rate so the stream's buffered depth tracks the configured target.
//! The rate lives in a lock-free handle shared with the processor's
//! resampler, which must stay coherent with playout speed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::TimeshiftConfig;

/// Shared playback rate, readable from the DSP thread without locking
#[derive(Debug, Clone)]
pub struct RateHandle(Arc<AtomicU64>);

impl RateHandle {
    /// New handle at unity rate
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1.0f64.to_bits())))
    }

    /// Current rate (1.0 = real time)
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Publish a new rate
    pub fn set(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
    }
}

impl Default for RateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// PI controller with dead-zone, integral decay, slew limiting and an
/// additive catch-up bias
#[derive(Debug, Clone)]
pub struct PlaybackRateController {
    integral_ms: f64,
    last_rate: f64,
}

impl PlaybackRateController {
    /// New controller at unity
    pub fn new() -> Self {
        Self {
            integral_ms: 0.0,
            last_rate: 1.0,
        }
    }

    /// Update from an observed buffer depth and return the new rate
    ///
    /// `depth_ms` is how much stream time currently sits between the
    /// cursor and the newest retained packet; `target_ms` is where the
    /// controller should hold it. Depth above target speeds playout up,
    /// depth below slows it down.
    pub fn update(&mut self, depth_ms: f64, target_ms: f64, cfg: &TimeshiftConfig) -> f64 {
        let mut error_ms = depth_ms - target_ms;
        if error_ms.abs() < cfg.rate_dead_zone_ms {
            error_ms = 0.0;
        }

        self.integral_ms = self.integral_ms * cfg.rate_integral_decay + error_ms;

        let mut adjust_ppm = error_ms * cfg.rate_proportional_ppm_per_ms
            + self.integral_ms * cfg.rate_integral_ppm_per_ms;
        adjust_ppm = adjust_ppm.clamp(-cfg.max_rate_ppm, cfg.max_rate_ppm);

        // Catch-up bias engages only on gross lag and is additive on
        // top of the bounded PI output.
        if error_ms > cfg.max_catchup_lag_ms {
            let excess = error_ms - cfg.max_catchup_lag_ms;
            let bias = (excess * cfg.rate_proportional_ppm_per_ms)
                .min(cfg.playback_catchup_max_ppm);
            adjust_ppm += bias;
        }

        let target_rate = 1.0 + adjust_ppm * 1e-6;

        // Slew limit so the resampler never sees a rate step
        let max_step = cfg.rate_slew_limit_ppm * 1e-6;
        let rate = if target_rate > self.last_rate + max_step {
            self.last_rate + max_step
        } else if target_rate < self.last_rate - max_step {
            self.last_rate - max_step
        } else {
            target_rate
        };

        self.last_rate = rate;
        rate
    }

    /// Drop accumulated state (anchor reset)
    pub fn reset(&mut self) {
        self.integral_ms = 0.0;
        self.last_rate = 1.0;
    }

    /// Rate produced by the last update
    pub fn rate(&self) -> f64 {
        self.last_rate
    }
}

impl Default for PlaybackRateController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TimeshiftConfig {
        TimeshiftConfig::default()
    }

    #[test]
    fn dead_zone_holds_unity() {
        let cfg = cfg();
        let mut ctl = PlaybackRateController::new();
        for _ in 0..50 {
            ctl.update(cfg.target_buffer_level_ms + 1.0, cfg.target_buffer_level_ms, &cfg);
        }
        assert_eq!(ctl.rate(), 1.0);
    }

    #[test]
    fn deep_buffer_speeds_up_within_bounds() {
        let cfg = cfg();
        let mut ctl = PlaybackRateController::new();
        let mut rate = 1.0;
        for _ in 0..500 {
            rate = ctl.update(cfg.target_buffer_level_ms + 100.0, cfg.target_buffer_level_ms, &cfg);
        }
        assert!(rate > 1.0);
        assert!(rate <= 1.0 + (cfg.max_rate_ppm + cfg.playback_catchup_max_ppm) * 1e-6);
    }

    #[test]
    fn shallow_buffer_slows_down() {
        let cfg = cfg();
        let mut ctl = PlaybackRateController::new();
        let mut rate = 1.0;
        for _ in 0..500 {
            rate = ctl.update(10.0, cfg.target_buffer_level_ms, &cfg);
        }
        assert!(rate < 1.0);
        assert!(rate >= 1.0 - cfg.max_rate_ppm * 1e-6 - 1e-9);
    }

    #[test]
    fn slew_limit_bounds_per_update_change() {
        let cfg = cfg();
        let mut ctl = PlaybackRateController::new();
        let r1 = ctl.update(cfg.target_buffer_level_ms + 1_000.0, cfg.target_buffer_level_ms, &cfg);
        assert!((r1 - 1.0).abs() <= cfg.rate_slew_limit_ppm * 1e-6 + 1e-12);
        let r2 = ctl.update(cfg.target_buffer_level_ms + 1_000.0, cfg.target_buffer_level_ms, &cfg);
        assert!((r2 - r1).abs() <= cfg.rate_slew_limit_ppm * 1e-6 + 1e-12);
    }

    #[test]
    fn rate_handle_is_shared() {
        let handle = RateHandle::new();
        let clone = handle.clone();
        handle.set(1.0005);
        assert_eq!(clone.get(), 1.0005);
    }
}
