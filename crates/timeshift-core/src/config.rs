//! Timeshift manager tuning

use serde::{Deserialize, Serialize};

/// Tunables for the global buffer and the dispatch rate controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeshiftConfig {
    /// Seconds of audio retained in the global buffer
    pub retention_seconds: u64,

    /// Inbound queue high-water mark; producers drop beyond this
    pub inbound_high_water: usize,

    /// Upper bound on the dispatcher's sleep between iterations, ms
    pub loop_max_sleep_ms: u64,

    /// Buffer depth the rate controller steers toward, ms
    pub target_buffer_level_ms: f64,

    /// Depth errors smaller than this are ignored, ms
    pub rate_dead_zone_ms: f64,

    /// Proportional gain, ppm of rate per ms of depth error
    pub rate_proportional_ppm_per_ms: f64,

    /// Integral gain, ppm of rate per accumulated ms·update of error
    pub rate_integral_ppm_per_ms: f64,

    /// Integral term decay applied every update, 0..1
    pub rate_integral_decay: f64,

    /// Hard bound on rate deviation from 1.0, ppm
    pub max_rate_ppm: f64,

    /// Largest rate change allowed per update, ppm
    pub rate_slew_limit_ppm: f64,

    /// Depth overshoot beyond which catch-up bias engages, ms
    pub max_catchup_lag_ms: f64,

    /// Cap on the additive catch-up bias, ppm
    pub playback_catchup_max_ppm: f64,

    /// Silence gap after which a stream's anchor is reset, seconds
    pub rtp_session_reset_threshold_seconds: u64,

    /// Capacity of each dispatcher → processor packet lane
    pub packet_lane_capacity: usize,
}

impl Default for TimeshiftConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 300,
            inbound_high_water: 4096,
            loop_max_sleep_ms: 20,
            target_buffer_level_ms: 60.0,
            rate_dead_zone_ms: 4.0,
            rate_proportional_ppm_per_ms: 8.0,
            rate_integral_ppm_per_ms: 0.5,
            rate_integral_decay: 0.995,
            max_rate_ppm: 2_000.0,
            rate_slew_limit_ppm: 100.0,
            max_catchup_lag_ms: 500.0,
            playback_catchup_max_ppm: 5_000.0,
            rtp_session_reset_threshold_seconds: 5,
            packet_lane_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serialize() {
        let cfg = TimeshiftConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TimeshiftConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retention_seconds, cfg.retention_seconds);
        assert_eq!(back.max_rate_ppm, cfg.max_rate_ppm);
    }
}
