//! Engine statistics
//!
//! Counters live with their components; this module assembles them
//! into one snapshot and runs the 1 Hz collector that derives rates
//! and drives device hotplug polling. The collector is read-only with
//! respect to audio state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use wavecast_dsp_core::{ProcessorState, ProcessorStats};
use wavecast_mixer_core::mixer::MixerStats;
use wavecast_timeshift_core::TimeshiftStats;
use wavecast_transport_core::receiver::ReceiverStats;

/// Engine-level derived rates
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GlobalRates {
    /// Packets ingested per second across all receivers
    pub packets_per_second: f64,
    /// Payload bytes ingested per second
    pub bytes_per_second: f64,
}

/// Stats for one source instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatsEntry {
    /// Tag the instance consumes
    pub source_tag: String,
    /// Lifecycle state
    pub state: ProcessorState,
    /// Processor counters
    pub stats: ProcessorStats,
    /// Current playback rate from the timeshift cursor
    pub playback_rate: f64,
}

/// The full engine snapshot the control plane retrieves
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioEngineStats {
    /// Seconds since the manager started
    pub uptime_seconds: u64,
    /// Derived global rates, updated at 1 Hz
    pub global: GlobalRates,
    /// Timeshift buffer and cursor counters
    pub timeshift: TimeshiftStats,
    /// Per-source-instance counters, keyed by instance id
    pub sources: HashMap<String, SourceStatsEntry>,
    /// Per-sink counters, keyed by sink id
    pub sinks: HashMap<String, MixerStats>,
    /// Per-receiver counters, in start order
    pub receivers: Vec<ReceiverStats>,
    /// Open capture devices
    pub open_capture_devices: usize,
}

/// State the 1 Hz collector keeps between ticks
#[derive(Debug, Default)]
pub struct RateTracker {
    last_packets: u64,
    last_bytes: u64,
    /// Latest derived rates
    pub rates: GlobalRates,
}

impl RateTracker {
    /// Fold one tick's totals into the rates
    pub fn tick(&mut self, total_packets: u64, total_bytes: u64, elapsed_secs: f64) {
        if elapsed_secs <= 0.0 {
            return;
        }
        self.rates.packets_per_second =
            total_packets.saturating_sub(self.last_packets) as f64 / elapsed_secs;
        self.rates.bytes_per_second =
            total_bytes.saturating_sub(self.last_bytes) as f64 / elapsed_secs;
        self.last_packets = total_packets;
        self.last_bytes = total_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_deltas_over_time() {
        let mut tracker = RateTracker::default();
        tracker.tick(100, 1_000, 1.0);
        assert_eq!(tracker.rates.packets_per_second, 100.0);
        tracker.tick(250, 4_000, 1.0);
        assert_eq!(tracker.rates.packets_per_second, 150.0);
        assert_eq!(tracker.rates.bytes_per_second, 3_000.0);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = AudioEngineStats::default();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("uptime_seconds"));
    }
}
