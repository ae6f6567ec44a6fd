//! Mixer and sync tuning

use serde::{Deserialize, Serialize};
use wavecast_packet_core::{AudioFormat, SinkId};

/// Configuration for one sink mixer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkMixerConfig {
    /// The sink this mixer feeds
    pub sink_id: SinkId,
    /// Declared output format; every emitted chunk matches it
    pub output_format: AudioFormat,
    /// Frames per chunk, matching the feeding processors
    pub chunk_frames: usize,
    /// Encode an MP3 side stream
    pub mp3_enabled: bool,
    /// MP3 bitrate, kbps
    pub mp3_bitrate_kbps: u32,
    /// Bounded MP3 frame queue; overflow drops oldest
    pub mp3_output_queue_max_size: usize,
    /// Participate in multi-sink playback sync
    pub time_sync: bool,
    /// Extra playout delay granted to sync peers, ms
    pub time_sync_delay_ms: u64,
    /// How long a silent lane is waited for before it is held
    pub underrun_hold_timeout_ms: u64,
    /// Ready-queue cap per lane, chunks
    pub max_ready_chunks_per_source: usize,
    /// Ready-queue cap per lane, as buffered duration
    pub max_ready_queue_duration_ms: u64,
}

impl SinkMixerConfig {
    /// A mixer with engine defaults for a sink id and format
    pub fn new(sink_id: SinkId, output_format: AudioFormat, chunk_frames: usize) -> Self {
        Self {
            sink_id,
            output_format,
            chunk_frames,
            mp3_enabled: false,
            mp3_bitrate_kbps: 192,
            mp3_output_queue_max_size: 512,
            time_sync: false,
            time_sync_delay_ms: 0,
            underrun_hold_timeout_ms: 120,
            max_ready_chunks_per_source: 8,
            max_ready_queue_duration_ms: 500,
        }
    }
}

/// Multi-sink synchronization tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTuning {
    /// Upper bound on any barrier wait, ms
    pub barrier_timeout_ms: u64,
    /// Largest per-sink rate trim magnitude (as a rate deviation)
    pub max_rate_adjustment: f64,
    /// Smoothing applied to trim updates, 0..1 (higher = faster)
    pub sync_smoothing_factor: f64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            barrier_timeout_ms: 20,
            max_rate_adjustment: 0.000_5,
            sync_smoothing_factor: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_serde() {
        let config = SinkMixerConfig::new(
            SinkId::new("s1"),
            AudioFormat::stereo_48k_16(),
            512,
        );
        let json = serde_json::to_string(&config).unwrap();
        let back: SinkMixerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sink_id, config.sink_id);
        assert_eq!(back.underrun_hold_timeout_ms, 120);
    }
}
