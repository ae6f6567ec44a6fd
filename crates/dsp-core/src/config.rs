//! DSP tuning and per-source parameters

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::layout::SpeakerLayout;

/// Number of EQ bands
pub const EQ_BANDS: usize = 18;

/// Engine-wide DSP tuning, shared by every processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DspTuning {
    /// Frames per processed chunk at the sink output rate; power of two
    pub chunk_frames: usize,

    /// DC-blocking high-pass cutoff, Hz; 0 disables the filter
    pub dc_filter_cutoff_hz: f32,

    /// RMS level volume normalization steers toward, 0..1 full scale
    pub normalization_target_rms: f32,

    /// Normalizer attack time constant, ms
    pub normalization_attack_ms: f32,

    /// Normalizer decay time constant, ms
    pub normalization_decay_ms: f32,

    /// Upper bound on normalizer makeup gain
    pub normalization_max_gain: f32,

    /// Volume smoothing factor per chunk, 0..1 (higher = faster)
    pub volume_smoothing: f32,

    /// Noise-shaping feedback factor for the dither stage, 0..1
    pub dither_noise_shaping: f32,

    /// Playback-rate deviation below which same-rate streams bypass
    /// the resampler, ppm
    pub resample_passthrough_ppm: f64,

    /// Seconds without a packet before the processor goes idle
    pub idle_timeout_seconds: u64,

    /// Capacity of each processor → sink chunk ring
    pub chunk_ring_capacity: usize,
}

impl Default for DspTuning {
    fn default() -> Self {
        Self {
            chunk_frames: 512,
            dc_filter_cutoff_hz: 0.0,
            normalization_target_rms: 0.18,
            normalization_attack_ms: 40.0,
            normalization_decay_ms: 400.0,
            normalization_max_gain: 8.0,
            volume_smoothing: 0.15,
            dither_noise_shaping: 0.6,
            resample_passthrough_ppm: 100.0,
            idle_timeout_seconds: 3,
            chunk_ring_capacity: 32,
        }
    }
}

/// The mutable per-source parameters a processor applies at chunk
/// boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceParams {
    /// Linear volume, 0..=1
    pub volume: f32,
    /// Per-band EQ gains in [0, 2]; 1.0 is unity
    pub eq_gains: [f32; EQ_BANDS],
    /// Compensate the EQ curve so unity input stays at unity level
    pub eq_normalization: bool,
    /// Enable the slow RMS volume normalizer
    pub volume_normalization: bool,
    /// Playout delay, ms (bookkeeping; positioning lives in the
    /// timeshift manager)
    pub delay_ms: u64,
    /// Requested timeshift, seconds (bookkeeping, as above)
    pub timeshift_sec: f64,
    /// Speaker layout per input channel count
    pub speaker_layouts: HashMap<u8, SpeakerLayout>,
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            eq_gains: [1.0; EQ_BANDS],
            eq_normalization: false,
            volume_normalization: false,
            delay_ms: 0,
            timeshift_sec: 0.0,
            speaker_layouts: HashMap::new(),
        }
    }
}

impl SourceParams {
    /// Whether the EQ curve is flat (no filtering required)
    pub fn eq_is_flat(&self) -> bool {
        self.eq_gains.iter().all(|g| (*g - 1.0).abs() < 1e-6)
    }

    /// The effective remap matrix for a channel pair
    pub fn layout_matrix(&self, in_channels: u8, out_channels: u8) -> [[f32; 8]; 8] {
        self.speaker_layouts
            .get(&in_channels)
            .cloned()
            .unwrap_or_else(SpeakerLayout::auto)
            .effective_matrix(in_channels, out_channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_serde() {
        let params = SourceParams::default();
        let json = serde_json::to_string(&params).unwrap();
        let back: SourceParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.volume, 1.0);
        assert!(back.eq_is_flat());
    }

    #[test]
    fn chunk_frames_default_is_a_power_of_two() {
        let tuning = DspTuning::default();
        assert!(tuning.chunk_frames.is_power_of_two());
    }
}
