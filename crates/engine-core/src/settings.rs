//! Engine-wide settings
//!
//! Settings are published as immutable snapshots: writers swap the
//! current `Arc`, readers clone it at loop-iteration boundaries and
//! never observe a torn update.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use wavecast_dsp_core::DspTuning;
use wavecast_mixer_core::SyncTuning;
use wavecast_timeshift_core::TimeshiftConfig;

/// Mixer-side defaults applied to newly created sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerTuning {
    /// Default MP3 bitrate, kbps
    pub mp3_bitrate_kbps: u32,
    /// Bounded MP3 frame queue per sink
    pub mp3_output_queue_max_size: usize,
    /// How long a quiet lane is waited for before being held, ms
    pub underrun_hold_timeout_ms: u64,
    /// Ready-queue cap per lane, chunks
    pub max_ready_chunks_per_source: usize,
    /// Ready-queue cap per lane, buffered duration, ms
    pub max_ready_queue_duration_ms: u64,
}

impl Default for MixerTuning {
    fn default() -> Self {
        Self {
            mp3_bitrate_kbps: 192,
            mp3_output_queue_max_size: 512,
            underrun_hold_timeout_ms: 120,
            max_ready_chunks_per_source: 8,
            max_ready_queue_duration_ms: 500,
        }
    }
}

/// Every tunable the audio engine consults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioEngineSettings {
    /// Timeshift buffer and dispatch tuning
    pub timeshift: TimeshiftConfig,
    /// Per-source DSP tuning
    pub dsp: DspTuning,
    /// Mixer defaults
    pub mixer_tuning: MixerTuning,
    /// Multi-sink synchronization tuning
    pub sync: SyncTuning,
}

/// Publish/subscribe holder for the current settings snapshot
pub struct SettingsHub {
    current: RwLock<Arc<AudioEngineSettings>>,
}

impl SettingsHub {
    /// Start from the given settings
    pub fn new(settings: AudioEngineSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// The current snapshot; cheap to call every loop iteration
    pub fn snapshot(&self) -> Arc<AudioEngineSettings> {
        Arc::clone(&self.current.read())
    }

    /// Publish a new snapshot
    pub fn publish(&self, settings: AudioEngineSettings) {
        *self.current.write() = Arc::new(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_are_immutable_across_publish() {
        let hub = SettingsHub::new(AudioEngineSettings::default());
        let before = hub.snapshot();
        let mut changed = AudioEngineSettings::default();
        changed.mixer_tuning.mp3_bitrate_kbps = 320;
        hub.publish(changed);
        assert_eq!(before.mixer_tuning.mp3_bitrate_kbps, 192);
        assert_eq!(hub.snapshot().mixer_tuning.mp3_bitrate_kbps, 320);
    }

    #[test]
    fn settings_round_trip_through_serde() {
        let settings = AudioEngineSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: AudioEngineSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.timeshift.retention_seconds,
            settings.timeshift.retention_seconds
        );
        assert_eq!(back.sync.barrier_timeout_ms, settings.sync.barrier_timeout_ms);
    }
}
