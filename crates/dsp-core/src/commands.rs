//! Processor control commands
//!
//! Commands are queued per processor and applied in enqueue order at
//! the next chunk boundary. Delay and timeshift changes additionally
//! reposition the timeshift cursor; the engine forwards them to the
//! timeshift manager alongside the queue entry here.

use std::collections::HashMap;

use wavecast_timeshift_core::RateHandle;

use crate::config::EQ_BANDS;
use crate::layout::SpeakerLayout;

/// A control command for one source input processor
#[derive(Debug, Clone)]
pub enum ProcessorCommand {
    /// Linear volume, 0..=1
    SetVolume(f32),
    /// Replace the 18-band EQ curve
    SetEq([f32; EQ_BANDS]),
    /// Toggle EQ normalization
    SetEqNormalization(bool),
    /// Toggle the RMS volume normalizer
    SetVolumeNormalization(bool),
    /// Playout delay in milliseconds (local bookkeeping)
    SetDelay(u64),
    /// Timeshift in signed seconds (local bookkeeping)
    SetTimeshift(f64),
    /// Replace the per-input-channel-count speaker layouts
    SetSpeakerLayouts(HashMap<u8, SpeakerLayout>),
    /// Track a sync coordinator's rate trim (unity handle to detach)
    SetSyncTrim(RateHandle),
}
