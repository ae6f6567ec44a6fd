//! Mixer errors

use thiserror::Error;
use wavecast_packet_core::SinkId;

/// Result type for mixer operations
pub type Result<T> = std::result::Result<T, MixerError>;

/// Errors raised by sink mixers and the sync coordinator
#[derive(Debug, Error)]
pub enum MixerError {
    /// A control call referenced a sink that is not running
    #[error("sink {sink_id} is not running")]
    SinkNotRunning {
        /// The sink in question
        sink_id: SinkId,
    },

    /// The MP3 encoder could not be configured
    #[error("mp3 encoder: {reason}")]
    Mp3 {
        /// Encoder-reported reason
        reason: String,
    },

    /// A coordinator was requested for a mismatched sample rate
    #[error("sink rate {sink_rate} does not match sync group rate {group_rate}")]
    SyncRateMismatch {
        /// The sink's output rate
        sink_rate: u32,
        /// The group clock's rate
        group_rate: u32,
    },
}
