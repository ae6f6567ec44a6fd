//! DSP errors

use thiserror::Error;
use wavecast_packet_core::PacketError;

/// Result type for DSP operations
pub type Result<T> = std::result::Result<T, DspError>;

/// Errors raised while building or running a processing chain
#[derive(Debug, Error)]
pub enum DspError {
    /// The packet payload did not match its declared format
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// The resampler could not be constructed for a rate pair
    #[error("resampler rejected {input_rate} -> {output_rate} Hz: {reason}")]
    Resampler {
        /// Input sample rate
        input_rate: u32,
        /// Output sample rate
        output_rate: u32,
        /// Library-reported reason
        reason: String,
    },

    /// A parameter was outside its documented range
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// Offending value
        value: f64,
    },
}
