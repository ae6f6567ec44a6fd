//! Engine errors

use thiserror::Error;
use wavecast_packet_core::{InstanceId, SinkId};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned across the control surface
#[derive(Debug, Error)]
pub enum EngineError {
    /// A sink id did not resolve
    #[error("unknown sink {0}")]
    UnknownSink(SinkId),

    /// A source instance id did not resolve
    #[error("unknown source instance {0}")]
    UnknownSource(InstanceId),

    /// A listener id did not resolve on its sink
    #[error("unknown listener {listener_id} on sink {sink_id}")]
    UnknownListener {
        /// The sink searched
        sink_id: SinkId,
        /// The listener that was not there
        listener_id: String,
    },

    /// Source and sink output formats are incompatible
    #[error("source renders {source_format} but sink {sink_id} expects {sink_format}")]
    FormatMismatch {
        /// The source's rendered format
        source_format: String,
        /// The sink
        sink_id: SinkId,
        /// The sink's declared format
        sink_format: String,
    },

    /// A component setup failed; the rest of the engine continues
    #[error("{component} setup failed: {reason}")]
    ComponentSetup {
        /// Which component
        component: &'static str,
        /// Why
        reason: String,
    },

    /// Packet-layer validation error
    #[error(transparent)]
    Packet(#[from] wavecast_packet_core::PacketError),

    /// Timeshift control error
    #[error(transparent)]
    Timeshift(#[from] wavecast_timeshift_core::TimeshiftError),

    /// Mixer or sync error
    #[error(transparent)]
    Mixer(#[from] wavecast_mixer_core::MixerError),

    /// Transport error
    #[error(transparent)]
    Transport(#[from] wavecast_transport_core::TransportError),
}
