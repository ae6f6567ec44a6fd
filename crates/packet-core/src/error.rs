//! Error types for packet handling and wire codecs

use thiserror::Error;

/// Result type for packet operations
pub type Result<T> = std::result::Result<T, PacketError>;

/// Errors raised while building or parsing engine data units
#[derive(Debug, Error)]
pub enum PacketError {
    /// A wire datagram was too short or structurally invalid
    #[error("malformed {protocol} datagram: {reason}")]
    MalformedDatagram {
        /// Wire protocol that rejected the datagram
        protocol: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// A format field carried a value the engine does not support
    #[error("unsupported format: {field} = {value}")]
    UnsupportedFormat {
        /// Which format field was out of range
        field: &'static str,
        /// The offending value
        value: u32,
    },

    /// Payload length is not a whole number of frames
    #[error("payload of {len} bytes is not a multiple of the {frame_bytes}-byte frame")]
    RaggedPayload {
        /// Payload length in bytes
        len: usize,
        /// Bytes per interleaved frame
        frame_bytes: usize,
    },
}
