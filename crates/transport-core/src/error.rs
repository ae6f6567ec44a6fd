//! Transport errors

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by receivers and senders
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket setup or I/O failed
    #[error("socket error on {endpoint}: {source}")]
    Socket {
        /// The local or remote endpoint involved
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// An audio device could not be opened or configured
    #[error("device {device}: {operation} failed: {reason}")]
    Device {
        /// Device name
        device: String,
        /// What was attempted
        operation: &'static str,
        /// Backend-reported reason
        reason: String,
    },

    /// Codec setup or encoding failed
    #[error("{codec} encoder: {reason}")]
    Codec {
        /// Codec name
        codec: &'static str,
        /// What went wrong
        reason: String,
    },

    /// The sender was configured with a format it cannot carry
    #[error("unsupported output format for {sender}: {reason}")]
    UnsupportedFormat {
        /// Sender kind
        sender: &'static str,
        /// Why the format is unusable
        reason: String,
    },

    /// WebRTC signaling or peer-connection failure
    #[error("webrtc: {0}")]
    WebRtc(String),
}
