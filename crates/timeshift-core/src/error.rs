//! Timeshift manager errors

use thiserror::Error;
use wavecast_packet_core::{InstanceId, SourceTag};

/// Result type for timeshift operations
pub type Result<T> = std::result::Result<T, TimeshiftError>;

/// Errors surfaced by the timeshift manager's control path
#[derive(Debug, Error)]
pub enum TimeshiftError {
    /// A control operation referenced a processor that is not registered
    #[error("no processor registered as {instance_id} for tag {source_tag}")]
    UnknownProcessor {
        /// The processor instance
        instance_id: InstanceId,
        /// The tag it was expected under
        source_tag: SourceTag,
    },

    /// A processor id was registered twice
    #[error("processor {instance_id} is already registered")]
    DuplicateProcessor {
        /// The offending instance
        instance_id: InstanceId,
    },

    /// The manager is shut down
    #[error("timeshift manager is not running")]
    NotRunning,
}
