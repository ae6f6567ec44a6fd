//! Wire transports for the WaveCast engine
//!
//! Receivers parse wire formats, tag arriving packets with a stable
//! source identity, stamp them with the monotonic clock and push them
//! into the timeshift manager. Senders take mixed chunks from a sink
//! mixer and emit them over their protocol. Both sides live on
//! dedicated threads; the WebRTC sender additionally owns async state
//! inside the shared transport runtime.

pub mod error;
pub mod receiver;
pub mod runtime;
pub mod sender;

pub use error::{Result, TransportError};
pub use receiver::{ReceiverHandle, ReceiverStats};
pub use sender::{AnySender, MixedChunk, SenderStats};
