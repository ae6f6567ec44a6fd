//! Sink-side mixing for the WaveCast engine
//!
//! One mixer per sink pulls aligned chunks from every connected source
//! processor, sums them into the sink's output format, optionally
//! encodes an MP3 side stream, and drives the sink's senders and
//! listeners. Sinks sharing an output sample rate can enroll in a
//! global sync clock that releases identical timestamps at the same
//! wall-clock instant across the group.

pub mod config;
pub mod error;
pub mod mixer;
pub mod mp3;
pub mod sync;

pub use config::{SinkMixerConfig, SyncTuning};
pub use error::{MixerError, Result};
pub use mixer::{MixerHandle, MixerStats, SinkAudioMixer};
pub use sync::{BarrierOutcome, GlobalSyncClock, SinkSyncCoordinator};
