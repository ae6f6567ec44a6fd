//! Per-source DSP processing for the WaveCast engine
//!
//! A source input processor turns the variable-format tagged packet
//! stream the timeshift manager dispatches to it into fixed-format
//! processed chunks matching a sink's declared output. The chain runs,
//! in order: decode, channel remap, resample, 18-band EQ, volume
//! normalization, DC filter, smoothed volume, dither.

pub mod commands;
pub mod config;
pub mod decode;
pub mod eq;
pub mod error;
pub mod filters;
pub mod layout;
pub mod normalize;
pub mod processor;
pub mod resample;
pub mod volume;

pub use commands::ProcessorCommand;
pub use config::{DspTuning, SourceParams};
pub use error::{DspError, Result};
pub use layout::SpeakerLayout;
pub use processor::{ProcessorHandle, ProcessorState, ProcessorStats, SourceInputProcessor};
