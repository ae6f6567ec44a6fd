//! Global timeshift buffer and rate-controlled packet dispatch
//!
//! Every ingested packet lands in one append-only, time-ordered store
//! with roughly five minutes of retention. Each source input processor
//! owns a read cursor into the store; a single dispatcher thread
//! advances the cursors at a rate that tracks real time modulo
//! per-stream jitter and user-requested delay/timeshift, copying due
//! packets onto the processors' lanes.

pub mod buffer;
pub mod config;
pub mod cursor;
pub mod error;
pub mod jitter;
pub mod manager;
pub mod rate;
pub mod stats;

pub use config::TimeshiftConfig;
pub use error::{Result, TimeshiftError};
pub use manager::{RegisteredProcessor, TimeshiftExport, TimeshiftManager};
pub use rate::RateHandle;
pub use stats::{CursorStats, StreamStats, TimeshiftStats};
