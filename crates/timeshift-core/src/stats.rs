//! Timeshift statistics
//!
//! Counters are plain fields updated under the manager's state lock;
//! the stats snapshot clones them for the 1 Hz collector.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Counters for one processor cursor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorStats {
    /// Packets copied onto the processor's lane
    pub dispatched_packets: u64,
    /// Times the cursor was clamped to the oldest retained packet
    pub lagging_events: u64,
    /// Underrun marks raised alongside lagging events
    pub underrun_events: u64,
    /// Packets dropped because the processor's lane was full
    pub lane_drops: u64,
    /// Synthetic reconfigure signals emitted on format changes
    pub reconfig_signals: u64,
}

/// Per-source-tag ingest statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    /// Packets ingested for this tag
    pub packets_received: u64,
    /// Payload bytes ingested for this tag
    pub bytes_received: u64,
    /// Smoothed inter-arrival jitter, milliseconds
    pub arrival_jitter_ms: f64,
    /// Age of the newest retained packet, milliseconds
    pub newest_age_ms: u64,
}

/// Snapshot of the whole timeshift manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeshiftStats {
    /// Packets accepted into the global buffer
    pub total_packets_added: u64,
    /// Packets dropped at the inbound high-water mark
    pub total_inbound_dropped: u64,
    /// Packets evicted by retention
    pub total_evicted: u64,
    /// Packets currently retained
    pub retained_packets: usize,
    /// Sum of lagging events across all cursors
    pub stream_lagging_events: u64,
    /// Per-tag ingest stats, keyed by source tag
    pub streams: HashMap<String, StreamStats>,
    /// Per-cursor stats keyed by instance id, with the current
    /// playback rate alongside
    pub cursors: HashMap<String, (CursorStats, f64)>,
}
