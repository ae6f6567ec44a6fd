//! Processed audio chunks
//!
//! Fixed-size mixer-ready units. A chunk holds a power-of-two frame
//! count at the sink's output rate and channel count, as interleaved
//! 32-bit accumulator samples, plus the stamps the mixer and the sync
//! coordinator need to place it in time.

use std::time::Instant;

use crate::format::AudioFormat;
use crate::ids::InstanceId;

/// Where a chunk belongs on the playout timeline
#[derive(Debug, Clone, Copy)]
pub struct PlayoutStamp {
    /// Output-rate sample clock position of the chunk's first frame
    pub rtp_timestamp: u32,
    /// Wall-clock instant the chunk is intended to play
    pub due: Instant,
}

/// A fixed-size block of sink-formatted PCM
#[derive(Debug, Clone)]
pub struct ProcessedChunk {
    /// Which source input processor produced this chunk
    pub instance_id: InstanceId,
    /// Playout position for mixing and sync coordination
    pub playout: PlayoutStamp,
    /// The sink output format the chunk was rendered for
    pub format: AudioFormat,
    /// Frame count; always the sink's configured chunk size
    pub frames: usize,
    /// Interleaved 32-bit samples, `frames * channels` long
    pub pcm: Vec<i32>,
}

impl ProcessedChunk {
    /// A silent chunk in the given format
    pub fn silence(
        instance_id: InstanceId,
        format: AudioFormat,
        frames: usize,
        playout: PlayoutStamp,
    ) -> Self {
        Self {
            instance_id,
            playout,
            format,
            frames,
            pcm: vec![0i32; frames * format.channels as usize],
        }
    }
}
