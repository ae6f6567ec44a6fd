//! Tagged audio packets
//!
//! A tagged packet is the fundamental ingest unit: a variable-format
//! PCM payload plus the source identity, arrival timestamp and format
//! metadata. Packets are immutable once built and shared by reference
//! between the timeshift buffer and every consumer lane.

use std::time::Instant;

use bytes::Bytes;

use crate::error::Result;
use crate::format::AudioFormat;
use crate::ids::SourceTag;

/// A PCM payload with identity and format metadata
#[derive(Debug, Clone)]
pub struct TaggedPacket {
    /// Stable identity of the producing source
    pub source_tag: SourceTag,
    /// Monotonic arrival timestamp, assigned by the receiver
    pub received_time: Instant,
    /// Declared payload format; may change between consecutive packets
    pub format: AudioFormat,
    /// RTP timestamp when the source carries one, used for ordering
    /// and continuity within the stream
    pub rtp_timestamp: Option<u32>,
    /// Interleaved little-endian PCM
    pub payload: Bytes,
}

impl TaggedPacket {
    /// Build a packet, stamping it with the current monotonic time
    pub fn new(
        source_tag: SourceTag,
        format: AudioFormat,
        rtp_timestamp: Option<u32>,
        payload: Bytes,
    ) -> Self {
        Self {
            source_tag,
            received_time: Instant::now(),
            format,
            rtp_timestamp,
            payload,
        }
    }

    /// Number of whole interleaved frames in the payload
    pub fn frames(&self) -> Result<usize> {
        self.format.frames_in(self.payload.len())
    }
}

/// What travels down a packet lane from the timeshift dispatcher to a
/// source input processor
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// An audio packet due for processing
    Audio(std::sync::Arc<TaggedPacket>),
    /// The source's declared format changed; the processor must drain
    /// and rebuild its chain before consuming further audio
    Reconfigure(AudioFormat),
}

impl StreamItem {
    /// The format this item carries
    pub fn format(&self) -> AudioFormat {
        match self {
            StreamItem::Audio(pkt) => pkt.format,
            StreamItem::Reconfigure(fmt) => *fmt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BitDepth;

    #[test]
    fn packet_frame_count() {
        let fmt = AudioFormat::new(48_000, BitDepth::S16, 2).unwrap();
        let pkt = TaggedPacket::new(
            SourceTag::new("10.0.0.1"),
            fmt,
            None,
            Bytes::from(vec![0u8; 1152]),
        );
        assert_eq!(pkt.frames().unwrap(), 288);
    }
}
