//! Bounded lanes between engine threads
//!
//! All inter-component traffic rides on bounded channels: producers
//! never block, they drop and count when a lane is full; consumers
//! poll with a timeout so shutdown is honored within one loop
//! iteration.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::chunk::ProcessedChunk;
use crate::packet::StreamItem;

/// Producer side of a packet lane
#[derive(Debug, Clone)]
pub struct PacketLaneTx(Sender<StreamItem>);

/// Consumer side of a packet lane
#[derive(Debug)]
pub struct PacketLaneRx(Receiver<StreamItem>);

/// Create a bounded packet lane
pub fn packet_lane(capacity: usize) -> (PacketLaneTx, PacketLaneRx) {
    let (tx, rx) = bounded(capacity);
    (PacketLaneTx(tx), PacketLaneRx(rx))
}

impl PacketLaneTx {
    /// Push without blocking; returns `false` when the lane is full or
    /// the consumer is gone (the caller counts the drop)
    pub fn try_push(&self, item: StreamItem) -> bool {
        match self.0.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl PacketLaneRx {
    /// Pop, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<StreamItem> {
        match self.0.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<StreamItem> {
        self.0.try_recv().ok()
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Producer side of a chunk ring (SIP → SAM)
#[derive(Debug, Clone)]
pub struct ChunkTx(Sender<ProcessedChunk>);

/// Consumer side of a chunk ring
#[derive(Debug)]
pub struct ChunkRx(Receiver<ProcessedChunk>);

/// Create a bounded chunk ring
pub fn chunk_ring(capacity: usize) -> (ChunkTx, ChunkRx) {
    let (tx, rx) = bounded(capacity);
    (ChunkTx(tx), ChunkRx(rx))
}

impl ChunkTx {
    /// Push without blocking; `false` means the ring was full or
    /// detached and the chunk was dropped
    pub fn try_push(&self, chunk: ProcessedChunk) -> bool {
        match self.0.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Chunks currently queued
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl ChunkRx {
    /// Pop, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ProcessedChunk> {
        match self.0.recv_timeout(timeout) {
            Ok(chunk) => Some(chunk),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<ProcessedChunk> {
        self.0.try_recv().ok()
    }

    /// Chunks currently queued
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Shared set of chunk rings fanning a processor's output to its sinks
///
/// The timeshift manager bookkeeps attachments on the control path; the
/// source input processor snapshots the set at each chunk boundary so
/// detachment is immediate without racing the hot loop.
#[derive(Debug, Default)]
pub struct SinkRingSet {
    rings: parking_lot::Mutex<Vec<(crate::ids::SinkId, ChunkTx)>>,
}

impl SinkRingSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a ring for a sink, replacing any previous ring for it
    pub fn attach(&self, sink_id: crate::ids::SinkId, ring: ChunkTx) {
        let mut rings = self.rings.lock();
        rings.retain(|(id, _)| *id != sink_id);
        rings.push((sink_id, ring));
    }

    /// Detach a sink's ring; returns whether it was present
    pub fn detach(&self, sink_id: &crate::ids::SinkId) -> bool {
        let mut rings = self.rings.lock();
        let before = rings.len();
        rings.retain(|(id, _)| id != sink_id);
        rings.len() != before
    }

    /// Clone the current attachment list
    pub fn snapshot(&self) -> Vec<(crate::ids::SinkId, ChunkTx)> {
        self.rings.lock().clone()
    }

    /// Number of attached sinks
    pub fn len(&self) -> usize {
        self.rings.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioFormat, BitDepth};
    use crate::ids::SourceTag;
    use crate::packet::TaggedPacket;
    use bytes::Bytes;
    use std::sync::Arc;

    fn item() -> StreamItem {
        let fmt = AudioFormat::new(48_000, BitDepth::S16, 2).unwrap();
        StreamItem::Audio(Arc::new(TaggedPacket::new(
            SourceTag::new("t"),
            fmt,
            None,
            Bytes::from_static(&[0u8; 4]),
        )))
    }

    #[test]
    fn full_lane_drops_instead_of_blocking() {
        let (tx, rx) = packet_lane(2);
        assert!(tx.try_push(item()));
        assert!(tx.try_push(item()));
        assert!(!tx.try_push(item()));
        assert!(rx.try_pop().is_some());
        assert!(tx.try_push(item()));
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let (_tx, rx) = packet_lane(1);
        assert!(rx.pop_timeout(Duration::from_millis(1)).is_none());
    }
}
