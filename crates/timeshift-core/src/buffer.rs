//! The global append-only packet store
//!
//! One deque holds every retained packet across all sources, in
//! arrival order, each entry stamped with a monotonically increasing
//! sequence number. Only the dispatcher thread mutates the deque.
//! Eviction trims the head on retention age; cursors that have not
//! passed an evicted entry are clamped by the manager and report a
//! lagging event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use wavecast_packet_core::{SourceTag, TaggedPacket};

/// One retained packet with its global sequence number
#[derive(Debug, Clone)]
pub struct BufferEntry {
    /// Global arrival sequence
    pub seq: u64,
    /// The packet itself, shared with every lane it is dispatched to
    pub packet: Arc<TaggedPacket>,
}

/// Append-only retained-packet deque
#[derive(Debug)]
pub struct GlobalBuffer {
    entries: VecDeque<BufferEntry>,
    next_seq: u64,
    retention: Duration,
}

impl GlobalBuffer {
    /// New buffer with the given retention window
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            retention,
        }
    }

    /// Append a packet, assigning its sequence number
    pub fn push(&mut self, packet: Arc<TaggedPacket>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(BufferEntry { seq, packet });
        seq
    }

    /// Sequence number the next appended packet will receive
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Oldest retained sequence, or `next_seq` when empty
    pub fn oldest_seq(&self) -> u64 {
        self.entries.front().map(|e| e.seq).unwrap_or(self.next_seq)
    }

    /// Retained packet count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Look up an entry by sequence number
    ///
    /// Sequences are contiguous, so the lookup is an index offset from
    /// the head.
    pub fn get(&self, seq: u64) -> Option<&BufferEntry> {
        let head = self.entries.front()?.seq;
        if seq < head {
            return None;
        }
        self.entries.get((seq - head) as usize)
    }

    /// Drop head entries older than the retention window
    ///
    /// Returns the number of evicted packets. Cursor clamping is the
    /// manager's job; eviction proceeds on age alone so a stalled
    /// consumer cannot pin five minutes of audio forever.
    pub fn evict(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.packet.received_time) > self.retention {
                self.entries.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    /// Update the retention window
    pub fn set_retention(&mut self, retention: Duration) {
        self.retention = retention;
    }

    /// First sequence at or after `target` arrival time, clamped into
    /// the retained range
    pub fn seq_at_or_after(&self, target: Instant) -> u64 {
        // Arrival times are non-decreasing, so partition point works.
        let head = match self.entries.front() {
            Some(e) => e.seq,
            None => return self.next_seq,
        };
        let idx = self
            .entries
            .partition_point(|e| e.packet.received_time < target);
        head + idx as u64
    }

    /// Arrival time of the newest retained packet for a tag
    pub fn newest_arrival_for(&self, tag: &SourceTag) -> Option<Instant> {
        self.entries
            .iter()
            .rev()
            .find(|e| &e.packet.source_tag == tag)
            .map(|e| e.packet.received_time)
    }

    /// Snapshot the retained packets of one tag within a lookback
    /// window, oldest first
    pub fn lookback(&self, tag: &SourceTag, lookback: Duration, now: Instant) -> Vec<Arc<TaggedPacket>> {
        self.entries
            .iter()
            .filter(|e| {
                &e.packet.source_tag == tag
                    && now.saturating_duration_since(e.packet.received_time) <= lookback
            })
            .map(|e| Arc::clone(&e.packet))
            .collect()
    }

    /// Age of the oldest retained packet
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.entries
            .front()
            .map(|e| now.saturating_duration_since(e.packet.received_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wavecast_packet_core::{AudioFormat, BitDepth};

    fn pkt(tag: &str, at: Instant) -> Arc<TaggedPacket> {
        let fmt = AudioFormat::new(48_000, BitDepth::S16, 2).unwrap();
        let mut p = TaggedPacket::new(SourceTag::new(tag), fmt, None, Bytes::from(vec![0u8; 4]));
        p.received_time = at;
        Arc::new(p)
    }

    #[test]
    fn sequences_are_contiguous_and_indexable() {
        let mut buf = GlobalBuffer::new(Duration::from_secs(300));
        let now = Instant::now();
        for i in 0..10 {
            let seq = buf.push(pkt("a", now + Duration::from_millis(i)));
            assert_eq!(seq, i);
        }
        assert_eq!(buf.get(3).unwrap().seq, 3);
        assert!(buf.get(10).is_none());
    }

    #[test]
    fn eviction_respects_retention() {
        let mut buf = GlobalBuffer::new(Duration::from_secs(1));
        let start = Instant::now();
        buf.push(pkt("a", start));
        buf.push(pkt("a", start + Duration::from_millis(1_500)));
        let evicted = buf.evict(start + Duration::from_millis(2_100));
        assert_eq!(evicted, 1);
        assert_eq!(buf.oldest_seq(), 1);
        assert!(buf.get(0).is_none());
    }

    #[test]
    fn seq_at_or_after_positions_within_window() {
        let mut buf = GlobalBuffer::new(Duration::from_secs(300));
        let start = Instant::now();
        for i in 0..10u64 {
            buf.push(pkt("a", start + Duration::from_millis(10 * i)));
        }
        assert_eq!(buf.seq_at_or_after(start), 0);
        assert_eq!(buf.seq_at_or_after(start + Duration::from_millis(35)), 4);
        assert_eq!(buf.seq_at_or_after(start + Duration::from_secs(10)), 10);
    }

    #[test]
    fn lookback_filters_by_tag_and_age() {
        let mut buf = GlobalBuffer::new(Duration::from_secs(300));
        let start = Instant::now();
        buf.push(pkt("a", start));
        buf.push(pkt("b", start + Duration::from_millis(10)));
        buf.push(pkt("a", start + Duration::from_millis(900)));
        let now = start + Duration::from_millis(1_000);
        let recent = buf.lookback(&SourceTag::new("a"), Duration::from_millis(500), now);
        assert_eq!(recent.len(), 1);
        let all = buf.lookback(&SourceTag::new("a"), Duration::from_secs(5), now);
        assert_eq!(all.len(), 2);
    }
}
