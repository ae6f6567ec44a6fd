//! Per-processor read cursors
//!
//! A cursor tracks one source input processor's position in the global
//! buffer: the next sequence to consider, the pacing anchor for due
//! times, and the PI rate controller whose output is shared with the
//! processor's resampler.

use std::time::{Duration, Instant};

use tracing::debug;
use wavecast_packet_core::{
    AudioFormat, InstanceId, PacketLaneTx, SourceTag, StreamItem,
};

use crate::buffer::GlobalBuffer;
use crate::config::TimeshiftConfig;
use crate::rate::{PlaybackRateController, RateHandle};
use crate::stats::CursorStats;

/// A registered processor's position and pacing state
#[derive(Debug)]
pub struct Cursor {
    /// Owning processor
    pub instance_id: InstanceId,
    /// Tag this cursor filters for
    pub source_tag: SourceTag,
    /// Next global sequence to examine
    pub next_seq: u64,
    /// Configured playout delay
    pub delay: Duration,
    /// Requested rewind into the retention window, seconds
    pub timeshift_sec: f64,
    /// Lane into the processor
    pub lane: PacketLaneTx,
    /// Rate shared with the processor's resampler
    pub rate: RateHandle,
    /// The PI controller producing that rate
    ctl: PlaybackRateController,
    /// When the next matching packet becomes due; `None` re-anchors
    due_at: Option<Instant>,
    /// Format of the last dispatched packet
    last_format: Option<AudioFormat>,
    /// Arrival time of the last dispatched packet, for gap detection
    last_arrival: Option<Instant>,
    /// Counters for this cursor
    pub stats: CursorStats,
}

impl Cursor {
    /// New cursor positioned at `start_seq`
    pub fn new(
        instance_id: InstanceId,
        source_tag: SourceTag,
        lane: PacketLaneTx,
        start_seq: u64,
        delay: Duration,
        timeshift_sec: f64,
    ) -> Self {
        Self {
            instance_id,
            source_tag,
            next_seq: start_seq,
            delay,
            timeshift_sec,
            lane,
            rate: RateHandle::new(),
            ctl: PlaybackRateController::new(),
            due_at: None,
            last_format: None,
            last_arrival: None,
            stats: CursorStats::default(),
        }
    }

    /// Reposition the cursor to `seq` and restart pacing
    pub fn reposition(&mut self, seq: u64) {
        self.next_seq = seq;
        self.due_at = None;
        self.ctl.reset();
        self.rate.set(1.0);
    }

    /// Clamp onto the oldest retained packet after eviction passed us
    pub fn clamp_to(&mut self, oldest_seq: u64) {
        if self.next_seq < oldest_seq {
            debug!(
                instance = %self.instance_id,
                tag = %self.source_tag,
                from = self.next_seq,
                to = oldest_seq,
                "cursor lagged past retention, clamping"
            );
            self.next_seq = oldest_seq;
            self.due_at = None;
            self.stats.lagging_events += 1;
            self.stats.underrun_events += 1;
        }
    }

    /// Dispatch every due packet for this cursor
    ///
    /// `newest_arrival` is the arrival time of the newest retained
    /// packet for this cursor's tag, maintained by the manager's
    /// ingest path. Returns the instant the next packet becomes due,
    /// or `None` when the cursor is fully caught up.
    pub fn dispatch_due(
        &mut self,
        buffer: &GlobalBuffer,
        newest_arrival: Option<Instant>,
        now: Instant,
        cfg: &TimeshiftConfig,
    ) -> Option<Instant> {
        loop {
            let entry = match buffer.get(self.next_seq) {
                Some(e) => e,
                None => return None,
            };
            if entry.packet.source_tag != self.source_tag {
                self.next_seq += 1;
                continue;
            }

            let packet = &entry.packet;

            // A long silence resets the pacing anchor so playout does
            // not burst through the gap.
            if let Some(prev) = self.last_arrival {
                let gap = packet.received_time.saturating_duration_since(prev);
                if gap.as_secs() >= cfg.rtp_session_reset_threshold_seconds {
                    self.due_at = None;
                    self.ctl.reset();
                }
            }

            let format_changed = self
                .last_format
                .is_some_and(|last| last != packet.format);
            if format_changed {
                // Format changes re-anchor; the packet goes out
                // immediately behind the reconfigure signal.
                self.due_at = None;
                self.ctl.reset();
            }

            let due = self.due_at.unwrap_or(now);
            if due > now {
                return Some(due);
            }

            if format_changed {
                self.lane
                    .try_push(StreamItem::Reconfigure(packet.format));
                self.stats.reconfig_signals += 1;
            }

            // Steer playback rate toward the target depth before
            // pacing the next packet.
            let depth_ms = newest_arrival
                .map(|newest| {
                    newest
                        .saturating_duration_since(packet.received_time)
                        .as_secs_f64()
                        * 1_000.0
                })
                .unwrap_or(0.0);
            let target_ms = cfg.target_buffer_level_ms
                + self.delay.as_secs_f64() * 1_000.0
                + self.timeshift_sec.abs() * 1_000.0;
            let rate = self.ctl.update(depth_ms, target_ms, cfg);
            self.rate.set(rate);

            if !self.lane.try_push(StreamItem::Audio(entry.packet.clone())) {
                self.stats.lane_drops += 1;
            } else {
                self.stats.dispatched_packets += 1;
            }

            let frames = packet
                .format
                .frames_in(packet.payload.len())
                .unwrap_or(0);
            let nominal = packet.format.duration_of(frames);
            let paced = Duration::from_secs_f64(nominal.as_secs_f64() / rate.max(0.5));
            // Keep the anchor from drifting far behind real time while
            // draining a backlog; the rate controller owns catch-up.
            let next_due = (due + paced).max(now - Duration::from_millis(50));
            self.due_at = Some(next_due);

            self.last_format = Some(packet.format);
            self.last_arrival = Some(packet.received_time);
            self.next_seq += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use wavecast_packet_core::{packet_lane, BitDepth, TaggedPacket};

    fn packet(tag: &str, at: Instant, rate: u32) -> Arc<TaggedPacket> {
        let fmt = AudioFormat::new(rate, BitDepth::S16, 2).unwrap();
        let mut p = TaggedPacket::new(
            SourceTag::new(tag),
            fmt,
            None,
            Bytes::from(vec![0u8; 1152]),
        );
        p.received_time = at;
        Arc::new(p)
    }

    #[test]
    fn dispatches_only_matching_tags_in_order() {
        let cfg = TimeshiftConfig::default();
        let mut buffer = GlobalBuffer::new(Duration::from_secs(300));
        let start = Instant::now();
        buffer.push(packet("a", start, 48_000));
        buffer.push(packet("b", start, 48_000));
        buffer.push(packet("a", start + Duration::from_millis(6), 48_000));

        let (tx, rx) = packet_lane(16);
        let mut cursor = Cursor::new(
            InstanceId::new("sip-1"),
            SourceTag::new("a"),
            tx,
            0,
            Duration::ZERO,
            0.0,
        );
        // First call dispatches the first packet immediately and paces
        // the second.
        let next = cursor.dispatch_due(&buffer, Some(start), start, &cfg);
        assert!(next.is_some());
        assert_eq!(cursor.stats.dispatched_packets, 1);
        // Once the pace time arrives the second follows.
        cursor.dispatch_due(&buffer, Some(start), start + Duration::from_millis(10), &cfg);
        assert_eq!(cursor.stats.dispatched_packets, 2);

        let mut seen = 0;
        while let Some(item) = rx.try_pop() {
            match item {
                StreamItem::Audio(p) => {
                    assert_eq!(p.source_tag.as_str(), "a");
                    seen += 1;
                }
                StreamItem::Reconfigure(_) => {}
            }
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn format_change_emits_reconfigure_first() {
        let cfg = TimeshiftConfig::default();
        let mut buffer = GlobalBuffer::new(Duration::from_secs(300));
        let start = Instant::now();
        buffer.push(packet("a", start, 44_100));
        buffer.push(packet("a", start + Duration::from_millis(7), 48_000));

        let (tx, rx) = packet_lane(16);
        let mut cursor = Cursor::new(
            InstanceId::new("sip-1"),
            SourceTag::new("a"),
            tx,
            0,
            Duration::ZERO,
            0.0,
        );
        cursor.dispatch_due(&buffer, Some(start), start, &cfg);
        cursor.dispatch_due(&buffer, Some(start), start + Duration::from_secs(1), &cfg);
        assert_eq!(cursor.stats.reconfig_signals, 1);

        let first = rx.try_pop().unwrap();
        assert!(matches!(first, StreamItem::Audio(_)));
        let second = rx.try_pop().unwrap();
        assert!(matches!(second, StreamItem::Reconfigure(f) if f.sample_rate == 48_000));
        let third = rx.try_pop().unwrap();
        assert!(matches!(third, StreamItem::Audio(p) if p.format.sample_rate == 48_000));
    }

    #[test]
    fn clamp_counts_one_lagging_event() {
        let (tx, _rx) = packet_lane(4);
        let mut cursor = Cursor::new(
            InstanceId::new("sip-1"),
            SourceTag::new("a"),
            tx,
            0,
            Duration::ZERO,
            0.0,
        );
        cursor.clamp_to(5);
        assert_eq!(cursor.stats.lagging_events, 1);
        assert_eq!(cursor.next_seq, 5);
        // Already at or past the head: no further event
        cursor.clamp_to(5);
        assert_eq!(cursor.stats.lagging_events, 1);
    }

    #[test]
    fn full_lane_drops_are_counted() {
        let cfg = TimeshiftConfig::default();
        let mut buffer = GlobalBuffer::new(Duration::from_secs(300));
        let start = Instant::now();
        buffer.push(packet("a", start, 48_000));

        let (tx, _rx) = packet_lane(1);
        // Fill the lane so the dispatch has nowhere to go.
        assert!(tx.try_push(StreamItem::Reconfigure(
            AudioFormat::stereo_48k_16()
        )));
        let mut cursor = Cursor::new(
            InstanceId::new("sip-1"),
            SourceTag::new("a"),
            tx,
            0,
            Duration::ZERO,
            0.0,
        );
        cursor.dispatch_due(&buffer, Some(start), start, &cfg);
        assert_eq!(cursor.stats.lane_drops, 1);
        assert_eq!(cursor.stats.dispatched_packets, 0);
    }
}
