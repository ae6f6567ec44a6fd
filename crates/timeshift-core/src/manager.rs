//! The timeshift manager and its dispatcher thread
//!
//! Producers call [`TimeshiftManager::add_packet`] from any thread; a
//! bounded inbound queue decouples them from the single dispatcher,
//! which owns the global buffer. Cursor registration and repositioning
//! happen on the control path under the state mutex; the dispatcher
//! takes the same mutex per iteration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use wavecast_packet_core::{
    AudioFormat, ChunkTx, InstanceId, PacketLaneTx, SinkId, SinkRingSet, SourceTag, TaggedPacket,
};

use crate::buffer::GlobalBuffer;
use crate::config::TimeshiftConfig;
use crate::cursor::Cursor;
use crate::error::{Result, TimeshiftError};
use crate::jitter::ArrivalJitter;
use crate::rate::RateHandle;
use crate::stats::{StreamStats, TimeshiftStats};

/// What a processor gets back from registration
#[derive(Debug, Clone)]
pub struct RegisteredProcessor {
    /// The playback rate the processor's resampler must track
    pub rate: RateHandle,
    /// The processor's chunk fan-out set, bookkept by the manager
    pub sink_rings: Arc<SinkRingSet>,
}

/// A retained-audio export for one source tag
#[derive(Debug, Clone)]
pub struct TimeshiftExport {
    /// Concatenated little-endian PCM in `format`
    pub pcm: Vec<u8>,
    /// Format shared by every included packet
    pub format: AudioFormat,
    /// Seconds of audio in `pcm`
    pub duration_seconds: f64,
    /// Age of the oldest included packet
    pub earliest_packet_age_seconds: f64,
    /// Age of the newest included packet
    pub latest_packet_age_seconds: f64,
    /// The lookback that was asked for
    pub lookback_seconds_requested: f64,
}

/// Per-tag ingest bookkeeping
#[derive(Debug, Default)]
struct TagState {
    jitter: ArrivalJitter,
    newest_arrival: Option<Instant>,
    packets: u64,
    bytes: u64,
}

/// State owned jointly by the dispatcher and the control path
struct State {
    buffer: GlobalBuffer,
    cursors: HashMap<InstanceId, Cursor>,
    sink_rings: HashMap<InstanceId, Arc<SinkRingSet>>,
    tags: HashMap<SourceTag, TagState>,
}

struct Inner {
    cfg: RwLock<TimeshiftConfig>,
    state: Mutex<State>,
    inbound_tx: Sender<Arc<TaggedPacket>>,
    running: AtomicBool,
    total_added: AtomicU64,
    total_dropped: AtomicU64,
    total_evicted: AtomicU64,
}

/// Global timeshift buffer with per-processor dispatch
pub struct TimeshiftManager {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TimeshiftManager {
    /// Create the manager and start its dispatcher thread
    pub fn start(cfg: TimeshiftConfig) -> Self {
        let (inbound_tx, inbound_rx) = bounded(cfg.inbound_high_water);
        let retention = Duration::from_secs(cfg.retention_seconds);
        let inner = Arc::new(Inner {
            cfg: RwLock::new(cfg),
            state: Mutex::new(State {
                buffer: GlobalBuffer::new(retention),
                cursors: HashMap::new(),
                sink_rings: HashMap::new(),
                tags: HashMap::new(),
            }),
            inbound_tx,
            running: AtomicBool::new(true),
            total_added: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        });

        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("timeshift-dispatch".to_string())
            .spawn(move || dispatcher_loop(thread_inner, inbound_rx))
            .expect("spawning the timeshift dispatcher cannot fail");

        info!("timeshift manager started");
        Self {
            inner,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Producer-side packet intake; drops (and counts) beyond the
    /// inbound high-water mark
    pub fn add_packet(&self, packet: TaggedPacket) {
        match self.inner.inbound_tx.try_send(Arc::new(packet)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Register a processor cursor, positioning it `delay + timeshift`
    /// back inside the retention window (clamped to the oldest
    /// retained packet)
    pub fn register_processor(
        &self,
        instance_id: InstanceId,
        source_tag: SourceTag,
        lane: PacketLaneTx,
        initial_delay_ms: u64,
        initial_timeshift_sec: f64,
    ) -> Result<RegisteredProcessor> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(TimeshiftError::NotRunning);
        }
        let mut state = self.inner.state.lock();
        if state.cursors.contains_key(&instance_id) {
            return Err(TimeshiftError::DuplicateProcessor { instance_id });
        }

        let start_seq = position_seq(
            &state.buffer,
            Duration::from_millis(initial_delay_ms),
            initial_timeshift_sec,
        );
        let cursor = Cursor::new(
            instance_id.clone(),
            source_tag.clone(),
            lane,
            start_seq,
            Duration::from_millis(initial_delay_ms),
            initial_timeshift_sec,
        );
        let rate = cursor.rate.clone();
        let sink_rings = Arc::new(SinkRingSet::new());
        state.sink_rings.insert(instance_id.clone(), Arc::clone(&sink_rings));
        state.cursors.insert(instance_id.clone(), cursor);
        debug!(instance = %instance_id, tag = %source_tag, "processor registered");
        Ok(RegisteredProcessor { rate, sink_rings })
    }

    /// Reposition a cursor for a new delay
    pub fn update_processor_delay(&self, instance_id: &InstanceId, delay_ms: u64) -> Result<()> {
        self.reposition(instance_id, |c| {
            c.delay = Duration::from_millis(delay_ms);
        })
    }

    /// Reposition a cursor for a new timeshift
    pub fn update_processor_timeshift(
        &self,
        instance_id: &InstanceId,
        timeshift_sec: f64,
    ) -> Result<()> {
        self.reposition(instance_id, |c| {
            c.timeshift_sec = timeshift_sec;
        })
    }

    fn reposition(
        &self,
        instance_id: &InstanceId,
        apply: impl FnOnce(&mut Cursor),
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        let State {
            buffer, cursors, ..
        } = &mut *state;
        let cursor = cursors
            .get_mut(instance_id)
            .ok_or_else(|| TimeshiftError::UnknownProcessor {
                instance_id: instance_id.clone(),
                source_tag: SourceTag::new(""),
            })?;
        apply(cursor);

        let now = Instant::now();
        let rewind = cursor.delay + Duration::from_secs_f64(cursor.timeshift_sec.abs());
        let target = now.checked_sub(rewind).unwrap_or(now);
        // A rewind past the oldest entry is only a lagging event when
        // retention actually discarded audio; asking for time before
        // the stream existed loses nothing.
        let evicted_any = self.inner.total_evicted.load(Ordering::Relaxed) > 0;
        let clamped = evicted_any
            && match buffer.oldest_age(now) {
                Some(oldest_age) => rewind > oldest_age,
                None => false,
            };
        let seq = buffer.seq_at_or_after(target);
        cursor.reposition(seq);
        if clamped {
            cursor.stats.lagging_events += 1;
            warn!(
                instance = %instance_id,
                rewind_secs = rewind.as_secs_f64(),
                "requested playback point no longer retained, clamped"
            );
        }
        Ok(())
    }

    /// Remove a cursor; retention is recomputed on the next evict pass
    pub fn unregister_processor(&self, instance_id: &InstanceId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let removed = state.cursors.remove(instance_id);
        if removed.is_some() {
            state.sink_rings.remove(instance_id);
            Ok(())
        } else {
            Err(TimeshiftError::UnknownProcessor {
                instance_id: instance_id.clone(),
                source_tag: SourceTag::new(""),
            })
        }
    }

    /// Attach a chunk ring for one of the processor's sinks
    pub fn attach_sink_ring(
        &self,
        instance_id: &InstanceId,
        sink_id: SinkId,
        ring: ChunkTx,
    ) -> Result<()> {
        let state = self.inner.state.lock();
        let rings = state.sink_rings.get(instance_id).ok_or_else(|| {
            TimeshiftError::UnknownProcessor {
                instance_id: instance_id.clone(),
                source_tag: SourceTag::new(""),
            }
        })?;
        rings.attach(sink_id, ring);
        Ok(())
    }

    /// Detach a sink's ring; takes effect at the processor's next
    /// chunk boundary
    pub fn detach_sink_ring(&self, instance_id: &InstanceId, sink_id: &SinkId) -> Result<()> {
        let state = self.inner.state.lock();
        let rings = state.sink_rings.get(instance_id).ok_or_else(|| {
            TimeshiftError::UnknownProcessor {
                instance_id: instance_id.clone(),
                source_tag: SourceTag::new(""),
            }
        })?;
        rings.detach(sink_id);
        Ok(())
    }

    /// Export the retained audio of one tag over a lookback window
    pub fn export_lookback(&self, source_tag: &SourceTag, lookback_sec: f64) -> TimeshiftExport {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let packets = state.buffer.lookback(
            source_tag,
            Duration::from_secs_f64(lookback_sec.max(0.0)),
            now,
        );

        // Only packets matching the newest format are exported; a
        // mid-window format change truncates the blob at the change.
        let format = packets
            .last()
            .map(|p| p.format)
            .unwrap_or_else(AudioFormat::stereo_48k_16);
        let matching: Vec<_> = packets
            .iter()
            .rev()
            .take_while(|p| p.format == format)
            .collect();

        let mut pcm = Vec::new();
        for p in matching.iter().rev() {
            pcm.extend_from_slice(&p.payload);
        }
        let frames = pcm.len() / format.bytes_per_frame().max(1);
        let age = |i: Option<&&Arc<TaggedPacket>>| {
            i.map(|p| now.saturating_duration_since(p.received_time).as_secs_f64())
                .unwrap_or(0.0)
        };
        TimeshiftExport {
            duration_seconds: frames as f64 / format.sample_rate as f64,
            earliest_packet_age_seconds: age(matching.last()),
            latest_packet_age_seconds: age(matching.first()),
            lookback_seconds_requested: lookback_sec,
            format,
            pcm,
        }
    }

    /// Replace the tuning; takes effect on the next dispatcher pass
    pub fn set_config(&self, cfg: TimeshiftConfig) {
        let retention = Duration::from_secs(cfg.retention_seconds);
        *self.inner.cfg.write() = cfg;
        self.inner.state.lock().buffer.set_retention(retention);
    }

    /// Current tuning
    pub fn config(&self) -> TimeshiftConfig {
        self.inner.cfg.read().clone()
    }

    /// Snapshot all counters
    pub fn stats(&self) -> TimeshiftStats {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let streams = state
            .tags
            .iter()
            .map(|(tag, ts)| {
                (
                    tag.to_string(),
                    StreamStats {
                        packets_received: ts.packets,
                        bytes_received: ts.bytes,
                        arrival_jitter_ms: ts.jitter.jitter_ms(),
                        newest_age_ms: ts
                            .newest_arrival
                            .map(|a| now.saturating_duration_since(a).as_millis() as u64)
                            .unwrap_or(0),
                    },
                )
            })
            .collect();
        let cursors = state
            .cursors
            .iter()
            .map(|(id, c)| (id.to_string(), (c.stats.clone(), c.rate.get())))
            .collect();
        TimeshiftStats {
            total_packets_added: self.inner.total_added.load(Ordering::Relaxed),
            total_inbound_dropped: self.inner.total_dropped.load(Ordering::Relaxed),
            total_evicted: self.inner.total_evicted.load(Ordering::Relaxed),
            retained_packets: state.buffer.len(),
            stream_lagging_events: state
                .cursors
                .values()
                .map(|c| c.stats.lagging_events)
                .sum(),
            streams,
            cursors,
        }
    }

    /// Stop the dispatcher and join it
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
        info!("timeshift manager stopped");
    }
}

impl Drop for TimeshiftManager {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Compute the start sequence for a rewind of `delay + |timeshift|`
fn position_seq(buffer: &GlobalBuffer, delay: Duration, timeshift_sec: f64) -> u64 {
    let rewind = delay + Duration::from_secs_f64(timeshift_sec.abs());
    let now = Instant::now();
    let target = now.checked_sub(rewind).unwrap_or(now);
    buffer.seq_at_or_after(target)
}

fn dispatcher_loop(inner: Arc<Inner>, inbound_rx: Receiver<Arc<TaggedPacket>>) {
    let mut sleep = Duration::from_millis(1);
    while inner.running.load(Ordering::Acquire) {
        // Sleeping on the inbound channel doubles as the wakeup for
        // fresh packets.
        let first = inbound_rx.recv_timeout(sleep).ok();

        let cfg = inner.cfg.read().clone();
        let now = Instant::now();
        let mut state = inner.state.lock();

        // 1. Drain the inbound queue into the global deque.
        let mut pending = first;
        while let Some(packet) = pending {
            ingest(&mut state, &inner, packet);
            pending = inbound_rx.try_recv().ok();
        }

        // 2. Dispatch every due cursor, tracking the nearest due time.
        let mut next_due: Option<Instant> = None;
        let State {
            buffer,
            cursors,
            tags,
            ..
        } = &mut *state;
        for cursor in cursors.values_mut() {
            let newest = tags
                .get(&cursor.source_tag)
                .and_then(|t| t.newest_arrival);
            if let Some(due) = cursor.dispatch_due(buffer, newest, now, &cfg) {
                next_due = Some(match next_due {
                    Some(cur) => cur.min(due),
                    None => due,
                });
            }
        }

        // 3. Evict on retention and clamp any cursor left behind.
        let evicted = buffer.evict(now);
        if evicted > 0 {
            inner
                .total_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            let oldest = buffer.oldest_seq();
            for cursor in cursors.values_mut() {
                cursor.clamp_to(oldest);
            }
        }
        drop(state);

        let max_sleep = Duration::from_millis(cfg.loop_max_sleep_ms);
        sleep = match next_due {
            Some(due) => due.saturating_duration_since(Instant::now()).min(max_sleep),
            None => max_sleep,
        }
        .max(Duration::from_micros(500));
    }
}

fn ingest(state: &mut State, inner: &Inner, packet: Arc<TaggedPacket>) {
    let tag_state = state
        .tags
        .entry(packet.source_tag.clone())
        .or_default();
    let period = packet.format.packet_period(packet.payload.len());
    tag_state.jitter.on_arrival(packet.received_time, period);
    tag_state.newest_arrival = Some(packet.received_time);
    tag_state.packets += 1;
    tag_state.bytes += packet.payload.len() as u64;
    state.buffer.push(packet);
    inner.total_added.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wavecast_packet_core::{packet_lane, BitDepth, StreamItem};

    fn test_cfg() -> TimeshiftConfig {
        TimeshiftConfig {
            loop_max_sleep_ms: 5,
            ..TimeshiftConfig::default()
        }
    }

    fn packet(tag: &str) -> TaggedPacket {
        let fmt = AudioFormat::new(48_000, BitDepth::S16, 2).unwrap();
        TaggedPacket::new(SourceTag::new(tag), fmt, None, Bytes::from(vec![1u8; 1152]))
    }

    #[test]
    fn packets_flow_to_a_registered_processor_in_order() {
        let manager = TimeshiftManager::start(test_cfg());
        let (tx, rx) = packet_lane(64);
        manager
            .register_processor(InstanceId::new("sip-1"), SourceTag::new("a"), tx, 0, 0.0)
            .unwrap();

        for _ in 0..5 {
            manager.add_packet(packet("a"));
            manager.add_packet(packet("b"));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = 0;
        while got < 5 && Instant::now() < deadline {
            if let Some(StreamItem::Audio(p)) = rx.pop_timeout(Duration::from_millis(50)) {
                assert_eq!(p.source_tag.as_str(), "a");
                got += 1;
            }
        }
        assert_eq!(got, 5);

        let stats = manager.stats();
        assert_eq!(stats.total_packets_added, 10);
        assert!(stats.streams.contains_key("a"));
        assert!(stats.streams.contains_key("b"));
        manager.shutdown();
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let manager = TimeshiftManager::start(test_cfg());
        let (tx, _rx) = packet_lane(4);
        let (tx2, _rx2) = packet_lane(4);
        manager
            .register_processor(InstanceId::new("sip-1"), SourceTag::new("a"), tx, 0, 0.0)
            .unwrap();
        let err = manager
            .register_processor(InstanceId::new("sip-1"), SourceTag::new("a"), tx2, 0, 0.0)
            .unwrap_err();
        assert!(matches!(err, TimeshiftError::DuplicateProcessor { .. }));
        manager.shutdown();
    }

    #[test]
    fn timeshift_rewind_replays_retained_audio() {
        let manager = TimeshiftManager::start(test_cfg());
        let (tx, rx) = packet_lane(256);

        // Fill some history before the processor arrives.
        for _ in 0..10 {
            manager.add_packet(packet("a"));
        }
        std::thread::sleep(Duration::from_millis(100));

        manager
            .register_processor(InstanceId::new("sip-1"), SourceTag::new("a"), tx, 0, 0.0)
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // Live cursor starts at "now": history is behind it.
        while rx.try_pop().is_some() {}

        // Rewind into the retained window and the history replays.
        manager
            .update_processor_timeshift(&InstanceId::new("sip-1"), -1.0)
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut replayed = 0;
        while Instant::now() < deadline && replayed < 10 {
            if let Some(StreamItem::Audio(_)) = rx.pop_timeout(Duration::from_millis(50)) {
                replayed += 1;
            }
        }
        assert!(replayed >= 10, "replayed {replayed} of 10");

        let stats = manager.stats();
        assert_eq!(stats.stream_lagging_events, 0);
        manager.shutdown();
    }

    #[test]
    fn export_concatenates_one_tag_only() {
        let manager = TimeshiftManager::start(test_cfg());
        for _ in 0..4 {
            manager.add_packet(packet("a"));
            manager.add_packet(packet("b"));
        }
        std::thread::sleep(Duration::from_millis(100));
        let export = manager.export_lookback(&SourceTag::new("a"), 10.0);
        assert_eq!(export.pcm.len(), 4 * 1152);
        assert!(export.duration_seconds > 0.0);
        manager.shutdown();
    }

    #[test]
    fn inbound_overflow_is_counted_not_blocking() {
        let cfg = TimeshiftConfig {
            inbound_high_water: 4,
            ..test_cfg()
        };
        let manager = TimeshiftManager::start(cfg);
        // No consumer progress guarantee is needed; even if the
        // dispatcher drains some, pushing far beyond the mark from a
        // stopped dispatcher would drop. Shut the dispatcher first so
        // the queue cannot drain.
        manager.inner.running.store(false, Ordering::Release);
        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..20 {
            manager.add_packet(packet("a"));
        }
        assert!(manager.stats().total_inbound_dropped >= 16);
    }
}
