//! The sink audio mixer
//!
//! One thread per sink. Chunks from every connected source processor
//! are pulled from per-lane rings, summed in 32-bit with saturation,
//! down-converted to the sink's declared bit depth and fanned out to
//! the sink's senders and listeners in mixed order. A lane that goes
//! quiet is held silent (not removed) after the hold timeout; when all
//! lanes are quiet the mixer paces out silence so downstream devices
//! keep running.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wavecast_packet_core::{AudioFormat, BitDepth, ChunkRx, InstanceId, ProcessedChunk, SinkId};
use wavecast_transport_core::sender::{AnySender, MixedChunk};

use crate::config::SinkMixerConfig;
use crate::mp3::{Mp3Encoder, Mp3Queue};
use crate::sync::SinkSyncCoordinator;

/// Idle poll while waiting for audio
const IDLE_POLL: Duration = Duration::from_millis(2);

/// Straggler poll while aligning lanes
const ALIGN_POLL: Duration = Duration::from_millis(1);

/// Counters for one sink mixer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MixerStats {
    /// Mixed chunks emitted (audio and silence)
    pub chunks_mixed: u64,
    /// Silence chunks emitted with every lane quiet
    pub buffer_underruns: u64,
    /// Sender write failures across senders and listeners
    pub sender_errors: u64,
    /// Per-lane counts of mixes the lane missed after its hold expired
    pub lane_underruns: HashMap<String, u64>,
    /// Per-sender and per-listener egress counters
    pub sender_stats: HashMap<String, wavecast_transport_core::sender::SenderStats>,
    /// Currently attached lanes
    pub active_lanes: usize,
    /// Currently attached listeners
    pub listeners: usize,
    /// MP3 frames encoded
    pub mp3_encoded_frames: u64,
    /// MP3 frames dropped on queue overflow
    pub mp3_dropped_frames: u64,
}

enum MixerControl {
    AddLane(InstanceId, ChunkRx),
    RemoveLane(InstanceId),
    AddListener(String, Box<AnySender>),
    RemoveListener(String),
    SetCoordinator(Option<Arc<SinkSyncCoordinator>>),
    SetCoordinationMode(bool),
}

/// Control handle for a running sink mixer
pub struct MixerHandle {
    sink_id: SinkId,
    output_format: AudioFormat,
    ctrl_tx: Sender<MixerControl>,
    running: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<MixerStats>>,
    mp3: Arc<Mutex<Mp3Queue>>,
}

impl MixerHandle {
    /// The sink this mixer feeds
    pub fn sink_id(&self) -> &SinkId {
        &self.sink_id
    }

    /// The sink's declared output format
    pub fn output_format(&self) -> AudioFormat {
        self.output_format
    }

    /// Attach a source processor's chunk ring
    pub fn add_input_ring(&self, instance_id: InstanceId, ring: ChunkRx) {
        let _ = self.ctrl_tx.send(MixerControl::AddLane(instance_id, ring));
    }

    /// Detach a source processor's lane
    pub fn remove_input_ring(&self, instance_id: &InstanceId) {
        let _ = self
            .ctrl_tx
            .send(MixerControl::RemoveLane(instance_id.clone()));
    }

    /// Attach a listener receiving the sink's mixed PCM
    pub fn add_listener(&self, listener_id: impl Into<String>, sender: AnySender) {
        let _ = self
            .ctrl_tx
            .send(MixerControl::AddListener(listener_id.into(), Box::new(sender)));
    }

    /// Detach a listener
    pub fn remove_listener(&self, listener_id: &str) {
        let _ = self
            .ctrl_tx
            .send(MixerControl::RemoveListener(listener_id.to_string()));
    }

    /// Install or clear the sync coordinator
    pub fn set_coordinator(&self, coordinator: Option<Arc<SinkSyncCoordinator>>) {
        let _ = self
            .ctrl_tx
            .send(MixerControl::SetCoordinator(coordinator));
    }

    /// Toggle barrier participation without dropping the coordinator
    pub fn set_coordination_mode(&self, enabled: bool) {
        let _ = self
            .ctrl_tx
            .send(MixerControl::SetCoordinationMode(enabled));
    }

    /// Drain the queued MP3 stream
    pub fn take_mp3_data(&self) -> Bytes {
        self.mp3.lock().take_data()
    }

    /// Snapshot counters
    pub fn stats(&self) -> MixerStats {
        self.stats.lock().clone()
    }

    /// Stop the mixer thread, closing every sender
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MixerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Lane {
    instance: InstanceId,
    rx: ChunkRx,
    ready: VecDeque<ProcessedChunk>,
    last_chunk_at: Instant,
    underruns: u64,
}

struct MixerWorker {
    config: SinkMixerConfig,
    ctrl_rx: Receiver<MixerControl>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<MixerStats>>,
    mp3_queue: Arc<Mutex<Mp3Queue>>,
    mp3_encoder: Option<Mp3Encoder>,
    lanes: Vec<Lane>,
    senders: Vec<(String, AnySender)>,
    coordinator: Option<Arc<SinkSyncCoordinator>>,
    coordination_mode: bool,
    rtp_pos: u32,
    last_emit: Instant,
    sender_errors: u64,
    buffer_underruns: u64,
    chunks_mixed: u64,
}

/// Sink audio mixer factory
pub struct SinkAudioMixer;

impl SinkAudioMixer {
    /// Spawn a mixer for a sink, taking ownership of its senders
    pub fn spawn(config: SinkMixerConfig, senders: Vec<AnySender>) -> MixerHandle {
        let (ctrl_tx, ctrl_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(MixerStats::default()));
        let mp3 = Arc::new(Mutex::new(Mp3Queue::new(
            config.mp3_output_queue_max_size,
        )));

        let sink_id = config.sink_id.clone();
        let output_format = config.output_format;
        let worker_running = Arc::clone(&running);
        let worker_stats = Arc::clone(&stats);
        let worker_mp3 = Arc::clone(&mp3);

        let thread_name = format!("sam-{sink_id}");
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut worker = MixerWorker {
                    senders: senders
                        .into_iter()
                        .enumerate()
                        .map(|(i, s)| (format!("sender-{i}"), s))
                        .collect(),
                    config,
                    ctrl_rx,
                    running: worker_running,
                    stats: worker_stats,
                    mp3_queue: worker_mp3,
                    mp3_encoder: None,
                    lanes: Vec::new(),
                    coordinator: None,
                    coordination_mode: false,
                    rtp_pos: 0,
                    last_emit: Instant::now(),
                    sender_errors: 0,
                    buffer_underruns: 0,
                    chunks_mixed: 0,
                };
                worker.run();
            })
            .expect("spawning a mixer thread cannot fail");

        info!(sink = %sink_id, "sink audio mixer started");
        MixerHandle {
            sink_id,
            output_format,
            ctrl_tx,
            running,
            join: Mutex::new(Some(join)),
            stats,
            mp3,
        }
    }
}

impl MixerWorker {
    fn run(&mut self) {
        self.setup_senders();
        self.setup_mp3();

        let hold = Duration::from_millis(self.config.underrun_hold_timeout_ms);
        let chunk_duration = self
            .config
            .output_format
            .duration_of(self.config.chunk_frames);
        // Synchronized sinks grant their peers a head start so the
        // group forms before audio starts moving.
        let warmup_until = Instant::now()
            + if self.config.time_sync {
                Duration::from_millis(self.config.time_sync_delay_ms)
            } else {
                Duration::ZERO
            };

        while self.running.load(Ordering::Acquire) {
            self.drain_control();
            self.top_up_lanes();

            if self.lanes.is_empty() || Instant::now() < warmup_until {
                std::thread::sleep(IDLE_POLL);
                continue;
            }

            let any_ready = self.lanes.iter().any(|l| !l.ready.is_empty());
            if !any_ready {
                // Nothing anywhere: after the hold timeout, pace out
                // silence at the chunk cadence.
                let all_past_hold = self
                    .lanes
                    .iter()
                    .all(|l| l.last_chunk_at.elapsed() >= hold);
                if all_past_hold && self.last_emit.elapsed() >= chunk_duration {
                    self.emit_silence();
                } else {
                    std::thread::sleep(IDLE_POLL);
                }
                continue;
            }

            // Give stragglers a short window to align before mixing
            // without them.
            let trigger = Instant::now();
            loop {
                let aligned = self.lanes.iter().all(|l| {
                    !l.ready.is_empty() || l.last_chunk_at.elapsed() >= hold
                });
                if aligned || trigger.elapsed() >= hold {
                    break;
                }
                std::thread::sleep(ALIGN_POLL);
                self.top_up_lanes();
            }

            self.mix_once();
        }

        for (_, sender) in self.senders.iter_mut() {
            sender.close();
        }
        debug!(sink = %self.config.sink_id, "sink audio mixer stopped");
    }

    fn setup_senders(&mut self) {
        let mut failed = Vec::new();
        for (i, (name, sender)) in self.senders.iter_mut().enumerate() {
            if !sender.setup() {
                warn!(sink = %self.config.sink_id, sender = %name, "sender setup failed");
                failed.push(i);
            }
        }
        for i in failed.into_iter().rev() {
            self.senders.remove(i);
            self.sender_errors += 1;
        }
        self.publish_stats();
    }

    fn setup_mp3(&mut self) {
        if !self.config.mp3_enabled {
            return;
        }
        match Mp3Encoder::new(
            self.config.output_format.sample_rate,
            self.config.output_format.channels,
            self.config.mp3_bitrate_kbps,
        ) {
            Ok(encoder) => self.mp3_encoder = Some(encoder),
            Err(e) => warn!(sink = %self.config.sink_id, error = %e, "mp3 stream unavailable"),
        }
    }

    fn drain_control(&mut self) {
        while let Ok(ctrl) = self.ctrl_rx.try_recv() {
            match ctrl {
                MixerControl::AddLane(instance, rx) => {
                    debug!(sink = %self.config.sink_id, %instance, "lane attached");
                    self.lanes.push(Lane {
                        instance,
                        rx,
                        ready: VecDeque::new(),
                        last_chunk_at: Instant::now(),
                        underruns: 0,
                    });
                }
                MixerControl::RemoveLane(instance) => {
                    self.lanes.retain(|l| l.instance != instance);
                }
                MixerControl::AddListener(id, mut sender) => {
                    if sender.setup() {
                        self.senders.push((id, *sender));
                    } else {
                        warn!(sink = %self.config.sink_id, listener = %id, "listener setup failed");
                        self.sender_errors += 1;
                    }
                }
                MixerControl::RemoveListener(id) => {
                    for (name, sender) in self
                        .senders
                        .iter_mut()
                        .filter(|(name, _)| *name == id)
                    {
                        debug!(sink = %self.config.sink_id, listener = %name, "listener detached");
                        sender.close();
                    }
                    self.senders.retain(|(name, _)| *name != id);
                }
                MixerControl::SetCoordinator(coordinator) => {
                    self.coordination_mode = coordinator.is_some();
                    self.coordinator = coordinator;
                }
                MixerControl::SetCoordinationMode(enabled) => {
                    self.coordination_mode = enabled;
                }
            }
            self.publish_stats();
        }
    }

    fn top_up_lanes(&mut self) {
        let chunk_ms = self
            .config
            .output_format
            .duration_of(self.config.chunk_frames)
            .as_millis()
            .max(1) as u64;
        let duration_cap =
            (self.config.max_ready_queue_duration_ms / chunk_ms).max(1) as usize;
        let cap = self.config.max_ready_chunks_per_source.min(duration_cap);
        for lane in self.lanes.iter_mut() {
            while lane.ready.len() < cap {
                match lane.rx.try_pop() {
                    Some(chunk) => lane.ready.push_back(chunk),
                    None => break,
                }
            }
        }
    }

    fn mix_once(&mut self) {
        let samples =
            self.config.chunk_frames * self.config.output_format.channels as usize;
        let mut acc = vec![0i32; samples];
        let now = Instant::now();

        for lane in self.lanes.iter_mut() {
            match lane.ready.pop_front() {
                Some(chunk) => {
                    lane.last_chunk_at = now;
                    for (slot, &sample) in acc.iter_mut().zip(chunk.pcm.iter()) {
                        *slot = slot.saturating_add(sample);
                    }
                }
                None => {
                    // Held silent; counted once per mix it misses.
                    lane.underruns += 1;
                }
            }
        }

        self.rtp_pos = self.rtp_pos.wrapping_add(self.config.chunk_frames as u32);
        if self.coordination_mode {
            if let Some(coordinator) = &self.coordinator {
                coordinator.wait_for_barrier(self.rtp_pos);
            }
        }
        self.emit(&acc);
    }

    fn emit_silence(&mut self) {
        let samples =
            self.config.chunk_frames * self.config.output_format.channels as usize;
        let acc = vec![0i32; samples];
        self.rtp_pos = self.rtp_pos.wrapping_add(self.config.chunk_frames as u32);
        self.buffer_underruns += 1;
        self.emit(&acc);
    }

    fn emit(&mut self, acc: &[i32]) {
        let format = self.config.output_format;
        let bytes = pcm32_to_bytes(acc, format.bit_depth);
        let chunk = MixedChunk {
            format,
            frames: self.config.chunk_frames,
            rtp_timestamp: self.rtp_pos,
            pcm32: acc,
            bytes: &bytes,
        };

        if let Some(encoder) = &mut self.mp3_encoder {
            let pcm16: Vec<i16> = if format.channels <= 2 {
                acc.iter().map(|&s| (s >> 16) as i16).collect()
            } else {
                // Fold wide sinks onto their front pair for the MP3
                // side stream.
                acc.chunks_exact(format.channels as usize)
                    .flat_map(|frame| [(frame[0] >> 16) as i16, (frame[1] >> 16) as i16])
                    .collect()
            };
            let frame = encoder.encode(&pcm16);
            self.mp3_queue.lock().push(frame);
        }

        for (name, sender) in self.senders.iter_mut() {
            if let Err(e) = sender.send_chunk(&chunk) {
                debug!(sink = %self.config.sink_id, sender = %name, error = %e, "send failed");
                self.sender_errors += 1;
            }
        }

        self.last_emit = Instant::now();
        self.chunks_mixed += 1;
        self.publish_stats();
    }

    fn publish_stats(&self) {
        let mut stats = self.stats.lock();
        stats.chunks_mixed = self.chunks_mixed;
        stats.buffer_underruns = self.buffer_underruns;
        stats.sender_errors = self.sender_errors;
        stats.active_lanes = self.lanes.len();
        stats.listeners = self
            .senders
            .iter()
            .filter(|(name, _)| !name.starts_with("sender-"))
            .count();
        stats.lane_underruns = self
            .lanes
            .iter()
            .map(|l| (l.instance.to_string(), l.underruns))
            .collect();
        stats.sender_stats = self
            .senders
            .iter()
            .map(|(name, sender)| (name.clone(), sender.stats()))
            .collect();
        let mp3 = self.mp3_queue.lock();
        stats.mp3_encoded_frames = mp3.encoded_frames;
        stats.mp3_dropped_frames = mp3.dropped_frames;
    }
}

/// Down-convert accumulator samples to interleaved little-endian bytes
/// at the target depth
fn pcm32_to_bytes(pcm: &[i32], depth: BitDepth) -> Vec<u8> {
    match depth {
        BitDepth::S16 => {
            let mut out = Vec::with_capacity(pcm.len() * 2);
            for &s in pcm {
                out.extend_from_slice(&(((s >> 16) as i16).to_le_bytes()));
            }
            out
        }
        BitDepth::S24 => {
            let mut out = Vec::with_capacity(pcm.len() * 3);
            for &s in pcm {
                let v = s >> 8;
                out.extend_from_slice(&v.to_le_bytes()[..3]);
            }
            out
        }
        BitDepth::S32 => {
            let mut out = Vec::with_capacity(pcm.len() * 4);
            for &s in pcm {
                out.extend_from_slice(&s.to_le_bytes());
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_packet_core::{chunk_ring, PlayoutStamp};
    use wavecast_transport_core::sender::LoopbackSender;

    fn test_config(sink: &str) -> SinkMixerConfig {
        let mut config = SinkMixerConfig::new(
            SinkId::new(sink),
            AudioFormat::stereo_48k_16(),
            64,
        );
        config.underrun_hold_timeout_ms = 80;
        config
    }

    fn chunk(instance: &str, value: i32, frames: usize) -> ProcessedChunk {
        ProcessedChunk {
            instance_id: InstanceId::new(instance),
            playout: PlayoutStamp {
                rtp_timestamp: 0,
                due: Instant::now(),
            },
            format: AudioFormat::stereo_48k_16(),
            frames,
            pcm: vec![value; frames * 2],
        }
    }

    #[test]
    fn two_lanes_sum_into_one_output() {
        let (loopback, captured) = LoopbackSender::new(64);
        let handle = SinkAudioMixer::spawn(
            test_config("s1"),
            vec![AnySender::Loopback(loopback)],
        );

        let (tx_a, rx_a) = chunk_ring(16);
        let (tx_b, rx_b) = chunk_ring(16);
        handle.add_input_ring(InstanceId::new("a"), rx_a);
        handle.add_input_ring(InstanceId::new("b"), rx_b);

        tx_a.try_push(chunk("a", 1_000 << 16, 64));
        tx_b.try_push(chunk("b", 2_000 << 16, 64));

        let (_ts, bytes) = captured
            .recv_timeout(Duration::from_secs(2))
            .expect("no mixed output");
        // 16-bit LE: every sample is 3000.
        let first = i16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(first, 3_000);
        assert_eq!(bytes.len(), 64 * 2 * 2);
        handle.stop();
    }

    #[test]
    fn saturation_clamps_instead_of_wrapping() {
        let (loopback, captured) = LoopbackSender::new(64);
        let handle = SinkAudioMixer::spawn(
            test_config("s1"),
            vec![AnySender::Loopback(loopback)],
        );
        let (tx_a, rx_a) = chunk_ring(16);
        let (tx_b, rx_b) = chunk_ring(16);
        handle.add_input_ring(InstanceId::new("a"), rx_a);
        handle.add_input_ring(InstanceId::new("b"), rx_b);

        tx_a.try_push(chunk("a", i32::MAX, 64));
        tx_b.try_push(chunk("b", i32::MAX, 64));

        let (_ts, bytes) = captured
            .recv_timeout(Duration::from_secs(2))
            .expect("no mixed output");
        let first = i16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(first, i16::MAX);
        handle.stop();
    }

    #[test]
    fn a_stopped_lane_holds_silent_while_the_other_continues() {
        let (loopback, captured) = LoopbackSender::new(256);
        let handle = SinkAudioMixer::spawn(
            test_config("s1"),
            vec![AnySender::Loopback(loopback)],
        );
        let (tx_a, rx_a) = chunk_ring(64);
        let (tx_b, rx_b) = chunk_ring(64);
        handle.add_input_ring(InstanceId::new("a"), rx_a);
        handle.add_input_ring(InstanceId::new("b"), rx_b);

        // Both lanes feed, then lane b stops.
        for _ in 0..3 {
            tx_a.try_push(chunk("a", 500 << 16, 64));
            tx_b.try_push(chunk("b", 500 << 16, 64));
        }
        std::thread::sleep(Duration::from_millis(150));
        for _ in 0..10 {
            tx_a.try_push(chunk("a", 500 << 16, 64));
            std::thread::sleep(Duration::from_millis(10));
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut outputs = 0;
        while Instant::now() < deadline && outputs < 10 {
            if captured.recv_timeout(Duration::from_millis(100)).is_ok() {
                outputs += 1;
            }
        }
        assert!(outputs >= 10, "mixer stalled after a lane stopped");

        let stats = handle.stats();
        let b_underruns = stats.lane_underruns.get("b").copied().unwrap_or(0);
        assert!(b_underruns > 0, "held lane never counted underruns");
        handle.stop();
    }

    #[test]
    fn all_quiet_lanes_produce_paced_silence() {
        let (loopback, captured) = LoopbackSender::new(256);
        let mut config = test_config("s1");
        config.underrun_hold_timeout_ms = 50;
        let handle = SinkAudioMixer::spawn(config, vec![AnySender::Loopback(loopback)]);
        let (_tx, rx) = chunk_ring(16);
        handle.add_input_ring(InstanceId::new("a"), rx);

        // No audio at all: silence appears after the hold timeout.
        let (_ts, bytes) = captured
            .recv_timeout(Duration::from_secs(2))
            .expect("no silence emitted");
        assert!(bytes.iter().all(|&b| b == 0));
        assert!(handle.stats().buffer_underruns >= 1);
        handle.stop();
    }

    #[test]
    fn removing_a_lane_stops_its_contribution() {
        let (loopback, captured) = LoopbackSender::new(256);
        let handle = SinkAudioMixer::spawn(
            test_config("s1"),
            vec![AnySender::Loopback(loopback)],
        );
        let (tx_a, rx_a) = chunk_ring(64);
        handle.add_input_ring(InstanceId::new("a"), rx_a);
        tx_a.try_push(chunk("a", 100 << 16, 64));
        captured
            .recv_timeout(Duration::from_secs(2))
            .expect("no output before removal");

        handle.remove_input_ring(&InstanceId::new("a"));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.stats().active_lanes, 0);
        handle.stop();
    }
}
