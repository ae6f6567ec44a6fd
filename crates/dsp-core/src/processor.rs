//! The source input processor
//!
//! One worker thread per (source, output format) pair. It consumes the
//! packet lane its timeshift cursor feeds, runs the processing chain,
//! and emits fixed-size chunks to every attached sink ring. Parameter
//! changes arrive on a command queue and apply between chunks.

use std::sync::atomic::{AtomicU8, AtomicU64, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wavecast_packet_core::{
    AudioFormat, InstanceId, PacketLaneRx, PlayoutStamp, ProcessedChunk, SinkRingSet, SourceTag,
    StreamItem, TaggedPacket,
};
use wavecast_timeshift_core::RateHandle;

use crate::commands::ProcessorCommand;
use crate::config::{DspTuning, SourceParams};
use crate::decode::{decode_payload, from_f32, to_f32};
use crate::eq::EighteenBandEq;
use crate::error::Result;
use crate::filters::{DcFilter, Dither};
use crate::layout::remap;
use crate::normalize::VolumeNormalizer;
use crate::resample::{effective_rate, FractionalResampler};
use crate::volume::SmoothedVolume;

/// Poll timeout for the packet lane; bounds shutdown latency
const LANE_POLL: Duration = Duration::from_millis(20);

/// Lifecycle state of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProcessorState {
    /// No packets recently
    Idle = 0,
    /// Converting audio
    Streaming = 1,
    /// Waiting for a usable format after a change
    Reconfiguring = 2,
    /// Worker has exited
    Stopped = 3,
}

impl ProcessorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProcessorState::Streaming,
            2 => ProcessorState::Reconfiguring,
            3 => ProcessorState::Stopped,
            _ => ProcessorState::Idle,
        }
    }
}

/// Counters for one processor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorStats {
    /// Packets fully processed
    pub processed_packets: u64,
    /// Packets dropped for malformed payloads or unusable formats
    pub discarded_packets: u64,
    /// Chain rebuilds triggered by format changes
    pub reconfigurations: u64,
    /// Chunks emitted to sink rings
    pub chunks_emitted: u64,
    /// Chunk pushes dropped on full sink rings
    pub ring_overflows: u64,
}

#[derive(Default)]
struct SharedCounters {
    processed_packets: AtomicU64,
    discarded_packets: AtomicU64,
    reconfigurations: AtomicU64,
    chunks_emitted: AtomicU64,
    ring_overflows: AtomicU64,
    state: AtomicU8,
}

/// Control handle for a running processor
pub struct ProcessorHandle {
    instance_id: InstanceId,
    source_tag: SourceTag,
    output_format: AudioFormat,
    cmd_tx: Sender<ProcessorCommand>,
    running: Arc<AtomicBool>,
    counters: Arc<SharedCounters>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessorHandle {
    /// The processor's instance id
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// The tag this processor consumes
    pub fn source_tag(&self) -> &SourceTag {
        &self.source_tag
    }

    /// The sink output format this processor renders
    pub fn output_format(&self) -> AudioFormat {
        self.output_format
    }

    /// Enqueue a command; applied at the next chunk boundary
    pub fn send_command(&self, command: ProcessorCommand) {
        let _ = self.cmd_tx.send(command);
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.counters.state.load(Ordering::Relaxed))
    }

    /// Snapshot counters
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed_packets: self.counters.processed_packets.load(Ordering::Relaxed),
            discarded_packets: self.counters.discarded_packets.load(Ordering::Relaxed),
            reconfigurations: self.counters.reconfigurations.load(Ordering::Relaxed),
            chunks_emitted: self.counters.chunks_emitted.load(Ordering::Relaxed),
            ring_overflows: self.counters.ring_overflows.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and join it
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The processing chain for one input format
struct Chain {
    in_format: AudioFormat,
    matrix: [[f32; 8]; 8],
    resampler: FractionalResampler,
    eq: EighteenBandEq,
    normalizer: VolumeNormalizer,
    dc: Option<DcFilter>,
    dither: Option<Dither>,
}

/// Everything the worker thread owns
struct Worker {
    instance_id: InstanceId,
    output_format: AudioFormat,
    tuning: DspTuning,
    params: SourceParams,
    lane: PacketLaneRx,
    sink_rings: Arc<SinkRingSet>,
    playback_rate: RateHandle,
    sync_trim: RateHandle,
    cmd_rx: Receiver<ProcessorCommand>,
    running: Arc<AtomicBool>,
    counters: Arc<SharedCounters>,
    chain: Option<Chain>,
    volume: SmoothedVolume,
    accumulator: Vec<i32>,
    rtp_pos: u32,
    last_packet_at: Option<Instant>,
}

/// Source input processor factory
pub struct SourceInputProcessor;

impl SourceInputProcessor {
    /// Spawn a processor worker and return its handle
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        instance_id: InstanceId,
        source_tag: SourceTag,
        output_format: AudioFormat,
        tuning: DspTuning,
        params: SourceParams,
        lane: PacketLaneRx,
        sink_rings: Arc<SinkRingSet>,
        playback_rate: RateHandle,
        sync_trim: RateHandle,
    ) -> ProcessorHandle {
        let (cmd_tx, cmd_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(SharedCounters::default());
        counters
            .state
            .store(ProcessorState::Idle as u8, Ordering::Relaxed);

        let chunk_samples = tuning.chunk_frames * output_format.channels as usize;
        let mut worker = Worker {
            instance_id: instance_id.clone(),
            output_format,
            volume: SmoothedVolume::new(params.volume, tuning.volume_smoothing, chunk_samples),
            tuning,
            params,
            lane,
            sink_rings,
            playback_rate,
            sync_trim,
            cmd_rx,
            running: Arc::clone(&running),
            counters: Arc::clone(&counters),
            chain: None,
            accumulator: Vec::with_capacity(chunk_samples * 2),
            rtp_pos: 0,
            last_packet_at: None,
        };

        let thread_name = format!("sip-{}", instance_id);
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run())
            .expect("spawning a processor worker cannot fail");

        info!(instance = %instance_id, tag = %source_tag, "source input processor started");
        ProcessorHandle {
            instance_id,
            source_tag,
            output_format,
            cmd_tx,
            running,
            counters,
            join: Mutex::new(Some(join)),
        }
    }
}

impl Worker {
    fn run(&mut self) {
        while self.running.load(Ordering::Acquire) {
            // Commands apply at chunk boundaries; the loop top is one.
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                self.apply_command(cmd);
            }

            match self.lane.pop_timeout(LANE_POLL) {
                Some(StreamItem::Audio(packet)) => self.on_packet(&packet),
                Some(StreamItem::Reconfigure(format)) => {
                    self.counters
                        .reconfigurations
                        .fetch_add(1, Ordering::Relaxed);
                    self.rebuild_chain(format);
                }
                None => self.check_idle(),
            }
        }
        self.set_state(ProcessorState::Stopped);
        debug!(instance = %self.instance_id, "source input processor stopped");
    }

    fn set_state(&self, state: ProcessorState) {
        self.counters.state.store(state as u8, Ordering::Relaxed);
    }

    fn check_idle(&mut self) {
        if let Some(last) = self.last_packet_at {
            if last.elapsed().as_secs() >= self.tuning.idle_timeout_seconds
                && ProcessorState::from_u8(self.counters.state.load(Ordering::Relaxed))
                    == ProcessorState::Streaming
            {
                self.set_state(ProcessorState::Idle);
            }
        }
    }

    fn apply_command(&mut self, command: ProcessorCommand) {
        match command {
            ProcessorCommand::SetVolume(volume) => {
                self.params.volume = volume.clamp(0.0, 1.0);
                self.volume.set_target(self.params.volume);
            }
            ProcessorCommand::SetEq(gains) => {
                self.params.eq_gains = gains;
                self.refresh_eq();
            }
            ProcessorCommand::SetEqNormalization(enabled) => {
                self.params.eq_normalization = enabled;
                self.refresh_eq();
            }
            ProcessorCommand::SetVolumeNormalization(enabled) => {
                self.params.volume_normalization = enabled;
                if let Some(chain) = &mut self.chain {
                    chain.normalizer.reset();
                }
            }
            ProcessorCommand::SetDelay(ms) => {
                self.params.delay_ms = ms;
            }
            ProcessorCommand::SetTimeshift(sec) => {
                self.params.timeshift_sec = sec;
            }
            ProcessorCommand::SetSpeakerLayouts(layouts) => {
                self.params.speaker_layouts = layouts;
                if let Some(chain) = &mut self.chain {
                    chain.matrix = self.params.layout_matrix(
                        chain.in_format.channels,
                        self.output_format.channels,
                    );
                }
            }
            ProcessorCommand::SetSyncTrim(trim) => {
                self.sync_trim = trim;
            }
        }
    }

    fn refresh_eq(&mut self) {
        if let Some(chain) = &mut self.chain {
            if let Err(e) = chain
                .eq
                .set_gains(self.params.eq_gains, self.params.eq_normalization)
            {
                warn!(instance = %self.instance_id, error = %e, "rejected EQ update");
            }
        }
    }

    fn rebuild_chain(&mut self, in_format: AudioFormat) {
        match self.build_chain(in_format) {
            Ok(chain) => {
                self.chain = Some(chain);
                self.set_state(ProcessorState::Streaming);
            }
            Err(e) => {
                warn!(
                    instance = %self.instance_id,
                    format = %in_format,
                    error = %e,
                    "unsupported input format, discarding until it changes"
                );
                self.chain = None;
                self.set_state(ProcessorState::Reconfiguring);
            }
        }
    }

    fn build_chain(&self, in_format: AudioFormat) -> Result<Chain> {
        let out = &self.output_format;
        let chunk_ms =
            self.tuning.chunk_frames as f32 * 1_000.0 / out.sample_rate as f32;
        Ok(Chain {
            in_format,
            matrix: self
                .params
                .layout_matrix(in_format.channels, out.channels),
            resampler: FractionalResampler::new(
                in_format.sample_rate,
                out.sample_rate,
                out.channels,
                self.tuning.resample_passthrough_ppm,
            )?,
            eq: EighteenBandEq::new(
                out.sample_rate,
                out.channels,
                self.params.eq_gains,
                self.params.eq_normalization,
            )?,
            normalizer: VolumeNormalizer::new(&self.tuning, chunk_ms),
            dc: if self.tuning.dc_filter_cutoff_hz > 0.0 {
                Some(DcFilter::new(
                    out.sample_rate,
                    out.channels,
                    self.tuning.dc_filter_cutoff_hz,
                )?)
            } else {
                None
            },
            dither: Dither::new(
                out.bit_depth,
                out.channels,
                self.tuning.dither_noise_shaping,
            ),
        })
    }

    fn on_packet(&mut self, packet: &TaggedPacket) {
        self.last_packet_at = Some(Instant::now());

        let needs_rebuild = match &self.chain {
            Some(chain) => chain.in_format != packet.format,
            None => true,
        };
        if needs_rebuild {
            if self.chain.is_some() {
                // A live format change; the initial build is not one.
                self.counters
                    .reconfigurations
                    .fetch_add(1, Ordering::Relaxed);
            }
            self.rebuild_chain(packet.format);
        }
        if self.chain.is_none() {
            self.counters
                .discarded_packets
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let decoded = match decode_payload(&packet.payload, &packet.format) {
            Ok(samples) => samples,
            Err(_) => {
                self.counters
                    .discarded_packets
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let rate = effective_rate(self.playback_rate.get(), self.sync_trim.get());
        let volume_normalization = self.params.volume_normalization;
        let out_channels = self.output_format.channels;

        let chain = self.chain.as_mut().expect("chain checked above");
        let mut samples = to_f32(&decoded);
        samples = remap(
            &samples,
            chain.in_format.channels,
            out_channels,
            &chain.matrix,
        );
        let mut samples = match chain.resampler.push(&samples, rate) {
            Ok(resampled) => resampled,
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "resampler failed, dropping packet");
                self.counters
                    .discarded_packets
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if samples.is_empty() {
            self.counters
                .processed_packets
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        chain.eq.process(&mut samples);
        if volume_normalization {
            chain.normalizer.process(&mut samples);
        }
        if let Some(dc) = &mut chain.dc {
            dc.process(&mut samples);
        }
        self.volume.process(&mut samples, out_channels);
        if let Some(dither) = &mut chain.dither {
            dither.process(&mut samples);
        }

        self.accumulator.extend(from_f32(&samples));
        self.counters
            .processed_packets
            .fetch_add(1, Ordering::Relaxed);
        self.set_state(ProcessorState::Streaming);
        self.emit_ready_chunks();
    }

    fn emit_ready_chunks(&mut self) {
        let chunk_samples =
            self.tuning.chunk_frames * self.output_format.channels as usize;
        while self.accumulator.len() >= chunk_samples {
            let pcm: Vec<i32> = self.accumulator.drain(..chunk_samples).collect();
            let chunk = ProcessedChunk {
                instance_id: self.instance_id.clone(),
                playout: PlayoutStamp {
                    rtp_timestamp: self.rtp_pos,
                    due: Instant::now(),
                },
                format: self.output_format,
                frames: self.tuning.chunk_frames,
                pcm,
            };
            self.rtp_pos = self.rtp_pos.wrapping_add(self.tuning.chunk_frames as u32);

            for (_sink, ring) in self.sink_rings.snapshot() {
                if !ring.try_push(chunk.clone()) {
                    self.counters.ring_overflows.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.counters.chunks_emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wavecast_packet_core::{chunk_ring, packet_lane, BitDepth};

    fn spawn_passthrough(
        tuning: DspTuning,
    ) -> (
        ProcessorHandle,
        wavecast_packet_core::PacketLaneTx,
        wavecast_packet_core::ChunkRx,
    ) {
        let (lane_tx, lane_rx) = packet_lane(256);
        let (ring_tx, ring_rx) = chunk_ring(64);
        let rings = Arc::new(SinkRingSet::new());
        rings.attach("sink-1".into(), ring_tx);
        let handle = SourceInputProcessor::spawn(
            InstanceId::new("sip-test"),
            SourceTag::new("test-A"),
            AudioFormat::stereo_48k_16(),
            tuning,
            SourceParams::default(),
            lane_rx,
            rings,
            RateHandle::new(),
            RateHandle::new(),
        );
        (handle, lane_tx, ring_rx)
    }

    fn audio_item(payload: Vec<u8>) -> StreamItem {
        StreamItem::Audio(Arc::new(TaggedPacket::new(
            SourceTag::new("test-A"),
            AudioFormat::stereo_48k_16(),
            None,
            Bytes::from(payload),
        )))
    }

    #[test]
    fn passthrough_preserves_pcm() {
        let tuning = DspTuning {
            chunk_frames: 64,
            ..DspTuning::default()
        };
        let (handle, lane, ring) = spawn_passthrough(tuning);

        // A ramp of distinct 16-bit samples across several packets.
        let mut expected = Vec::new();
        for p in 0..4i16 {
            let mut payload = Vec::with_capacity(1152);
            for i in 0..288i16 {
                let l = p * 300 + i;
                let r = -(p * 300 + i);
                payload.extend_from_slice(&l.to_le_bytes());
                payload.extend_from_slice(&r.to_le_bytes());
                expected.push(l);
                expected.push(r);
            }
            assert!(lane.try_push(audio_item(payload)));
        }

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < expected.len() && Instant::now() < deadline {
            if let Some(chunk) = ring.pop_timeout(Duration::from_millis(50)) {
                assert_eq!(chunk.format, AudioFormat::stereo_48k_16());
                assert_eq!(chunk.frames, 64);
                received.extend(chunk.pcm.iter().map(|&s| (s >> 16) as i16));
            }
        }
        // 4 * 288 frames = 1152 frames = 18 chunks of 64; all samples
        // must survive within the dither bound of one LSB.
        assert_eq!(received.len(), expected.len());
        for (i, (a, b)) in expected.iter().zip(received.iter()).enumerate() {
            assert!((a - b).abs() <= 2, "sample {i}: {a} vs {b}");
        }

        let stats = handle.stats();
        assert_eq!(stats.processed_packets, 4);
        assert_eq!(stats.chunks_emitted, 18);
        assert_eq!(stats.discarded_packets, 0);
        handle.stop();
    }

    #[test]
    fn format_change_counts_one_reconfiguration() {
        let tuning = DspTuning {
            chunk_frames: 64,
            ..DspTuning::default()
        };
        let (handle, lane, ring) = spawn_passthrough(tuning);

        lane.try_push(audio_item(vec![0u8; 1152]));
        // Same tag, new rate: 44.1 kHz packets after 48 kHz ones.
        let changed = AudioFormat::new(44_100, BitDepth::S16, 2).unwrap();
        for _ in 0..3 {
            lane.try_push(StreamItem::Audio(Arc::new(TaggedPacket::new(
                SourceTag::new("test-A"),
                changed,
                None,
                Bytes::from(vec![0u8; 1152]),
            ))));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.stats().processed_packets < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.stats().reconfigurations, 1);
        assert_eq!(handle.state(), ProcessorState::Streaming);
        drop(ring);
        handle.stop();
    }

    #[test]
    fn ragged_payload_is_discarded() {
        let tuning = DspTuning::default();
        let (handle, lane, _ring) = spawn_passthrough(tuning);
        lane.try_push(audio_item(vec![0u8; 1151]));
        let deadline = Instant::now() + Duration::from_secs(1);
        while handle.stats().discarded_packets == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.stats().discarded_packets, 1);
        handle.stop();
    }

    #[test]
    fn volume_command_takes_effect_on_later_chunks() {
        let tuning = DspTuning {
            chunk_frames: 64,
            volume_smoothing: 1.0,
            ..DspTuning::default()
        };
        let (handle, lane, ring) = spawn_passthrough(tuning);

        handle.send_command(ProcessorCommand::SetVolume(0.0));
        // Give the worker a moment to drain the command queue.
        std::thread::sleep(Duration::from_millis(100));

        let loud = vec![0x00u8, 0x40]; // 16384
        let payload: Vec<u8> = loud
            .iter()
            .copied()
            .cycle()
            .take(1152)
            .collect();
        for _ in 0..2 {
            lane.try_push(audio_item(payload.clone()));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut last_chunk = None;
        while Instant::now() < deadline {
            if let Some(chunk) = ring.pop_timeout(Duration::from_millis(50)) {
                last_chunk = Some(chunk);
            } else if last_chunk.is_some() {
                break;
            }
        }
        let chunk = last_chunk.expect("no chunks emitted");
        // By the final chunk the glide has finished at zero; only the
        // dither floor (a couple of 16-bit LSBs at Q31 scale) remains.
        let peak = chunk.pcm.iter().map(|s| s.abs()).max().unwrap_or(0);
        assert!(peak <= 3 << 16, "peak {peak}");
        handle.stop();
    }
}
