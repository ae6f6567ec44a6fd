//! System playback sender
//!
//! Hardware playback through cpal. The callback pulls from a shared
//! sample queue; the mixer pushes into it. A small adaptor steers the
//! queue's target depth between the configured latency bounds:
//! underruns push the target up quickly, sustained clean playback lets
//! it drift back down with hysteresis so it never oscillates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sender::{MixedChunk, SenderStats};

/// System playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPlaybackConfig {
    /// Output device name; `None` picks the default device
    pub device_name: Option<String>,
    /// Initial target latency, ms
    pub target_latency_ms: u32,
    /// Floor the adaptor may settle to, ms
    pub latency_min_ms: u32,
    /// Ceiling the adaptor may grow to, ms
    pub latency_max_ms: u32,
}

impl Default for SystemPlaybackConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            target_latency_ms: 40,
            latency_min_ms: 20,
            latency_max_ms: 200,
        }
    }
}

/// State shared between the mixer side and the device callback
struct Shared {
    queue: Mutex<VecDeque<f32>>,
    /// Target queue depth in samples
    target_samples: AtomicUsize,
    underruns: AtomicU64,
    stream_errors: AtomicU64,
}

/// Steers the target latency between its bounds
pub struct LatencyAdaptor {
    /// Current target, ms
    target_ms: f64,
    min_ms: f64,
    max_ms: f64,
    /// Underrun count at the last adjustment
    last_underruns: u64,
    /// Clean intervals observed since the last change
    clean_streak: u32,
    last_adjust: Instant,
}

impl LatencyAdaptor {
    /// Start at the configured target
    pub fn new(config: &SystemPlaybackConfig) -> Self {
        Self {
            target_ms: config.target_latency_ms as f64,
            min_ms: config.latency_min_ms as f64,
            max_ms: config.latency_max_ms as f64,
            last_underruns: 0,
            clean_streak: 0,
            last_adjust: Instant::now(),
        }
    }

    /// Current target in ms
    pub fn target_ms(&self) -> f64 {
        self.target_ms
    }

    /// Feed the running underrun count; returns a new target when it
    /// changed. Rate-limited to one adjustment per interval.
    pub fn observe(&mut self, underruns: u64, now: Instant) -> Option<f64> {
        if now.duration_since(self.last_adjust) < Duration::from_millis(500) {
            return None;
        }
        self.last_adjust = now;

        let new_underruns = underruns.saturating_sub(self.last_underruns);
        self.last_underruns = underruns;

        if new_underruns > 0 {
            self.clean_streak = 0;
            // Grow proportionally to how badly playback starved.
            let step = 5.0 * new_underruns.min(10) as f64;
            let next = (self.target_ms + step).min(self.max_ms);
            if next != self.target_ms {
                self.target_ms = next;
                return Some(next);
            }
            return None;
        }

        // Shrink only after a long clean streak, and slowly.
        self.clean_streak += 1;
        if self.clean_streak >= 20 && self.target_ms > self.min_ms {
            self.clean_streak = 0;
            let next = (self.target_ms - 2.0).max(self.min_ms);
            self.target_ms = next;
            return Some(next);
        }
        None
    }
}

/// Hardware playback sender
pub struct SystemPlaybackSender {
    config: SystemPlaybackConfig,
    shared: Arc<Shared>,
    adaptor: LatencyAdaptor,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u8,
    stats: SenderStats,
}

impl SystemPlaybackSender {
    /// Build for a sink output format
    pub fn new(config: SystemPlaybackConfig, sample_rate: u32, channels: u8) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            target_samples: AtomicUsize::new(
                ms_to_samples(config.target_latency_ms as f64, sample_rate, channels),
            ),
            underruns: AtomicU64::new(0),
            stream_errors: AtomicU64::new(0),
        });
        Self {
            adaptor: LatencyAdaptor::new(&config),
            config,
            shared,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            sample_rate,
            channels,
            stats: SenderStats::default(),
        }
    }

    /// Open the device on a dedicated thread (cpal streams are not
    /// `Send`, so the stream lives and dies there)
    pub fn setup(&mut self) -> bool {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);
        let device_name = self.config.device_name.clone();
        let sample_rate = self.sample_rate;
        let channels = self.channels;

        let worker = std::thread::Builder::new()
            .name("system-playback".to_string())
            .spawn(move || {
                playback_thread(shared, running, device_name, sample_rate, channels, ready_tx)
            })
            .expect("spawning the playback thread cannot fail");
        self.worker = Some(worker);

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(true) => true,
            _ => {
                self.running.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Queue a chunk for the device callback
    pub fn send_chunk(&mut self, chunk: &MixedChunk<'_>) -> Result<()> {
        let target = self.shared.target_samples.load(Ordering::Relaxed);
        let max_samples = ms_to_samples(
            self.config.latency_max_ms as f64,
            self.sample_rate,
            self.channels,
        )
        .max(target * 2);

        {
            let mut queue = self.shared.queue.lock();
            for &s in chunk.pcm32 {
                queue.push_back(s as f32 / 2_147_483_648.0);
            }
            // Bound end-to-end latency: drop the oldest audio rather
            // than letting the queue grow without limit.
            while queue.len() > max_samples {
                queue.pop_front();
                self.stats.send_errors += 1;
            }
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += chunk.bytes.len() as u64;

        let underruns = self.shared.underruns.load(Ordering::Relaxed);
        self.stats.underruns = underruns;
        if let Some(new_target_ms) = self.adaptor.observe(underruns, Instant::now()) {
            debug!(target_ms = new_target_ms, "playback latency target adjusted");
            self.shared.target_samples.store(
                ms_to_samples(new_target_ms, self.sample_rate, self.channels),
                Ordering::Relaxed,
            );
        }
        Ok(())
    }

    /// Stop the device thread
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.queue.lock().clear();
    }

    /// Snapshot counters
    pub fn stats(&self) -> SenderStats {
        let mut stats = self.stats.clone();
        stats.underruns = self.shared.underruns.load(Ordering::Relaxed);
        stats
    }
}

impl Drop for SystemPlaybackSender {
    fn drop(&mut self) {
        self.close();
    }
}

fn ms_to_samples(ms: f64, sample_rate: u32, channels: u8) -> usize {
    (ms / 1_000.0 * sample_rate as f64) as usize * channels as usize
}

fn playback_thread(
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    device_name: Option<String>,
    sample_rate: u32,
    channels: u8,
    ready_tx: crossbeam_channel::Sender<bool>,
) {
    let host = cpal::default_host();
    let device = match &device_name {
        Some(name) => host.output_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| &n == name).unwrap_or(false))
        }),
        None => host.default_output_device(),
    };
    let Some(device) = device else {
        warn!(device = ?device_name, "playback device not found");
        let _ = ready_tx.send(false);
        return;
    };

    let stream_config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let cb_shared = Arc::clone(&shared);
    let err_shared = Arc::clone(&shared);
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = cb_shared.queue.lock();
            if queue.len() < data.len() {
                // Not enough audio: play what there is, pad silence.
                cb_shared.underruns.fetch_add(1, Ordering::Relaxed);
            }
            for slot in data.iter_mut() {
                *slot = queue.pop_front().unwrap_or(0.0);
            }
        },
        move |err| {
            warn!(error = %err, "playback stream error");
            err_shared.stream_errors.fetch_add(1, Ordering::Relaxed);
        },
        None,
    );
    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "building the playback stream failed");
            let _ = ready_tx.send(false);
            return;
        }
    };
    if let Err(e) = stream.play() {
        warn!(error = %e, "starting the playback stream failed");
        let _ = ready_tx.send(false);
        return;
    }
    info!(device = %device.name().unwrap_or_default(), "system playback running");
    let _ = ready_tx.send(true);

    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SystemPlaybackConfig {
        SystemPlaybackConfig::default()
    }

    #[test]
    fn underruns_raise_the_target_quickly() {
        let mut adaptor = LatencyAdaptor::new(&config());
        let start = Instant::now();
        let initial = adaptor.target_ms();
        let next = adaptor.observe(3, start + Duration::from_secs(1));
        assert!(next.is_some());
        assert!(adaptor.target_ms() > initial);
    }

    #[test]
    fn target_never_exceeds_the_maximum() {
        let mut adaptor = LatencyAdaptor::new(&config());
        let mut t = Instant::now();
        for i in 1..200u64 {
            t += Duration::from_secs(1);
            adaptor.observe(i * 100, t);
        }
        assert!(adaptor.target_ms() <= config().latency_max_ms as f64);
    }

    #[test]
    fn clean_playback_decays_slowly_with_hysteresis() {
        let mut adaptor = LatencyAdaptor::new(&config());
        let mut t = Instant::now();
        // Force the target up first.
        t += Duration::from_secs(1);
        adaptor.observe(10, t);
        let raised = adaptor.target_ms();
        // A handful of clean intervals must not move it yet.
        for _ in 0..5 {
            t += Duration::from_secs(1);
            assert!(adaptor.observe(10, t).is_none());
        }
        assert_eq!(adaptor.target_ms(), raised);
        // A long clean streak eventually walks it down.
        for _ in 0..40 {
            t += Duration::from_secs(1);
            adaptor.observe(10, t);
        }
        assert!(adaptor.target_ms() < raised);
        assert!(adaptor.target_ms() >= config().latency_min_ms as f64);
    }

    #[test]
    fn adjustments_are_rate_limited() {
        let mut adaptor = LatencyAdaptor::new(&config());
        let t = Instant::now();
        assert!(adaptor.observe(5, t + Duration::from_secs(1)).is_some());
        // Immediately after, nothing changes regardless of underruns.
        assert!(adaptor.observe(50, t + Duration::from_millis(1_100)).is_none());
    }
}
