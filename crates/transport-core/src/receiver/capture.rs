//! System capture devices
//!
//! Capture devices are opened through a reference-counted registry so
//! several processors reading the same device share one open stream.
//! Each open device runs a thread that owns the cpal stream (streams
//! are not `Send`), slices callback audio into fixed payloads and
//! pushes tagged packets with an `"ac:<device>"` tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wavecast_packet_core::scream::SCREAM_PAYLOAD_LEN;
use wavecast_packet_core::{AudioFormat, BitDepth, SourceTag, TaggedPacket};
use wavecast_timeshift_core::TimeshiftManager;

use crate::error::{Result, TransportError};

/// One system audio endpoint as the control plane sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDeviceInfo {
    /// Backend device name
    pub name: String,
    /// `"capture"` or `"playback"`
    pub direction: String,
    /// Whether this is the backend's default endpoint
    pub is_default: bool,
}

struct CaptureEntry {
    refcount: usize,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Reference-counted registry of open capture devices
pub struct CaptureRegistry {
    manager: Arc<TimeshiftManager>,
    entries: Mutex<HashMap<String, CaptureEntry>>,
}

impl CaptureRegistry {
    /// Registry feeding packets into the given timeshift manager
    pub fn new(manager: Arc<TimeshiftManager>) -> Self {
        Self {
            manager,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot every capture and playback endpoint the backend knows
    pub fn list_devices() -> Vec<SystemDeviceInfo> {
        let host = cpal::default_host();
        let mut devices = Vec::new();
        let default_in = host
            .default_input_device()
            .and_then(|d| d.name().ok());
        let default_out = host
            .default_output_device()
            .and_then(|d| d.name().ok());

        if let Ok(inputs) = host.input_devices() {
            for device in inputs {
                if let Ok(name) = device.name() {
                    devices.push(SystemDeviceInfo {
                        is_default: Some(&name) == default_in.as_ref(),
                        direction: "capture".to_string(),
                        name,
                    });
                }
            }
        }
        if let Ok(outputs) = host.output_devices() {
            for device in outputs {
                if let Ok(name) = device.name() {
                    devices.push(SystemDeviceInfo {
                        is_default: Some(&name) == default_out.as_ref(),
                        direction: "playback".to_string(),
                        name,
                    });
                }
            }
        }
        devices
    }

    /// Open a capture device (or add a reference to an already open
    /// one) and return its source tag
    pub fn open(&self, device_name: Option<String>) -> Result<SourceTag> {
        let key = device_name.clone().unwrap_or_else(|| "default".to_string());
        let tag = SourceTag::new(format!("ac:{key}"));

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.refcount += 1;
            return Ok(tag);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread_running = Arc::clone(&running);
        let manager = Arc::clone(&self.manager);
        let thread_tag = tag.clone();

        let join = std::thread::Builder::new()
            .name(format!("capture-{key}"))
            .spawn(move || capture_thread(manager, thread_tag, device_name, thread_running, ready_tx))
            .expect("spawning a capture thread cannot fail");

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                entries.insert(
                    key,
                    CaptureEntry {
                        refcount: 1,
                        running,
                        join: Some(join),
                    },
                );
                Ok(tag)
            }
            Ok(Err(e)) => {
                running.store(false, Ordering::Release);
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                let _ = join.join();
                Err(TransportError::Device {
                    device: key,
                    operation: "open",
                    reason: "timed out waiting for the capture stream".to_string(),
                })
            }
        }
    }

    /// Drop one reference; the last release closes the device
    pub fn release(&self, tag: &SourceTag) {
        let key = tag.as_str().strip_prefix("ac:").unwrap_or(tag.as_str());
        let mut entries = self.entries.lock();
        let remove = match entries.get_mut(key) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if remove {
            if let Some(mut entry) = entries.remove(key) {
                entry.running.store(false, Ordering::Release);
                if let Some(join) = entry.join.take() {
                    let _ = join.join();
                }
            }
        }
    }

    /// Open devices, for the stats surface
    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Drop for CaptureRegistry {
    fn drop(&mut self) {
        let mut entries = self.entries.lock();
        for (_key, mut entry) in entries.drain() {
            entry.running.store(false, Ordering::Release);
            if let Some(join) = entry.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn capture_thread(
    manager: Arc<TimeshiftManager>,
    tag: SourceTag,
    device_name: Option<String>,
    running: Arc<AtomicBool>,
    ready_tx: crossbeam_channel::Sender<Result<()>>,
) {
    let host = cpal::default_host();
    let device = match &device_name {
        Some(name) => host.input_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| &n == name).unwrap_or(false))
        }),
        None => host.default_input_device(),
    };
    let Some(device) = device else {
        let _ = ready_tx.send(Err(TransportError::Device {
            device: device_name.unwrap_or_default(),
            operation: "open",
            reason: "not found".to_string(),
        }));
        return;
    };

    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(TransportError::Device {
                device: device.name().unwrap_or_default(),
                operation: "configure",
                reason: e.to_string(),
            }));
            return;
        }
    };
    let channels = (supported.channels() as u8).clamp(1, 8);
    let sample_rate = supported.sample_rate().0;
    let format = AudioFormat {
        sample_rate,
        bit_depth: BitDepth::S16,
        channels,
        chlayout1: if channels == 2 { 0x03 } else { 0x04 },
        chlayout2: 0,
    };

    let stream_config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<u8> = Vec::with_capacity(SCREAM_PAYLOAD_LEN * 2);
    let cb_manager = Arc::clone(&manager);
    let cb_tag = tag.clone();
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                let s = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                pending.extend_from_slice(&s.to_le_bytes());
            }
            while pending.len() >= SCREAM_PAYLOAD_LEN {
                let payload: Vec<u8> = pending.drain(..SCREAM_PAYLOAD_LEN).collect();
                cb_manager.add_packet(TaggedPacket::new(
                    cb_tag.clone(),
                    format,
                    None,
                    Bytes::from(payload),
                ));
            }
        },
        |err| warn!(error = %err, "capture stream error"),
        None,
    );
    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(TransportError::Device {
                device: device.name().unwrap_or_default(),
                operation: "build stream",
                reason: e.to_string(),
            }));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(TransportError::Device {
            device: device.name().unwrap_or_default(),
            operation: "start stream",
            reason: e.to_string(),
        }));
        return;
    }
    info!(device = %device.name().unwrap_or_default(), tag = %tag, "capture running");
    let _ = ready_tx.send(Ok(()));

    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}
