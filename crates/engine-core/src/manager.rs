//! The audio manager
//!
//! Owns every live component and exposes the control surface. The
//! manager mutex is reentrant because control APIs recurse through
//! shared helpers; it is never held across calls into the WebRTC
//! signaling library, whose callbacks re-enter the manager from their
//! own threads.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info};

use wavecast_dsp_core::{
    ProcessorCommand, ProcessorHandle, SourceInputProcessor, SourceParams,
};
use wavecast_mixer_core::{
    GlobalSyncClock, SinkAudioMixer, SinkMixerConfig, SinkSyncCoordinator,
};
use wavecast_mixer_core::mixer::MixerHandle;
use wavecast_packet_core::{
    chunk_ring, packet_lane, AudioFormat, BitDepth, InstanceId, SinkId, SourceTag, TaggedPacket,
};
use wavecast_timeshift_core::manager::TimeshiftExport;
use wavecast_timeshift_core::{RateHandle, TimeshiftManager};
use wavecast_transport_core::receiver::{
    self, CaptureRegistry, ReceiverHandle, RtpReceiverConfig, SystemDeviceInfo,
};
use wavecast_transport_core::sender::{
    AnySender, RtpOpusSender, RtpOpusSenderConfig, RtpSender, RtpSenderConfig, ScreamSender,
    SystemPlaybackConfig, SystemPlaybackSender, WebRtcSender, WebRtcSenderConfig,
    WebRtcSenderEvent, WebRtcSignaling,
};

use crate::config::{SinkConfig, SinkProtocol, SourceConfig, UpdateSourceParams};
use crate::devices::DeviceMonitor;
use crate::error::{EngineError, Result};
use crate::notifications::{EngineNotification, NotificationQueue};
use crate::settings::{AudioEngineSettings, SettingsHub};
use crate::stats::{AudioEngineStats, RateTracker, SourceStatsEntry};

struct SourceEntry {
    config: SourceConfig,
    handle: ProcessorHandle,
    capture_tag: Option<SourceTag>,
}

struct SinkEntry {
    config: SinkConfig,
    mixer: MixerHandle,
    coordinator: Option<Arc<SinkSyncCoordinator>>,
}

#[derive(Default)]
struct ManagerState {
    sources: HashMap<InstanceId, SourceEntry>,
    sinks: HashMap<SinkId, SinkEntry>,
    routes: HashSet<(InstanceId, SinkId)>,
    sync_clocks: HashMap<u32, Arc<GlobalSyncClock>>,
    receivers: Vec<ReceiverHandle>,
    listeners: HashMap<(SinkId, String), WebRtcSignaling>,
}

/// The engine's owner and control surface
pub struct AudioManager {
    settings: SettingsHub,
    timeshift: Arc<TimeshiftManager>,
    capture: CaptureRegistry,
    state: ReentrantMutex<RefCell<ManagerState>>,
    notifications: NotificationQueue,
    devices: DeviceMonitor,
    rates: Mutex<RateTracker>,
    started_at: Instant,
    collector_running: Arc<AtomicBool>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl AudioManager {
    /// Start the engine: the timeshift dispatcher, capture registry
    /// and the 1 Hz stats collector
    pub fn start(settings: AudioEngineSettings) -> Arc<Self> {
        let timeshift = Arc::new(TimeshiftManager::start(settings.timeshift.clone()));
        let manager = Arc::new(Self {
            settings: SettingsHub::new(settings),
            capture: CaptureRegistry::new(Arc::clone(&timeshift)),
            timeshift,
            state: ReentrantMutex::new(RefCell::new(ManagerState::default())),
            notifications: NotificationQueue::new(256),
            devices: DeviceMonitor::new(),
            rates: Mutex::new(RateTracker::default()),
            started_at: Instant::now(),
            collector_running: Arc::new(AtomicBool::new(true)),
            collector: Mutex::new(None),
        });

        let weak: Weak<AudioManager> = Arc::downgrade(&manager);
        let running = Arc::clone(&manager.collector_running);
        let collector = std::thread::Builder::new()
            .name("engine-stats".to_string())
            .spawn(move || {
                let mut last_tick = Instant::now();
                while running.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1_000));
                    let Some(manager) = weak.upgrade() else { break };
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    last_tick = Instant::now();
                    let ts = manager.timeshift.stats();
                    let total_bytes: u64 =
                        ts.streams.values().map(|s| s.bytes_received).sum();
                    manager
                        .rates
                        .lock()
                        .tick(ts.total_packets_added, total_bytes, elapsed);
                    manager.devices.poll(&manager.notifications);
                }
            })
            .expect("spawning the stats collector cannot fail");
        *manager.collector.lock() = Some(collector);

        info!("audio manager started");
        manager
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    // ------------------------------------------------------------------
    // Sink CRUD

    /// Create a sink: its mixer, senders and (when requested) its sync
    /// coordinator
    pub fn add_sink(&self, config: SinkConfig) -> Result<()> {
        let settings = self.settings.snapshot();
        let senders = self.build_senders(&config)?;

        let mut mixer_config = SinkMixerConfig::new(
            config.sink_id.clone(),
            config.output_format,
            settings.dsp.chunk_frames,
        );
        mixer_config.mp3_enabled = config.mp3_enabled;
        mixer_config.mp3_bitrate_kbps = settings.mixer_tuning.mp3_bitrate_kbps;
        mixer_config.mp3_output_queue_max_size =
            settings.mixer_tuning.mp3_output_queue_max_size;
        mixer_config.time_sync = config.time_sync;
        mixer_config.time_sync_delay_ms = config.time_sync_delay_ms;
        mixer_config.underrun_hold_timeout_ms =
            settings.mixer_tuning.underrun_hold_timeout_ms;
        mixer_config.max_ready_chunks_per_source =
            settings.mixer_tuning.max_ready_chunks_per_source;
        mixer_config.max_ready_queue_duration_ms =
            settings.mixer_tuning.max_ready_queue_duration_ms;

        self.with_state(|state| {
            if state.sinks.contains_key(&config.sink_id) {
                return Err(EngineError::ComponentSetup {
                    component: "sink",
                    reason: format!("sink {} already exists", config.sink_id),
                });
            }

            let coordinator = if config.time_sync {
                let rate = config.output_format.sample_rate;
                let clock = state
                    .sync_clocks
                    .entry(rate)
                    .or_insert_with(|| {
                        Arc::new(GlobalSyncClock::new(rate, settings.sync.clone()))
                    });
                Some(SinkSyncCoordinator::enable(
                    Arc::clone(clock),
                    config.sink_id.clone(),
                    rate,
                )?)
            } else {
                None
            };

            let mixer = SinkAudioMixer::spawn(mixer_config, senders);
            if let Some(coordinator) = &coordinator {
                mixer.set_coordinator(Some(Arc::clone(coordinator)));
            }
            debug!(sink = %config.sink_id, protocol = ?config.protocol, "sink added");
            state.sinks.insert(
                config.sink_id.clone(),
                SinkEntry {
                    config,
                    mixer,
                    coordinator,
                },
            );
            Ok(())
        })
    }

    /// Tear a sink down, detaching every route and listener
    pub fn remove_sink(&self, sink_id: &SinkId) -> Result<()> {
        self.with_state(|state| {
            let entry = state
                .sinks
                .remove(sink_id)
                .ok_or_else(|| EngineError::UnknownSink(sink_id.clone()))?;

            let routed: Vec<InstanceId> = state
                .routes
                .iter()
                .filter(|(_, s)| s == sink_id)
                .map(|(i, _)| i.clone())
                .collect();
            for instance in routed {
                let _ = self.timeshift.detach_sink_ring(&instance, sink_id);
                state.routes.remove(&(instance, sink_id.clone()));
            }
            state.listeners.retain(|(s, _), _| s != sink_id);

            if let Some(coordinator) = &entry.coordinator {
                coordinator.disable();
            }
            entry.mixer.stop();
            debug!(sink = %sink_id, "sink removed");
            Ok(())
        })
    }

    fn build_senders(&self, config: &SinkConfig) -> Result<Vec<AnySender>> {
        let format = config.output_format;
        let need_destination = || {
            config.destination.ok_or(EngineError::ComponentSetup {
                component: "sink",
                reason: format!("sink {} needs a destination", config.sink_id),
            })
        };
        Ok(match config.protocol {
            SinkProtocol::Scream => {
                vec![AnySender::Scream(ScreamSender::new(need_destination()?))]
            }
            SinkProtocol::Rtp => {
                let mut rtp_config = RtpSenderConfig::unicast(need_destination()?);
                rtp_config.session_name = config.sink_id.to_string();
                rtp_config.announce_sap = true;
                rtp_config.device_mappings = config.device_mappings.clone();
                vec![AnySender::Rtp(RtpSender::new(rtp_config))]
            }
            SinkProtocol::RtpOpus => {
                let mut opus_config = RtpOpusSenderConfig::unicast(need_destination()?);
                if !config.device_mappings.is_empty() {
                    opus_config.destinations = config
                        .device_mappings
                        .iter()
                        .map(|m| m.destination)
                        .collect();
                }
                vec![AnySender::RtpOpus(RtpOpusSender::new(opus_config))]
            }
            SinkProtocol::SystemAudio => {
                let playback_config = SystemPlaybackConfig {
                    device_name: config.device_name.clone(),
                    ..SystemPlaybackConfig::default()
                };
                vec![AnySender::System(SystemPlaybackSender::new(
                    playback_config,
                    format.sample_rate,
                    format.channels,
                ))]
            }
            // Listener-only sinks start with no static sender.
            SinkProtocol::WebReceiver => Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Source CRUD

    /// Create a source instance and its processor; returns the id used
    /// by every later control call
    pub fn configure_source(&self, config: SourceConfig) -> Result<InstanceId> {
        // Capture devices open outside the manager lock; the device
        // backend may take a moment.
        let capture_tag = match &config.capture_device {
            Some(device) => {
                let request = if device == "default" {
                    None
                } else {
                    Some(device.clone())
                };
                match self.capture.open(request) {
                    Ok(tag) => Some(tag),
                    Err(e) => {
                        self.notifications.push(EngineNotification::ComponentFailed {
                            component: format!("capture:{device}"),
                            reason: e.to_string(),
                        });
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };
        let source_tag = capture_tag
            .clone()
            .unwrap_or_else(|| config.source_tag.clone());

        let settings = self.settings.snapshot();
        let instance_id = InstanceId::generate();
        let (lane_tx, lane_rx) =
            packet_lane(settings.timeshift.packet_lane_capacity);
        let registered = self.timeshift.register_processor(
            instance_id.clone(),
            source_tag.clone(),
            lane_tx,
            config.delay_ms,
            config.timeshift_sec,
        )?;

        let params = SourceParams {
            volume: config.volume,
            eq_gains: config.eq_gains,
            eq_normalization: config.eq_normalization,
            volume_normalization: config.volume_normalization,
            delay_ms: config.delay_ms,
            timeshift_sec: config.timeshift_sec,
            speaker_layouts: config.speaker_layouts.clone(),
        };
        let handle = SourceInputProcessor::spawn(
            instance_id.clone(),
            source_tag,
            config.output_format,
            settings.dsp.clone(),
            params,
            lane_rx,
            registered.sink_rings,
            registered.rate,
            RateHandle::new(),
        );

        self.with_state(|state| {
            state.sources.insert(
                instance_id.clone(),
                SourceEntry {
                    config,
                    handle,
                    capture_tag,
                },
            );
        });
        Ok(instance_id)
    }

    /// Destroy a source instance, detaching it everywhere first
    pub fn remove_source(&self, instance_id: &InstanceId) -> Result<()> {
        self.with_state(|state| {
            let entry = state
                .sources
                .remove(instance_id)
                .ok_or_else(|| EngineError::UnknownSource(instance_id.clone()))?;

            let routed: Vec<SinkId> = state
                .routes
                .iter()
                .filter(|(i, _)| i == instance_id)
                .map(|(_, s)| s.clone())
                .collect();
            for sink_id in routed {
                let _ = self.timeshift.detach_sink_ring(instance_id, &sink_id);
                if let Some(sink) = state.sinks.get(&sink_id) {
                    sink.mixer.remove_input_ring(instance_id);
                }
                state.routes.remove(&(instance_id.clone(), sink_id));
            }

            let _ = self.timeshift.unregister_processor(instance_id);
            entry.handle.stop();
            if let Some(tag) = &entry.capture_tag {
                self.capture.release(tag);
            }
            debug!(instance = %instance_id, "source removed");
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Routing

    /// Route a source instance into a sink
    pub fn connect_source_sink(&self, instance_id: &InstanceId, sink_id: &SinkId) -> Result<()> {
        let settings = self.settings.snapshot();
        self.with_state(|state| {
            if state
                .routes
                .contains(&(instance_id.clone(), sink_id.clone()))
            {
                return Ok(());
            }
            let source = state
                .sources
                .get(instance_id)
                .ok_or_else(|| EngineError::UnknownSource(instance_id.clone()))?;
            let sink = state
                .sinks
                .get(sink_id)
                .ok_or_else(|| EngineError::UnknownSink(sink_id.clone()))?;

            let source_format = source.handle.output_format();
            let sink_format = sink.config.output_format;
            if source_format.sample_rate != sink_format.sample_rate
                || source_format.channels != sink_format.channels
            {
                return Err(EngineError::FormatMismatch {
                    source_format: source_format.to_string(),
                    sink_id: sink_id.clone(),
                    sink_format: sink_format.to_string(),
                });
            }

            let (tx, rx) = chunk_ring(settings.dsp.chunk_ring_capacity);
            self.timeshift
                .attach_sink_ring(instance_id, sink_id.clone(), tx)?;
            sink.mixer.add_input_ring(instance_id.clone(), rx);
            if let Some(coordinator) = &sink.coordinator {
                source
                    .handle
                    .send_command(ProcessorCommand::SetSyncTrim(coordinator.trim()));
            }
            state
                .routes
                .insert((instance_id.clone(), sink_id.clone()));
            debug!(instance = %instance_id, sink = %sink_id, "route connected");
            Ok(())
        })
    }

    /// Remove a route; the mixer returns to its prior lane set
    pub fn disconnect_source_sink(
        &self,
        instance_id: &InstanceId,
        sink_id: &SinkId,
    ) -> Result<()> {
        self.with_state(|state| {
            if !state
                .routes
                .remove(&(instance_id.clone(), sink_id.clone()))
            {
                return Ok(());
            }
            let _ = self.timeshift.detach_sink_ring(instance_id, sink_id);
            if let Some(sink) = state.sinks.get(sink_id) {
                sink.mixer.remove_input_ring(instance_id);
                if sink.coordinator.is_some() {
                    if let Some(source) = state.sources.get(instance_id) {
                        source
                            .handle
                            .send_command(ProcessorCommand::SetSyncTrim(RateHandle::new()));
                    }
                }
            }
            debug!(instance = %instance_id, sink = %sink_id, "route disconnected");
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Per-source control

    /// Apply a batch of optional parameter updates in order
    pub fn update_source_parameters(
        &self,
        instance_id: &InstanceId,
        update: UpdateSourceParams,
    ) -> Result<()> {
        self.with_state(|state| {
            let entry = state
                .sources
                .get_mut(instance_id)
                .ok_or_else(|| EngineError::UnknownSource(instance_id.clone()))?;
            let handle = &entry.handle;

            if let Some(volume) = update.volume {
                entry.config.volume = volume;
                handle.send_command(ProcessorCommand::SetVolume(volume));
            }
            if let Some(gains) = update.eq_gains {
                entry.config.eq_gains = gains;
                handle.send_command(ProcessorCommand::SetEq(gains));
            }
            if let Some(enabled) = update.eq_normalization {
                entry.config.eq_normalization = enabled;
                handle.send_command(ProcessorCommand::SetEqNormalization(enabled));
            }
            if let Some(enabled) = update.volume_normalization {
                entry.config.volume_normalization = enabled;
                handle.send_command(ProcessorCommand::SetVolumeNormalization(enabled));
            }
            if let Some(delay_ms) = update.delay_ms {
                entry.config.delay_ms = delay_ms;
                handle.send_command(ProcessorCommand::SetDelay(delay_ms));
                self.timeshift
                    .update_processor_delay(instance_id, delay_ms)?;
            }
            if let Some(timeshift_sec) = update.timeshift_sec {
                entry.config.timeshift_sec = timeshift_sec;
                handle.send_command(ProcessorCommand::SetTimeshift(timeshift_sec));
                self.timeshift
                    .update_processor_timeshift(instance_id, timeshift_sec)?;
            }
            if let Some(layouts) = update.speaker_layouts {
                entry.config.speaker_layouts = layouts.clone();
                handle.send_command(ProcessorCommand::SetSpeakerLayouts(layouts));
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Plugin inject

    /// Inject a caller-formatted packet under a caller-chosen tag
    #[allow(clippy::too_many_arguments)]
    pub fn write_plugin_packet(
        &self,
        source_tag: &SourceTag,
        payload: Bytes,
        channels: u8,
        sample_rate: u32,
        bit_depth: u8,
        chlayout1: u8,
        chlayout2: u8,
    ) -> Result<()> {
        let mut format = AudioFormat::new(
            sample_rate,
            BitDepth::from_bits(bit_depth)?,
            channels,
        )?;
        format.chlayout1 = chlayout1;
        format.chlayout2 = chlayout2;
        format.frames_in(payload.len())?;
        self.timeshift.add_packet(TaggedPacket::new(
            source_tag.clone(),
            format,
            None,
            payload,
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // WebRTC listeners

    /// Attach a WebRTC listener to a sink
    ///
    /// The peer connection is constructed and answered outside the
    /// manager lock; `on_local_sdp` fires exactly once with the answer
    /// and `on_local_ice` for every gathered candidate. `client_ip` is
    /// informational, for logs and the control plane.
    pub fn add_webrtc_listener(
        &self,
        sink_id: &SinkId,
        listener_id: &str,
        offer_sdp: String,
        on_local_sdp: impl Fn(String) + Send + Sync + 'static,
        on_local_ice: impl Fn(String) + Send + Sync + 'static,
        client_ip: Option<std::net::IpAddr>,
    ) -> Result<()> {
        // Validate the sink first so a bad id fails before any
        // signaling work happens.
        self.with_state(|state| {
            state
                .sinks
                .get(sink_id)
                .map(|_| ())
                .ok_or_else(|| EngineError::UnknownSink(sink_id.clone()))
        })?;

        let mut sender = WebRtcSender::new(
            WebRtcSenderConfig::default(),
            offer_sdp,
            Arc::new(move |event| match event {
                WebRtcSenderEvent::LocalDescription(sdp) => on_local_sdp(sdp),
                WebRtcSenderEvent::LocalCandidate(candidate) => on_local_ice(candidate),
                WebRtcSenderEvent::Connected | WebRtcSenderEvent::Disconnected => {}
            }),
        );
        if !sender.setup() {
            self.notifications.push(EngineNotification::SenderSetupFailed {
                sink_id: sink_id.clone(),
                reason: format!("webrtc listener {listener_id} setup failed"),
            });
            return Err(EngineError::ComponentSetup {
                component: "webrtc_listener",
                reason: "peer connection setup failed".to_string(),
            });
        }
        debug!(sink = %sink_id, listener = %listener_id, client_ip = ?client_ip, "webrtc listener attached");
        let signaling = sender.signaling().expect("setup succeeded");

        self.with_state(|state| {
            let sink = state
                .sinks
                .get(sink_id)
                .ok_or_else(|| EngineError::UnknownSink(sink_id.clone()))?;
            sink.mixer
                .add_listener(listener_id, AnySender::WebRtc(Box::new(sender)));
            state
                .listeners
                .insert((sink_id.clone(), listener_id.to_string()), signaling);
            Ok(())
        })
    }

    /// Apply a listener's renegotiated remote description
    pub fn set_webrtc_remote_description(
        &self,
        sink_id: &SinkId,
        listener_id: &str,
        sdp: String,
    ) -> Result<()> {
        let signaling = self.listener_signaling(sink_id, listener_id)?;
        // Signaling calls run outside the manager lock.
        signaling.set_remote_description(sdp)?;
        Ok(())
    }

    /// Feed a listener a remote ICE candidate
    pub fn add_webrtc_remote_ice_candidate(
        &self,
        sink_id: &SinkId,
        listener_id: &str,
        candidate: String,
    ) -> Result<()> {
        let signaling = self.listener_signaling(sink_id, listener_id)?;
        signaling.add_remote_ice_candidate(candidate)?;
        Ok(())
    }

    fn listener_signaling(&self, sink_id: &SinkId, listener_id: &str) -> Result<WebRtcSignaling> {
        self.with_state(|state| {
            state
                .listeners
                .get(&(sink_id.clone(), listener_id.to_string()))
                .cloned()
                .ok_or_else(|| EngineError::UnknownListener {
                    sink_id: sink_id.clone(),
                    listener_id: listener_id.to_string(),
                })
        })
    }

    /// Detach a WebRTC listener
    pub fn remove_webrtc_listener(&self, sink_id: &SinkId, listener_id: &str) -> Result<()> {
        self.with_state(|state| {
            state
                .listeners
                .remove(&(sink_id.clone(), listener_id.to_string()));
            let sink = state
                .sinks
                .get(sink_id)
                .ok_or_else(|| EngineError::UnknownSink(sink_id.clone()))?;
            sink.mixer.remove_listener(listener_id);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Data retrieval

    /// Drain a sink's queued MP3 stream
    pub fn get_mp3_data(&self, sink_id: &SinkId) -> Result<Bytes> {
        self.with_state(|state| {
            state
                .sinks
                .get(sink_id)
                .map(|sink| sink.mixer.take_mp3_data())
                .ok_or_else(|| EngineError::UnknownSink(sink_id.clone()))
        })
    }

    /// Export a source's retained audio over a lookback window
    pub fn export_timeshift_buffer(
        &self,
        source_tag: &SourceTag,
        lookback_sec: f64,
    ) -> TimeshiftExport {
        self.timeshift.export_lookback(source_tag, lookback_sec)
    }

    // ------------------------------------------------------------------
    // Receivers

    /// Start a raw-Scream receiver
    pub fn start_scream_receiver(&self, port: u16) -> Result<()> {
        let handle = receiver::scream::spawn(port, Arc::clone(&self.timeshift))?;
        self.with_state(|state| state.receivers.push(handle));
        Ok(())
    }

    /// Start a per-process Scream receiver
    pub fn start_per_process_receiver(&self, port: u16) -> Result<()> {
        let handle = receiver::per_process::spawn(port, Arc::clone(&self.timeshift))?;
        self.with_state(|state| state.receivers.push(handle));
        Ok(())
    }

    /// Start an RTP receiver (with SAP discovery when configured)
    pub fn start_rtp_receiver(&self, config: RtpReceiverConfig) -> Result<()> {
        let handle = receiver::rtp::spawn(config, Arc::clone(&self.timeshift))?;
        self.with_state(|state| state.receivers.push(handle));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settings, stats, devices

    /// The current settings snapshot
    pub fn get_audio_settings(&self) -> AudioEngineSettings {
        (*self.settings.snapshot()).clone()
    }

    /// Publish new settings
    ///
    /// Timeshift tuning applies immediately; DSP, mixer and sync
    /// tuning apply to components created after the call.
    pub fn set_audio_settings(&self, settings: AudioEngineSettings) {
        self.timeshift.set_config(settings.timeshift.clone());
        self.settings.publish(settings);
    }

    /// Assemble the full engine snapshot
    pub fn get_audio_engine_stats(&self) -> AudioEngineStats {
        let timeshift = self.timeshift.stats();
        let cursor_rates: HashMap<String, f64> = timeshift
            .cursors
            .iter()
            .map(|(id, (_stats, rate))| (id.clone(), *rate))
            .collect();
        self.with_state(|state| AudioEngineStats {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            global: self.rates.lock().rates,
            sources: state
                .sources
                .iter()
                .map(|(id, entry)| {
                    (
                        id.to_string(),
                        SourceStatsEntry {
                            source_tag: entry
                                .capture_tag
                                .as_ref()
                                .unwrap_or(&entry.config.source_tag)
                                .to_string(),
                            state: entry.handle.state(),
                            stats: entry.handle.stats(),
                            playback_rate: cursor_rates
                                .get(id.as_str())
                                .copied()
                                .unwrap_or(1.0),
                        },
                    )
                })
                .collect(),
            sinks: state
                .sinks
                .iter()
                .map(|(id, entry)| (id.to_string(), entry.mixer.stats()))
                .collect(),
            receivers: state.receivers.iter().map(|r| r.stats()).collect(),
            open_capture_devices: self.capture.open_count(),
            timeshift,
        })
    }

    /// Snapshot the system audio device registry
    pub fn list_system_devices(&self) -> Vec<SystemDeviceInfo> {
        self.devices.snapshot()
    }

    /// Take every queued engine notification (hotplug events included)
    pub fn drain_device_notifications(&self) -> Vec<EngineNotification> {
        self.notifications.drain()
    }

    // ------------------------------------------------------------------
    // Shutdown

    /// Stop everything: receivers, then the timeshift dispatcher, then
    /// processors, then mixers and their senders
    pub fn shutdown(&self) {
        self.collector_running.store(false, Ordering::Release);
        if let Some(handle) = self.collector.lock().take() {
            let _ = handle.join();
        }

        self.with_state(|state| {
            for receiver in state.receivers.drain(..) {
                receiver.stop();
            }
        });
        self.timeshift.shutdown();
        self.with_state(|state| {
            for (_, entry) in state.sources.drain() {
                entry.handle.stop();
                if let Some(tag) = &entry.capture_tag {
                    self.capture.release(tag);
                }
            }
            for (_, entry) in state.sinks.drain() {
                if let Some(coordinator) = &entry.coordinator {
                    coordinator.disable();
                }
                entry.mixer.stop();
            }
            state.routes.clear();
            state.listeners.clear();
        });
        info!("audio manager stopped");
    }
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        if self
            .collector_running
            .swap(false, Ordering::AcqRel)
        {
            if let Some(handle) = self.collector.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_error_cleanly() {
        let manager = AudioManager::start(AudioEngineSettings::default());
        let missing_sink = SinkId::new("nope");
        let missing_source = InstanceId::new("nope");
        assert!(matches!(
            manager.remove_sink(&missing_sink),
            Err(EngineError::UnknownSink(_))
        ));
        assert!(matches!(
            manager.remove_source(&missing_source),
            Err(EngineError::UnknownSource(_))
        ));
        assert!(matches!(
            manager.connect_source_sink(&missing_source, &missing_sink),
            Err(EngineError::UnknownSource(_))
        ));
        manager.shutdown();
    }

    #[test]
    fn settings_round_trip_is_a_no_op() {
        let manager = AudioManager::start(AudioEngineSettings::default());
        let before = manager.get_audio_engine_stats();
        manager.set_audio_settings(manager.get_audio_settings());
        let after = manager.get_audio_engine_stats();
        assert_eq!(
            before.timeshift.total_packets_added,
            after.timeshift.total_packets_added
        );
        assert_eq!(before.sources.len(), after.sources.len());
        manager.shutdown();
    }

    #[test]
    fn plugin_packets_validate_their_format() {
        let manager = AudioManager::start(AudioEngineSettings::default());
        let tag = SourceTag::new("plugin:test");
        // Ragged payload: 5 bytes is not a whole stereo 16-bit frame.
        let err = manager.write_plugin_packet(
            &tag,
            Bytes::from(vec![0u8; 5]),
            2,
            48_000,
            16,
            0x03,
            0x00,
        );
        assert!(err.is_err());
        // A valid payload is accepted.
        manager
            .write_plugin_packet(&tag, Bytes::from(vec![0u8; 1152]), 2, 48_000, 16, 0x03, 0x00)
            .unwrap();
        manager.shutdown();
    }
}
