//! Source and sink configuration

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use wavecast_dsp_core::config::EQ_BANDS;
use wavecast_dsp_core::SpeakerLayout;
use wavecast_packet_core::{AudioFormat, SinkId, SourceTag};
use wavecast_transport_core::sender::RtpDeviceMapping;

/// What a sink speaks on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkProtocol {
    /// Scream-UDP datagrams
    Scream,
    /// RTP with L16 payloads
    Rtp,
    /// RTP with Opus payloads
    RtpOpus,
    /// Local hardware playback
    SystemAudio,
    /// Listener-only sink (WebRTC peers, MP3 consumers)
    WebReceiver,
}

/// Configuration of one source instance (a live processor)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Tag this instance consumes; for capture sources leave empty
    /// and set `capture_device` instead
    pub source_tag: SourceTag,
    /// Open a system capture device and consume its tag
    pub capture_device: Option<String>,
    /// Output format the processor renders (must match its sinks)
    pub output_format: AudioFormat,
    /// Linear volume, 0..=1
    pub volume: f32,
    /// 18-band EQ gains in [0, 2]
    pub eq_gains: [f32; EQ_BANDS],
    /// Compensate the EQ curve to unity overall level
    pub eq_normalization: bool,
    /// Enable the RMS volume normalizer
    pub volume_normalization: bool,
    /// Playout delay, ms
    pub delay_ms: u64,
    /// Timeshift, signed seconds
    pub timeshift_sec: f64,
    /// Speaker layout per input channel count
    pub speaker_layouts: HashMap<u8, SpeakerLayout>,
}

impl SourceConfig {
    /// A unity pass-through instance for a tag and output format
    pub fn new(source_tag: SourceTag, output_format: AudioFormat) -> Self {
        Self {
            source_tag,
            capture_device: None,
            output_format,
            volume: 1.0,
            eq_gains: [1.0; EQ_BANDS],
            eq_normalization: false,
            volume_normalization: false,
            delay_ms: 0,
            timeshift_sec: 0.0,
            speaker_layouts: HashMap::new(),
        }
    }
}

/// Configuration of one sink (a live mixer plus its senders)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Unique sink id
    pub sink_id: SinkId,
    /// Egress protocol
    pub protocol: SinkProtocol,
    /// Network destination for network protocols
    pub destination: Option<SocketAddr>,
    /// Output device name for system playback; `None` = default
    pub device_name: Option<String>,
    /// Declared output format
    pub output_format: AudioFormat,
    /// Encode an MP3 side stream
    pub mp3_enabled: bool,
    /// Participate in multi-sink playback sync
    pub time_sync: bool,
    /// Extra playout delay granted to sync peers, ms
    pub time_sync_delay_ms: u64,
    /// Multi-device RTP stereo-pair mappings
    pub device_mappings: Vec<RtpDeviceMapping>,
}

impl SinkConfig {
    /// A sink with engine defaults
    pub fn new(sink_id: impl Into<SinkId>, protocol: SinkProtocol, output_format: AudioFormat) -> Self {
        Self {
            sink_id: sink_id.into(),
            protocol,
            destination: None,
            device_name: None,
            output_format,
            mp3_enabled: false,
            time_sync: false,
            time_sync_delay_ms: 0,
            device_mappings: Vec::new(),
        }
    }
}

/// Optional per-source parameter updates, applied together in order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSourceParams {
    /// New volume
    pub volume: Option<f32>,
    /// New EQ curve
    pub eq_gains: Option<[f32; EQ_BANDS]>,
    /// New EQ normalization flag
    pub eq_normalization: Option<bool>,
    /// New volume normalization flag
    pub volume_normalization: Option<bool>,
    /// New delay, ms
    pub delay_ms: Option<u64>,
    /// New timeshift, seconds
    pub timeshift_sec: Option<f64>,
    /// New speaker layout map
    pub speaker_layouts: Option<HashMap<u8, SpeakerLayout>>,
}
