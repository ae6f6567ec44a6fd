//! Sink egress
//!
//! Senders share a small uniform contract: `setup`, `send_chunk`,
//! `close`, plus a stats snapshot. The set is closed (a tagged enum
//! rather than a trait object) so a mixer's hot loop stays
//! monomorphic per sink instance.

pub mod rtp;
pub mod rtp_opus;
pub mod scream;
pub mod system;
pub mod webrtc;

use serde::{Deserialize, Serialize};
use wavecast_packet_core::AudioFormat;

use crate::error::Result;

pub use rtp::{RtpDeviceMapping, RtpSender, RtpSenderConfig};
pub use rtp_opus::{RtpOpusSender, RtpOpusSenderConfig};
pub use scream::ScreamSender;
pub use system::{SystemPlaybackConfig, SystemPlaybackSender};
pub use webrtc::{WebRtcSender, WebRtcSenderConfig, WebRtcSenderEvent, WebRtcSignaling};

/// One mixed chunk as the mixer hands it to every sender
///
/// `pcm32` is the 32-bit accumulator output; `bytes` is the same audio
/// already down-converted to the sink's declared bit depth,
/// little-endian interleaved, so byte-oriented senders do not repeat
/// the conversion.
#[derive(Debug, Clone, Copy)]
pub struct MixedChunk<'a> {
    /// The sink's declared output format
    pub format: AudioFormat,
    /// Frames in this chunk
    pub frames: usize,
    /// Output sample-clock position of the first frame
    pub rtp_timestamp: u32,
    /// Interleaved 32-bit samples
    pub pcm32: &'a [i32],
    /// Interleaved sink-depth little-endian bytes
    pub bytes: &'a [u8],
}

/// Counters every sender keeps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderStats {
    /// Datagrams / frames / samples written, per the sender's unit
    pub packets_sent: u64,
    /// Payload bytes that left the process
    pub bytes_sent: u64,
    /// Transient write failures (the mixer is never stalled by these)
    pub send_errors: u64,
    /// Playback underruns, for device-backed senders
    pub underruns: u64,
}

/// The closed set of sender implementations
pub enum AnySender {
    /// Scream-UDP datagrams
    Scream(ScreamSender),
    /// RTP with L16 payloads and optional SAP announcements
    Rtp(RtpSender),
    /// RTP with per-destination Opus encoders
    RtpOpus(RtpOpusSender),
    /// Local hardware playback
    System(SystemPlaybackSender),
    /// WebRTC peer connection
    WebRtc(Box<WebRtcSender>),
    /// In-process capture of mixed chunks, for tests and loopbacks
    Loopback(LoopbackSender),
}

impl AnySender {
    /// Prepare the sender; a `false` return is a permanent setup
    /// failure the manager reports upward
    pub fn setup(&mut self) -> bool {
        match self {
            AnySender::Scream(s) => s.setup(),
            AnySender::Rtp(s) => s.setup(),
            AnySender::RtpOpus(s) => s.setup(),
            AnySender::System(s) => s.setup(),
            AnySender::WebRtc(s) => s.setup(),
            AnySender::Loopback(s) => s.setup(),
        }
    }

    /// Emit one mixed chunk; errors are counted, never propagated as
    /// mixer stalls
    pub fn send_chunk(&mut self, chunk: &MixedChunk<'_>) -> Result<()> {
        match self {
            AnySender::Scream(s) => s.send_chunk(chunk),
            AnySender::Rtp(s) => s.send_chunk(chunk),
            AnySender::RtpOpus(s) => s.send_chunk(chunk),
            AnySender::System(s) => s.send_chunk(chunk),
            AnySender::WebRtc(s) => s.send_chunk(chunk),
            AnySender::Loopback(s) => s.send_chunk(chunk),
        }
    }

    /// Tear the sender down
    pub fn close(&mut self) {
        match self {
            AnySender::Scream(s) => s.close(),
            AnySender::Rtp(s) => s.close(),
            AnySender::RtpOpus(s) => s.close(),
            AnySender::System(s) => s.close(),
            AnySender::WebRtc(s) => s.close(),
            AnySender::Loopback(s) => s.close(),
        }
    }

    /// Snapshot counters
    pub fn stats(&self) -> SenderStats {
        match self {
            AnySender::Scream(s) => s.stats(),
            AnySender::Rtp(s) => s.stats(),
            AnySender::RtpOpus(s) => s.stats(),
            AnySender::System(s) => s.stats(),
            AnySender::WebRtc(s) => s.stats(),
            AnySender::Loopback(s) => s.stats(),
        }
    }
}

/// Captures mixed chunks on a bounded channel
pub struct LoopbackSender {
    tx: crossbeam_channel::Sender<(u32, Vec<u8>)>,
    stats: SenderStats,
}

impl LoopbackSender {
    /// Build a loopback pair: the sender and the capture side
    pub fn new(capacity: usize) -> (Self, crossbeam_channel::Receiver<(u32, Vec<u8>)>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                tx,
                stats: SenderStats::default(),
            },
            rx,
        )
    }

    fn setup(&mut self) -> bool {
        true
    }

    fn send_chunk(&mut self, chunk: &MixedChunk<'_>) -> Result<()> {
        if self
            .tx
            .try_send((chunk.rtp_timestamp, chunk.bytes.to_vec()))
            .is_ok()
        {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += chunk.bytes.len() as u64;
        } else {
            self.stats.send_errors += 1;
        }
        Ok(())
    }

    fn close(&mut self) {}

    fn stats(&self) -> SenderStats {
        self.stats.clone()
    }
}
