//! RTP+Opus sender
//!
//! Like the RTP sender, but every destination runs its own Opus
//! encoder while all destinations share the RTP timestamp, so
//! receivers fed from different encoders remain aligned.

use std::net::{SocketAddr, UdpSocket};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wavecast_packet_core::rtp::{build_packet, RtpHeader, PAYLOAD_TYPE_OPUS};

use crate::error::{Result, TransportError};
use crate::sender::{MixedChunk, SenderStats};

/// Opus operates on 20 ms frames at 48 kHz
const OPUS_FRAME_SIZE: usize = 960;

/// Encoded-frame scratch size; Opus never exceeds this for one frame
const MAX_OPUS_PACKET: usize = 4_000;

/// RTP+Opus sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpOpusSenderConfig {
    /// All destinations; each gets its own encoder
    pub destinations: Vec<SocketAddr>,
    /// Dynamic payload type
    pub payload_type: u8,
    /// Encoder bitrate, bits per second
    pub bitrate: i32,
}

impl RtpOpusSenderConfig {
    /// One destination at a default voice-music bitrate
    pub fn unicast(destination: SocketAddr) -> Self {
        Self {
            destinations: vec![destination],
            payload_type: PAYLOAD_TYPE_OPUS,
            bitrate: 128_000,
        }
    }
}

struct OpusLane {
    destination: SocketAddr,
    encoder: opus::Encoder,
    sequence: u16,
    ssrc: u32,
}

/// The RTP+Opus sender
pub struct RtpOpusSender {
    config: RtpOpusSenderConfig,
    socket: Option<UdpSocket>,
    lanes: Vec<OpusLane>,
    channels: u8,
    /// Shared RTP clock in 48 kHz samples
    timestamp: u32,
    /// Samples buffered toward the next 20 ms frame
    pending: Vec<i16>,
    stats: SenderStats,
}

impl RtpOpusSender {
    /// Build from configuration
    pub fn new(config: RtpOpusSenderConfig) -> Self {
        Self {
            config,
            socket: None,
            lanes: Vec::new(),
            channels: 2,
            timestamp: rand::thread_rng().gen(),
            pending: Vec::new(),
            stats: SenderStats::default(),
        }
    }

    /// Bind the socket; encoders are created on the first chunk, when
    /// the channel count is known
    pub fn setup(&mut self) -> bool {
        match UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => {
                self.socket = Some(socket);
                true
            }
            Err(e) => {
                warn!(error = %e, "rtp-opus sender bind failed");
                false
            }
        }
    }

    fn build_lanes(&mut self, channels: u8) -> Result<()> {
        let opus_channels = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => {
                return Err(TransportError::UnsupportedFormat {
                    sender: "rtp_opus",
                    reason: format!("{other} channels; opus carries mono or stereo"),
                })
            }
        };
        let mut rng = rand::thread_rng();
        self.lanes.clear();
        for destination in self.config.destinations.clone() {
            let mut encoder =
                opus::Encoder::new(48_000, opus_channels, opus::Application::Audio).map_err(
                    |e| TransportError::Codec {
                        codec: "opus",
                        reason: e.to_string(),
                    },
                )?;
            encoder
                .set_bitrate(opus::Bitrate::Bits(self.config.bitrate))
                .map_err(|e| TransportError::Codec {
                    codec: "opus",
                    reason: e.to_string(),
                })?;
            self.lanes.push(OpusLane {
                destination,
                encoder,
                sequence: rng.gen(),
                ssrc: rng.gen(),
            });
        }
        self.channels = channels;
        debug!(lanes = self.lanes.len(), channels, "rtp-opus lanes ready");
        Ok(())
    }

    /// Queue mixed audio, encoding and sending every complete frame
    pub fn send_chunk(&mut self, chunk: &MixedChunk<'_>) -> Result<()> {
        if self.socket.is_none() {
            self.stats.send_errors += 1;
            return Ok(());
        }
        if chunk.format.sample_rate != 48_000 {
            return Err(TransportError::UnsupportedFormat {
                sender: "rtp_opus",
                reason: format!("{} Hz; opus egress requires 48 kHz sinks", chunk.format.sample_rate),
            });
        }
        if self.lanes.is_empty() || self.channels != chunk.format.channels {
            self.build_lanes(chunk.format.channels)?;
        }

        self.pending
            .extend(chunk.pcm32.iter().map(|&s| (s >> 16) as i16));

        let channels = self.channels as usize;
        let samples_per_frame = OPUS_FRAME_SIZE * channels;
        while self.pending.len() >= samples_per_frame {
            let frame: Vec<i16> = self.pending.drain(..samples_per_frame).collect();
            self.emit_frame(&frame);
            self.timestamp = self.timestamp.wrapping_add(OPUS_FRAME_SIZE as u32);
        }
        Ok(())
    }

    fn emit_frame(&mut self, frame: &[i16]) {
        let Some(socket) = &self.socket else { return };
        let payload_type = self.config.payload_type;
        let timestamp = self.timestamp;
        let mut scratch = vec![0u8; MAX_OPUS_PACKET];
        for lane in &mut self.lanes {
            let encoded_len = match lane.encoder.encode(frame, &mut scratch) {
                Ok(len) => len,
                Err(e) => {
                    debug!(dest = %lane.destination, error = %e, "opus encode failed");
                    self.stats.send_errors += 1;
                    continue;
                }
            };
            let header = RtpHeader {
                payload_type,
                marker: false,
                sequence: lane.sequence,
                timestamp,
                ssrc: lane.ssrc,
            };
            lane.sequence = lane.sequence.wrapping_add(1);
            let packet = build_packet(&header, &scratch[..encoded_len]);
            match socket.send_to(&packet, lane.destination) {
                Ok(sent) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += sent as u64;
                }
                Err(e) => {
                    debug!(dest = %lane.destination, error = %e, "rtp-opus send failed");
                    self.stats.send_errors += 1;
                }
            }
        }
    }

    /// Drop the socket and encoders
    pub fn close(&mut self) {
        self.socket = None;
        self.lanes.clear();
        self.pending.clear();
    }

    /// Snapshot counters
    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }
}
