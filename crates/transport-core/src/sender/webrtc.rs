//! WebRTC sender
//!
//! Mixed PCM is Opus-encoded at 48 kHz and written onto a local track
//! of a standards-compliant peer connection. Signaling is event-based:
//! the local answer SDP and every local ICE candidate are surfaced
//! through the event callback, and remote descriptions/candidates are
//! accepted asynchronously. Audio is forwarded only once the peer
//! connection reports connected.
//!
//! Construction and setup must never run under the audio manager's
//! lock: the signaling library calls back from its own threads and
//! re-entering the manager from those callbacks would deadlock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Result, TransportError};
use crate::runtime;
use crate::sender::{MixedChunk, SenderStats};

/// Opus frame length at 48 kHz
const OPUS_FRAME_SIZE: usize = 960;

/// Scratch for one encoded frame
const MAX_OPUS_PACKET: usize = 4_000;

/// WebRTC sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcSenderConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Opus bitrate, bits per second
    pub opus_bitrate: i32,
}

impl Default for WebRtcSenderConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            opus_bitrate: 128_000,
        }
    }
}

/// Signaling events surfaced to the engine's per-listener queue
#[derive(Debug, Clone)]
pub enum WebRtcSenderEvent {
    /// The local answer SDP; emitted exactly once per offer
    LocalDescription(String),
    /// A local ICE candidate string
    LocalCandidate(String),
    /// The peer connection reached connected
    Connected,
    /// The peer connection left connected
    Disconnected,
}

type EventCallback = Arc<dyn Fn(WebRtcSenderEvent) + Send + Sync>;

/// PCM → Opus → SRTP egress toward one listening peer
pub struct WebRtcSender {
    config: WebRtcSenderConfig,
    offer_sdp: String,
    on_event: EventCallback,
    pc: Option<Arc<RTCPeerConnection>>,
    track: Option<Arc<TrackLocalStaticSample>>,
    connected: Arc<AtomicBool>,
    encoder: Option<opus::Encoder>,
    channels: u8,
    pending: Vec<i16>,
    stats: SenderStats,
}

impl WebRtcSender {
    /// Build for one remote offer; nothing network-visible happens
    /// until [`setup`](Self::setup)
    pub fn new(
        config: WebRtcSenderConfig,
        offer_sdp: String,
        on_event: Arc<dyn Fn(WebRtcSenderEvent) + Send + Sync>,
    ) -> Self {
        Self {
            config,
            offer_sdp,
            on_event,
            pc: None,
            track: None,
            connected: Arc::new(AtomicBool::new(false)),
            encoder: None,
            channels: 2,
            pending: Vec::new(),
            stats: SenderStats::default(),
        }
    }

    /// Create the peer connection, answer the offer, start gathering
    ///
    /// Idempotent: a sender that already has its peer connection (the
    /// manager sets up before handing the sender to the mixer) reports
    /// success without touching it.
    pub fn setup(&mut self) -> bool {
        if self.pc.is_some() {
            return true;
        }
        match runtime::handle().block_on(self.setup_async()) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "webrtc sender setup failed");
                false
            }
        }
    }

    /// A cheap handle for remote SDP/ICE input, valid after setup
    pub fn signaling(&self) -> Option<WebRtcSignaling> {
        self.pc.as_ref().map(|pc| WebRtcSignaling {
            pc: Arc::clone(pc),
        })
    }

    async fn setup_async(&mut self) -> Result<()> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::WebRtc(e.to_string()))?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "wavecast".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let on_event = Arc::clone(&self.on_event);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let on_event = Arc::clone(&on_event);
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => on_event(WebRtcSenderEvent::LocalCandidate(init.candidate)),
                        Err(e) => debug!(error = %e, "ice candidate serialization failed"),
                    }
                }
            })
        }));

        let on_event = Arc::clone(&self.on_event);
        let connected = Arc::clone(&self.connected);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let on_event = Arc::clone(&on_event);
            let connected = Arc::clone(&connected);
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        connected.store(true, Ordering::Release);
                        on_event(WebRtcSenderEvent::Connected);
                    }
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => {
                        connected.store(false, Ordering::Release);
                        on_event(WebRtcSenderEvent::Disconnected);
                    }
                    _ => {}
                }
            })
        }));

        let offer = RTCSessionDescription::offer(self.offer_sdp.clone())
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        let answer_sdp = answer.sdp.clone();
        pc.set_local_description(answer)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        (self.on_event)(WebRtcSenderEvent::LocalDescription(answer_sdp));

        info!("webrtc sender answering, gathering candidates");
        self.pc = Some(pc);
        self.track = Some(track);
        Ok(())
    }

    /// Apply a renegotiated remote description
    pub fn set_remote_description(&self, sdp: String) -> Result<()> {
        let Some(pc) = &self.pc else {
            return Err(TransportError::WebRtc("no peer connection".to_string()));
        };
        let pc = Arc::clone(pc);
        runtime::handle().block_on(async move {
            let desc = RTCSessionDescription::offer(sdp)
                .map_err(|e| TransportError::WebRtc(e.to_string()))?;
            pc.set_remote_description(desc)
                .await
                .map_err(|e| TransportError::WebRtc(e.to_string()))
        })
    }

    /// Feed a remote ICE candidate
    pub fn add_remote_ice_candidate(&self, candidate: String) -> Result<()> {
        let Some(pc) = &self.pc else {
            return Err(TransportError::WebRtc("no peer connection".to_string()));
        };
        let pc = Arc::clone(pc);
        runtime::handle().block_on(async move {
            pc.add_ice_candidate(RTCIceCandidateInit {
                candidate,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))
        })
    }

    /// Whether the peer connection is currently connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Encode and forward a chunk; silently skipped until connected
    pub fn send_chunk(&mut self, chunk: &MixedChunk<'_>) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        if chunk.format.sample_rate != 48_000 {
            return Err(TransportError::UnsupportedFormat {
                sender: "webrtc",
                reason: format!("{} Hz; webrtc egress requires 48 kHz sinks", chunk.format.sample_rate),
            });
        }
        let channels = chunk.format.channels.min(2).max(1);
        if self.encoder.is_none() || self.channels != channels {
            let opus_channels = if channels == 1 {
                opus::Channels::Mono
            } else {
                opus::Channels::Stereo
            };
            let mut encoder = opus::Encoder::new(48_000, opus_channels, opus::Application::Audio)
                .map_err(|e| TransportError::Codec {
                    codec: "opus",
                    reason: e.to_string(),
                })?;
            encoder
                .set_bitrate(opus::Bitrate::Bits(self.config.opus_bitrate))
                .map_err(|e| TransportError::Codec {
                    codec: "opus",
                    reason: e.to_string(),
                })?;
            self.encoder = Some(encoder);
            self.channels = channels;
            self.pending.clear();
        }

        // Sinks wider than stereo fold down to their front pair here.
        let src_channels = chunk.format.channels as usize;
        if src_channels <= 2 {
            self.pending
                .extend(chunk.pcm32.iter().map(|&s| (s >> 16) as i16));
        } else {
            for frame in chunk.pcm32.chunks_exact(src_channels) {
                self.pending.push((frame[0] >> 16) as i16);
                self.pending.push((frame[1] >> 16) as i16);
            }
        }

        let samples_per_frame = OPUS_FRAME_SIZE * self.channels as usize;
        let mut scratch = vec![0u8; MAX_OPUS_PACKET];
        while self.pending.len() >= samples_per_frame {
            let frame: Vec<i16> = self.pending.drain(..samples_per_frame).collect();
            let encoder = self.encoder.as_mut().expect("encoder built above");
            let len = match encoder.encode(&frame, &mut scratch) {
                Ok(len) => len,
                Err(e) => {
                    debug!(error = %e, "opus encode failed");
                    self.stats.send_errors += 1;
                    continue;
                }
            };
            let track = self.track.as_ref().expect("track exists when connected");
            let sample = Sample {
                data: Bytes::copy_from_slice(&scratch[..len]),
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            let write = runtime::handle().block_on(track.write_sample(&sample));
            match write {
                Ok(()) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += len as u64;
                }
                Err(e) => {
                    debug!(error = %e, "track write failed");
                    self.stats.send_errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Close the peer connection
    pub fn close(&mut self) {
        if let Some(pc) = self.pc.take() {
            let _ = runtime::handle().block_on(pc.close());
        }
        self.track = None;
        self.encoder = None;
        self.connected.store(false, Ordering::Release);
    }

    /// Snapshot counters
    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }
}

impl Drop for WebRtcSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remote-signaling surface that outlives the sender's move into a
/// mixer thread
#[derive(Clone)]
pub struct WebRtcSignaling {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcSignaling {
    /// Apply a renegotiated remote description
    pub fn set_remote_description(&self, sdp: String) -> Result<()> {
        let pc = Arc::clone(&self.pc);
        runtime::handle().block_on(async move {
            let desc = RTCSessionDescription::offer(sdp)
                .map_err(|e| TransportError::WebRtc(e.to_string()))?;
            pc.set_remote_description(desc)
                .await
                .map_err(|e| TransportError::WebRtc(e.to_string()))
        })
    }

    /// Feed a remote ICE candidate
    pub fn add_remote_ice_candidate(&self, candidate: String) -> Result<()> {
        let pc = Arc::clone(&self.pc);
        runtime::handle().block_on(async move {
            pc.add_ice_candidate(RTCIceCandidateInit {
                candidate,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_before_connection_are_skipped_silently() {
        let events: Arc<parking_lot::Mutex<Vec<WebRtcSenderEvent>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut sender = WebRtcSender::new(
            WebRtcSenderConfig::default(),
            String::new(),
            Arc::new(move |e| sink.lock().push(e)),
        );
        let format = wavecast_packet_core::AudioFormat::stereo_48k_16();
        let pcm32 = vec![0i32; 1_920];
        let bytes = vec![0u8; 3_840];
        // Not connected: accepted and dropped without error.
        sender
            .send_chunk(&MixedChunk {
                format,
                frames: 960,
                rtp_timestamp: 0,
                pcm32: &pcm32,
                bytes: &bytes,
            })
            .unwrap();
        assert_eq!(sender.stats().packets_sent, 0);
        assert!(events.lock().is_empty());
    }
}
