//! RTP sender
//!
//! L16 (network-order PCM) over RTP with a dynamic payload type. The
//! sender can announce itself over SAP every ~5 s, and can split a
//! multichannel sink across several destinations as stereo pairs that
//! share one RTP clock so downstream receivers stay aligned.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wavecast_packet_core::rtp::{build_packet, RtpHeader, PAYLOAD_TYPE_L16};
use wavecast_packet_core::sap::{encode_announcement, SdpStream};

use crate::error::Result;
use crate::sender::{MixedChunk, SenderStats};

/// Well-known SAP multicast group and port
const SAP_GROUP: (Ipv4Addr, u16) = (Ipv4Addr::new(224, 2, 127, 254), 9_875);

/// Interval between SAP announcements
const SAP_INTERVAL: Duration = Duration::from_secs(5);

/// Frames per RTP packet; stereo L16 stays comfortably under the MTU
const FRAMES_PER_PACKET: usize = 240;

/// One destination of a multi-device split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpDeviceMapping {
    /// Where this pair goes
    pub destination: SocketAddr,
    /// First of the two interleaved channels carried to it
    pub channel_offset: u8,
}

/// RTP sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpSenderConfig {
    /// Primary destination
    pub destination: SocketAddr,
    /// Dynamic payload type
    pub payload_type: u8,
    /// Announce the stream over SAP
    pub announce_sap: bool,
    /// Session name used in the announcement
    pub session_name: String,
    /// Optional stereo-pair splits sharing the RTP clock
    pub device_mappings: Vec<RtpDeviceMapping>,
}

impl RtpSenderConfig {
    /// Plain unicast sender without SAP
    pub fn unicast(destination: SocketAddr) -> Self {
        Self {
            destination,
            payload_type: PAYLOAD_TYPE_L16,
            announce_sap: false,
            session_name: "wavecast".to_string(),
            device_mappings: Vec::new(),
        }
    }
}

struct Lane {
    destination: SocketAddr,
    channel_offset: u8,
    channels: u8,
    sequence: u16,
    ssrc: u32,
}

/// The RTP sender
pub struct RtpSender {
    config: RtpSenderConfig,
    socket: Option<UdpSocket>,
    lanes: Vec<Lane>,
    /// Shared RTP clock across all lanes
    timestamp: u32,
    /// Frames buffered toward the next packet, interleaved full-width
    pending: Vec<i16>,
    sap_running: Arc<AtomicBool>,
    sap_thread: Option<JoinHandle<()>>,
    stats: SenderStats,
}

impl RtpSender {
    /// Build from configuration
    pub fn new(config: RtpSenderConfig) -> Self {
        Self {
            config,
            socket: None,
            lanes: Vec::new(),
            timestamp: rand::thread_rng().gen(),
            pending: Vec::new(),
            sap_running: Arc::new(AtomicBool::new(false)),
            sap_thread: None,
            stats: SenderStats::default(),
        }
    }

    /// Bind the socket, create lanes, start SAP if configured
    pub fn setup(&mut self) -> bool {
        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(s) => s,
            Err(e) => {
                warn!(dest = %self.config.destination, error = %e, "rtp sender bind failed");
                return false;
            }
        };

        let mut rng = rand::thread_rng();
        self.lanes.clear();
        if self.config.device_mappings.is_empty() {
            self.lanes.push(Lane {
                destination: self.config.destination,
                channel_offset: 0,
                channels: 0, // full width, filled per chunk
                sequence: rng.gen(),
                ssrc: rng.gen(),
            });
        } else {
            for mapping in &self.config.device_mappings {
                self.lanes.push(Lane {
                    destination: mapping.destination,
                    channel_offset: mapping.channel_offset,
                    channels: 2,
                    sequence: rng.gen(),
                    ssrc: rng.gen(),
                });
            }
        }
        self.socket = Some(socket);
        debug!(dest = %self.config.destination, lanes = self.lanes.len(), "rtp sender ready");
        true
    }

    /// Start announcing once the output format is known
    fn start_sap(&mut self, format: &wavecast_packet_core::AudioFormat) {
        if !self.config.announce_sap || self.sap_thread.is_some() {
            return;
        }
        let dest_ip = match self.config.destination.ip() {
            std::net::IpAddr::V4(ip) => ip,
            _ => return,
        };
        let stream = SdpStream {
            name: self.config.session_name.clone(),
            destination: dest_ip,
            port: self.config.destination.port(),
            payload_type: self.config.payload_type,
            encoding: "L16".to_string(),
            clock_rate: format.sample_rate,
            channels: format.channels,
        };
        let running = Arc::clone(&self.sap_running);
        running.store(true, Ordering::Release);
        let msg_id: u16 = rand::thread_rng().gen();
        self.sap_thread = Some(
            std::thread::Builder::new()
                .name("rtp-sap-announce".to_string())
                .spawn(move || {
                    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
                        return;
                    };
                    let origin = Ipv4Addr::new(0, 0, 0, 0);
                    let body = stream.to_sdp(origin, msg_id as u32);
                    let datagram = encode_announcement(origin, msg_id, &body);
                    while running.load(Ordering::Acquire) {
                        let _ = socket.send_to(&datagram, SAP_GROUP);
                        // Poll the stop flag while waiting out the interval.
                        for _ in 0..50 {
                            if !running.load(Ordering::Acquire) {
                                return;
                            }
                            std::thread::sleep(SAP_INTERVAL / 50);
                        }
                    }
                })
                .expect("spawning the SAP announcer cannot fail"),
        );
    }

    /// Queue mixed audio and emit every complete RTP packet
    pub fn send_chunk(&mut self, chunk: &MixedChunk<'_>) -> Result<()> {
        if self.socket.is_none() {
            self.stats.send_errors += 1;
            return Ok(());
        }
        self.start_sap(&chunk.format);

        // L16 is 16-bit regardless of the sink depth; take the top
        // 16 bits of the accumulator samples.
        self.pending
            .extend(chunk.pcm32.iter().map(|&s| (s >> 16) as i16));

        let channels = chunk.format.channels as usize;
        let samples_per_packet = FRAMES_PER_PACKET * channels;
        while self.pending.len() >= samples_per_packet {
            let frame_block: Vec<i16> = self.pending.drain(..samples_per_packet).collect();
            self.emit_packet(&frame_block, chunk.format.channels);
            self.timestamp = self.timestamp.wrapping_add(FRAMES_PER_PACKET as u32);
        }
        Ok(())
    }

    fn emit_packet(&mut self, samples: &[i16], channels: u8) {
        let Some(socket) = &self.socket else { return };
        let payload_type = self.config.payload_type;
        let timestamp = self.timestamp;
        for lane in &mut self.lanes {
            let lane_samples: Vec<i16> = if lane.channels == 0 {
                samples.to_vec()
            } else {
                // Slice the configured stereo pair out of each frame.
                let offset = lane.channel_offset as usize;
                samples
                    .chunks_exact(channels as usize)
                    .flat_map(|frame| {
                        let l = frame.get(offset).copied().unwrap_or(0);
                        let r = frame.get(offset + 1).copied().unwrap_or(0);
                        [l, r]
                    })
                    .collect()
            };
            let mut payload = Vec::with_capacity(lane_samples.len() * 2);
            for s in &lane_samples {
                payload.extend_from_slice(&s.to_be_bytes());
            }
            let header = RtpHeader {
                payload_type,
                marker: false,
                sequence: lane.sequence,
                timestamp,
                ssrc: lane.ssrc,
            };
            lane.sequence = lane.sequence.wrapping_add(1);
            let packet = build_packet(&header, &payload);
            match socket.send_to(&packet, lane.destination) {
                Ok(sent) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += sent as u64;
                }
                Err(e) => {
                    debug!(dest = %lane.destination, error = %e, "rtp send failed");
                    self.stats.send_errors += 1;
                }
            }
        }
    }

    /// Stop SAP and drop the socket
    pub fn close(&mut self) {
        self.sap_running.store(false, Ordering::Release);
        if let Some(handle) = self.sap_thread.take() {
            let _ = handle.join();
        }
        self.socket = None;
        self.pending.clear();
    }

    /// Snapshot counters
    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }
}

impl Drop for RtpSender {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_packet_core::rtp::RtpHeader;
    use wavecast_packet_core::AudioFormat;

    #[test]
    fn packets_carry_big_endian_l16_and_advance_the_clock() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut sender = RtpSender::new(RtpSenderConfig::unicast(receiver.local_addr().unwrap()));
        assert!(sender.setup());

        let format = AudioFormat::stereo_48k_16();
        // Exactly two packets worth of stereo frames.
        let frames = FRAMES_PER_PACKET * 2;
        let pcm32: Vec<i32> = (0..frames * 2).map(|i| (i as i32) << 16).collect();
        let bytes = vec![0u8; frames * 4];
        sender
            .send_chunk(&MixedChunk {
                format,
                frames,
                rtp_timestamp: 0,
                pcm32: &pcm32,
                bytes: &bytes,
            })
            .unwrap();

        let mut buf = [0u8; 2_048];
        let (len1, _) = receiver.recv_from(&mut buf).unwrap();
        let (h1, offset) = RtpHeader::parse(&buf[..len1]).unwrap();
        assert_eq!(h1.payload_type, PAYLOAD_TYPE_L16);
        assert_eq!(len1 - offset, FRAMES_PER_PACKET * 4);
        // First sample is 0, second is 1 in network order.
        assert_eq!(&buf[offset..offset + 4], &[0, 0, 0, 1]);

        let (len2, _) = receiver.recv_from(&mut buf).unwrap();
        let (h2, _) = RtpHeader::parse(&buf[..len2]).unwrap();
        assert_eq!(h2.sequence, h1.sequence.wrapping_add(1));
        assert_eq!(
            h2.timestamp,
            h1.timestamp.wrapping_add(FRAMES_PER_PACKET as u32)
        );
        assert_eq!(h2.ssrc, h1.ssrc);
        sender.close();
    }

    #[test]
    fn multi_device_split_shares_the_timestamp() {
        let rx_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rx_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx_a.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        rx_b.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        let mut config = RtpSenderConfig::unicast(rx_a.local_addr().unwrap());
        config.device_mappings = vec![
            RtpDeviceMapping {
                destination: rx_a.local_addr().unwrap(),
                channel_offset: 0,
            },
            RtpDeviceMapping {
                destination: rx_b.local_addr().unwrap(),
                channel_offset: 2,
            },
        ];
        let mut sender = RtpSender::new(config);
        assert!(sender.setup());

        let format = AudioFormat::new(48_000, wavecast_packet_core::BitDepth::S16, 4).unwrap();
        let frames = FRAMES_PER_PACKET;
        let pcm32 = vec![1i32 << 16; frames * 4];
        let bytes = vec![0u8; frames * 8];
        sender
            .send_chunk(&MixedChunk {
                format,
                frames,
                rtp_timestamp: 0,
                pcm32: &pcm32,
                bytes: &bytes,
            })
            .unwrap();

        let mut buf = [0u8; 2_048];
        let (len_a, _) = rx_a.recv_from(&mut buf).unwrap();
        let (ha, off_a) = RtpHeader::parse(&buf[..len_a]).unwrap();
        assert_eq!(len_a - off_a, FRAMES_PER_PACKET * 4);
        let (len_b, _) = rx_b.recv_from(&mut buf).unwrap();
        let (hb, _) = RtpHeader::parse(&buf[..len_b]).unwrap();
        assert_eq!(ha.timestamp, hb.timestamp);
        assert_ne!(ha.ssrc, hb.ssrc);
        sender.close();
    }
}
