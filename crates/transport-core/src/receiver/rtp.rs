//! RTP receiver with SAP discovery
//!
//! L16 payloads over RTP. Because the RTP header does not describe the
//! media format, the receiver starts from a configured default and
//! overrides it per sender when a SAP announcement from that address
//! has been seen. Network-order samples are swapped to the engine's
//! little-endian convention on the way in.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use wavecast_packet_core::rtp::{l16_to_le, RtpHeader};
use wavecast_packet_core::sap::{decode_announcement, SdpStream};
use wavecast_packet_core::{AudioFormat, BitDepth, SourceTag, TaggedPacket};
use wavecast_timeshift_core::TimeshiftManager;

use crate::error::{Result, TransportError};
use crate::receiver::{ReceiverHandle, SharedReceiverStats};

const POLL: Duration = Duration::from_millis(50);

/// Well-known SAP group and port
const SAP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 2, 127, 254);
const SAP_PORT: u16 = 9_875;

/// RTP receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpReceiverConfig {
    /// UDP port to listen on
    pub port: u16,
    /// Format assumed for senders with no SAP announcement
    pub default_format: AudioFormat,
    /// Listen for SAP announcements to learn per-sender formats
    pub listen_sap: bool,
}

impl Default for RtpReceiverConfig {
    fn default() -> Self {
        Self {
            port: 40_000,
            default_format: AudioFormat::stereo_48k_16(),
            listen_sap: true,
        }
    }
}

/// Start an RTP receiver (and its SAP listener when enabled)
pub fn spawn(config: RtpReceiverConfig, manager: Arc<TimeshiftManager>) -> Result<ReceiverHandle> {
    let socket =
        UdpSocket::bind(("0.0.0.0", config.port)).map_err(|source| TransportError::Socket {
            endpoint: format!("0.0.0.0:{}", config.port),
            source,
        })?;
    socket
        .set_read_timeout(Some(POLL))
        .map_err(|source| TransportError::Socket {
            endpoint: format!("0.0.0.0:{}", config.port),
            source,
        })?;

    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(SharedReceiverStats::default());
    let announced: Arc<RwLock<HashMap<IpAddr, SdpStream>>> = Arc::new(RwLock::new(HashMap::new()));

    if config.listen_sap {
        spawn_sap_listener(Arc::clone(&running), Arc::clone(&announced));
    }

    let thread_running = Arc::clone(&running);
    let thread_stats = Arc::clone(&stats);
    let default_format = config.default_format;
    let port = config.port;

    let join = std::thread::Builder::new()
        .name(format!("rtp-recv-{port}"))
        .spawn(move || {
            info!(port, "rtp receiver listening");
            let mut buf = [0u8; 4_096];
            while thread_running.load(Ordering::Acquire) {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let (header, offset) = match RtpHeader::parse(&buf[..len]) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(from = %from, error = %e, "bad rtp packet");
                        thread_stats
                            .malformed_packets
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                let format = announced
                    .read()
                    .get(&from.ip())
                    .map(|sdp| sdp_format(sdp, &default_format))
                    .unwrap_or(default_format);

                // L16 is network order; the engine stores little-endian.
                let payload = if format.bit_depth == BitDepth::S16 {
                    Bytes::from(l16_to_le(&buf[offset..len]))
                } else {
                    Bytes::copy_from_slice(&buf[offset..len])
                };
                if payload.is_empty() || format.frames_in(payload.len()).is_err() {
                    thread_stats
                        .malformed_packets
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                thread_stats
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                thread_stats
                    .bytes_received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                manager.add_packet(TaggedPacket::new(
                    SourceTag::new(from.ip().to_string()),
                    format,
                    Some(header.timestamp),
                    payload,
                ));
            }
        })
        .expect("spawning a receiver thread cannot fail");

    Ok(ReceiverHandle::new(running, join, stats))
}

/// Derive a packet format from an SDP announcement, keeping the
/// configured default where the announcement is silent
fn sdp_format(sdp: &SdpStream, default: &AudioFormat) -> AudioFormat {
    let mut format = *default;
    if sdp.encoding.eq_ignore_ascii_case("L16") {
        format.sample_rate = sdp.clock_rate;
        format.channels = sdp.channels.clamp(1, 8);
        format.bit_depth = BitDepth::S16;
    }
    format
}

fn spawn_sap_listener(
    running: Arc<AtomicBool>,
    announced: Arc<RwLock<HashMap<IpAddr, SdpStream>>>,
) {
    let result = std::thread::Builder::new()
        .name("sap-listen".to_string())
        .spawn(move || {
            let socket = match open_sap_socket() {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "sap listener unavailable");
                    return;
                }
            };
            let mut buf = [0u8; 4_096];
            while running.load(Ordering::Acquire) {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if let Ok((_origin, body)) = decode_announcement(&buf[..len]) {
                    if let Ok(stream) = SdpStream::from_sdp(&body) {
                        debug!(from = %from, name = %stream.name, "sap announcement");
                        announced.write().insert(from.ip(), stream);
                    }
                }
            }
        });
    if let Err(e) = result {
        warn!(error = %e, "sap listener thread failed to start");
    }
}

fn open_sap_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, SAP_PORT)).into())?;
    socket.join_multicast_v4(&SAP_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_read_timeout(Some(POLL))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_packet_core::rtp::{build_packet, PAYLOAD_TYPE_L16};
    use wavecast_timeshift_core::TimeshiftConfig;

    #[test]
    fn rtp_payloads_are_byte_swapped_and_tagged() {
        let manager = Arc::new(TimeshiftManager::start(TimeshiftConfig::default()));
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let receiver = spawn(
            RtpReceiverConfig {
                port,
                default_format: AudioFormat::stereo_48k_16(),
                listen_sap: false,
            },
            Arc::clone(&manager),
        )
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let header = RtpHeader {
            payload_type: PAYLOAD_TYPE_L16,
            marker: false,
            sequence: 1,
            timestamp: 4_800,
            ssrc: 0x42,
        };
        // 2 stereo frames, big-endian on the wire.
        let payload = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        let packet = build_packet(&header, &payload);
        sender.send_to(&packet, ("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while receiver.stats().packets_received < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(receiver.stats().packets_received, 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while manager.stats().total_packets_added < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let export = manager.export_lookback(&SourceTag::new("127.0.0.1"), 5.0);
        // Little-endian now: each wire pair is swapped.
        assert_eq!(export.pcm, vec![0x34, 0x12, 0x78, 0x56, 0xBC, 0x9A, 0xF0, 0xDE]);
        receiver.stop();
        manager.shutdown();
    }

    #[test]
    fn sdp_override_changes_the_assumed_format() {
        let default = AudioFormat::stereo_48k_16();
        let sdp = SdpStream {
            name: "x".into(),
            destination: Ipv4Addr::new(239, 0, 0, 1),
            port: 5_004,
            payload_type: 127,
            encoding: "L16".into(),
            clock_rate: 44_100,
            channels: 1,
        };
        let format = sdp_format(&sdp, &default);
        assert_eq!(format.sample_rate, 44_100);
        assert_eq!(format.channels, 1);
    }
}
