//! Raw-Scream UDP receiver
//!
//! One datagram is one packet: a 5-byte format header and 1152 bytes
//! of PCM. The source tag is the sender's IP address.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use wavecast_packet_core::scream::decode_datagram;
use wavecast_packet_core::{SourceTag, TaggedPacket};
use wavecast_timeshift_core::TimeshiftManager;

use crate::error::{Result, TransportError};
use crate::receiver::{ReceiverHandle, SharedReceiverStats};

/// Socket poll timeout; bounds shutdown latency
const POLL: Duration = Duration::from_millis(50);

/// Start a raw-Scream receiver on a UDP port
pub fn spawn(port: u16, manager: Arc<TimeshiftManager>) -> Result<ReceiverHandle> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|source| TransportError::Socket {
        endpoint: format!("0.0.0.0:{port}"),
        source,
    })?;
    socket
        .set_read_timeout(Some(POLL))
        .map_err(|source| TransportError::Socket {
            endpoint: format!("0.0.0.0:{port}"),
            source,
        })?;

    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(SharedReceiverStats::default());
    let thread_running = Arc::clone(&running);
    let thread_stats = Arc::clone(&stats);

    let join = std::thread::Builder::new()
        .name(format!("scream-recv-{port}"))
        .spawn(move || {
            info!(port, "scream receiver listening");
            let mut buf = [0u8; 2_048];
            while thread_running.load(Ordering::Acquire) {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(_) => continue, // timeout or transient error
                };
                match decode_datagram(&buf[..len]) {
                    Ok((format, payload)) => {
                        thread_stats
                            .packets_received
                            .fetch_add(1, Ordering::Relaxed);
                        thread_stats
                            .bytes_received
                            .fetch_add(payload.len() as u64, Ordering::Relaxed);
                        manager.add_packet(TaggedPacket::new(
                            SourceTag::new(from.ip().to_string()),
                            format,
                            None,
                            payload,
                        ));
                    }
                    Err(e) => {
                        debug!(from = %from, error = %e, "malformed scream datagram");
                        thread_stats
                            .malformed_packets
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
        .expect("spawning a receiver thread cannot fail");

    Ok(ReceiverHandle::new(running, join, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_packet_core::scream::{encode_datagram, SCREAM_PAYLOAD_LEN};
    use wavecast_packet_core::AudioFormat;
    use wavecast_timeshift_core::TimeshiftConfig;

    #[test]
    fn datagrams_become_tagged_packets() {
        let manager = Arc::new(TimeshiftManager::start(TimeshiftConfig::default()));
        // Bind an ephemeral port by probing with a scratch socket.
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let receiver = spawn(port, Arc::clone(&manager)).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let format = AudioFormat::stereo_48k_16();
        let datagram = encode_datagram(&format, &[7u8; SCREAM_PAYLOAD_LEN]).unwrap();
        for _ in 0..3 {
            sender.send_to(&datagram, ("127.0.0.1", port)).unwrap();
        }
        // Garbage must be counted, not forwarded.
        sender.send_to(&[1, 2, 3], ("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while receiver.stats().packets_received < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let stats = receiver.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.malformed_packets, 1);
        assert_eq!(stats.bytes_received, 3 * SCREAM_PAYLOAD_LEN as u64);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while manager.stats().total_packets_added < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(manager.stats().streams.contains_key("127.0.0.1"));
        receiver.stop();
        manager.shutdown();
    }
}
