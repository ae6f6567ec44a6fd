//! Per-process Scream receiver
//!
//! Per-process senders prefix each datagram's payload with a fixed
//! NUL-padded process-name field so one machine can feed many
//! independent streams:
//!
//! ```text
//! [5-byte scream header][30-byte process name, NUL padded][PCM]
//! ```
//!
//! The source tag is `"<sender_ip>:<process_name>"`.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};
use wavecast_packet_core::scream::{decode_header, SCREAM_HEADER_LEN};
use wavecast_packet_core::{SourceTag, TaggedPacket};
use wavecast_timeshift_core::TimeshiftManager;

use crate::error::{Result, TransportError};
use crate::receiver::{ReceiverHandle, SharedReceiverStats};

/// Length of the NUL-padded process-name field
pub const PROCESS_TAG_LEN: usize = 30;

const POLL: Duration = Duration::from_millis(50);

/// Start a per-process Scream receiver on a UDP port
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
        .name(format!("pp-scream-recv-{port}"))
        .spawn(move || {
            info!(port, "per-process scream receiver listening");
            let mut buf = [0u8; 2_048];
            while thread_running.load(Ordering::Acquire) {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let min_len = SCREAM_HEADER_LEN + PROCESS_TAG_LEN;
                if len <= min_len {
                    thread_stats
                        .malformed_packets
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let format = match decode_header(&buf[..SCREAM_HEADER_LEN]) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(from = %from, error = %e, "bad per-process header");
                        thread_stats
                            .malformed_packets
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                let name_field = &buf[SCREAM_HEADER_LEN..min_len];
                let name_end = name_field
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(PROCESS_TAG_LEN);
                let process = String::from_utf8_lossy(&name_field[..name_end]);
                let payload = Bytes::copy_from_slice(&buf[min_len..len]);

                thread_stats
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                thread_stats
                    .bytes_received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                manager.add_packet(TaggedPacket::new(
                    SourceTag::new(format!("{}:{}", from.ip(), process.trim())),
                    format,
                    None,
                    payload,
                ));
            }
        })
        .expect("spawning a receiver thread cannot fail");

    Ok(ReceiverHandle::new(running, join, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_packet_core::scream::encode_header;
    use wavecast_packet_core::AudioFormat;
    use wavecast_timeshift_core::TimeshiftConfig;

    #[test]
    fn tags_combine_ip_and_process_name() {
        let manager = Arc::new(TimeshiftManager::start(TimeshiftConfig::default()));
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let receiver = spawn(port, Arc::clone(&manager)).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let format = AudioFormat::stereo_48k_16();
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&encode_header(&format).unwrap());
        let mut name = [0u8; PROCESS_TAG_LEN];
        name[..7].copy_from_slice(b"firefox");
        datagram.extend_from_slice(&name);
        datagram.extend_from_slice(&[0u8; 1152]);
        sender.send_to(&datagram, ("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while receiver.stats().packets_received < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(receiver.stats().packets_received, 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while manager.stats().total_packets_added < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(manager
            .stats()
            .streams
            .contains_key("127.0.0.1:firefox"));
        receiver.stop();
        manager.shutdown();
    }
}
