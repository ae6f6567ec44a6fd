//! Scream-UDP sender
//!
//! Mixed audio is re-sliced into the fixed 1152-byte Scream payloads,
//! each datagram prefixed with the 5-byte format header.

use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, warn};
use wavecast_packet_core::scream::{encode_datagram, SCREAM_PAYLOAD_LEN};

use crate::error::Result;
use crate::sender::{MixedChunk, SenderStats};

/// UDP sender speaking the Scream wire format
pub struct ScreamSender {
    destination: SocketAddr,
    socket: Option<UdpSocket>,
    /// Bytes awaiting a full payload
    pending: Vec<u8>,
    stats: SenderStats,
}

impl ScreamSender {
    /// Sender toward a unicast or multicast destination
    pub fn new(destination: SocketAddr) -> Self {
        Self {
            destination,
            socket: None,
            pending: Vec::with_capacity(SCREAM_PAYLOAD_LEN * 2),
            stats: SenderStats::default(),
        }
    }

    /// Bind the local socket
    pub fn setup(&mut self) -> bool {
        match UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => {
                debug!(dest = %self.destination, "scream sender ready");
                self.socket = Some(socket);
                true
            }
            Err(e) => {
                warn!(dest = %self.destination, error = %e, "scream sender bind failed");
                false
            }
        }
    }

    /// Queue a chunk and flush every complete payload
    pub fn send_chunk(&mut self, chunk: &MixedChunk<'_>) -> Result<()> {
        let Some(socket) = &self.socket else {
            self.stats.send_errors += 1;
            return Ok(());
        };
        self.pending.extend_from_slice(chunk.bytes);

        while self.pending.len() >= SCREAM_PAYLOAD_LEN {
            let payload: Vec<u8> = self.pending.drain(..SCREAM_PAYLOAD_LEN).collect();
            let datagram = match encode_datagram(&chunk.format, &payload) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "cannot frame scream datagram");
                    self.stats.send_errors += 1;
                    continue;
                }
            };
            match socket.send_to(&datagram, self.destination) {
                Ok(sent) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += sent as u64;
                }
                Err(e) => {
                    debug!(dest = %self.destination, error = %e, "scream send failed");
                    self.stats.send_errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Drop the socket; unsent partial payload is discarded
    pub fn close(&mut self) {
        self.socket = None;
        self.pending.clear();
    }

    /// Snapshot counters
    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavecast_packet_core::scream::SCREAM_PACKET_LEN;
    use wavecast_packet_core::AudioFormat;

    #[test]
    fn chunks_are_resliced_into_exact_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();

        let mut sender = ScreamSender::new(dest);
        assert!(sender.setup());

        let format = AudioFormat::stereo_48k_16();
        // 1152 frames of stereo 16-bit = 4608 bytes = 4 payloads.
        let bytes = vec![0xABu8; 4_608];
        let pcm32 = vec![0i32; 2_304];
        sender
            .send_chunk(&MixedChunk {
                format,
                frames: 1_152,
                rtp_timestamp: 0,
                pcm32: &pcm32,
                bytes: &bytes,
            })
            .unwrap();

        let mut buf = [0u8; 2_048];
        for _ in 0..4 {
            let (len, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(len, SCREAM_PACKET_LEN);
            assert_eq!(buf[1], 16);
            assert_eq!(buf[2], 2);
        }
        assert_eq!(sender.stats().packets_sent, 4);
        assert_eq!(sender.stats().bytes_sent, 4 * SCREAM_PACKET_LEN as u64);
    }

    #[test]
    fn partial_payloads_wait_for_more_audio() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap();
        let mut sender = ScreamSender::new(dest);
        assert!(sender.setup());

        let format = AudioFormat::stereo_48k_16();
        let bytes = vec![0u8; 1_000];
        let pcm32 = vec![0i32; 500];
        sender
            .send_chunk(&MixedChunk {
                format,
                frames: 250,
                rtp_timestamp: 0,
                pcm32: &pcm32,
                bytes: &bytes,
            })
            .unwrap();
        assert_eq!(sender.stats().packets_sent, 0);
        // The next chunk completes a payload.
        sender
            .send_chunk(&MixedChunk {
                format,
                frames: 250,
                rtp_timestamp: 250,
                pcm32: &pcm32,
                bytes: &bytes,
            })
            .unwrap();
        assert_eq!(sender.stats().packets_sent, 1);
    }
}
