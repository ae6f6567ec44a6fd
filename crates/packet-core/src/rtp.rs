//! Minimal RTP packetization (RFC 3550)
//!
//! Fixed 12-byte headers, no CSRC list, no extensions. The engine uses
//! dynamic payload types for L16 and Opus payloads; L16 samples are
//! big-endian on the wire while everything inside the engine is
//! little-endian, so the byte-order helpers live here next to the
//! header codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PacketError, Result};

/// RTP protocol version
pub const RTP_VERSION: u8 = 2;

/// Fixed header length without CSRCs or extensions
pub const RTP_HEADER_LEN: usize = 12;

/// Default dynamic payload type for L16 PCM
pub const PAYLOAD_TYPE_L16: u8 = 127;

/// Default dynamic payload type for Opus
pub const PAYLOAD_TYPE_OPUS: u8 = 111;

/// Parsed or to-be-serialized RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Payload type, 0..=127
    pub payload_type: u8,
    /// Marker bit
    pub marker: bool,
    /// Sequence number, increments per packet
    pub sequence: u16,
    /// Media clock timestamp of the first sample in the payload
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize into the fixed 12-byte wire form
    pub fn serialize(&self) -> [u8; RTP_HEADER_LEN] {
        let mut hdr = [0u8; RTP_HEADER_LEN];
        hdr[0] = RTP_VERSION << 6;
        hdr[1] = (self.payload_type & 0x7f) | if self.marker { 0x80 } else { 0 };
        hdr[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        hdr[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        hdr[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        hdr
    }

    /// Parse a header, returning it together with the payload offset
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RTP_HEADER_LEN {
            return Err(PacketError::MalformedDatagram {
                protocol: "rtp",
                reason: format!("packet is {} bytes, need {}", data.len(), RTP_HEADER_LEN),
            });
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(PacketError::MalformedDatagram {
                protocol: "rtp",
                reason: format!("version {version}"),
            });
        }
        let csrc_count = (data[0] & 0x0f) as usize;
        let has_extension = data[0] & 0x10 != 0;
        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if data.len() < offset {
            return Err(PacketError::MalformedDatagram {
                protocol: "rtp",
                reason: "truncated CSRC list".to_string(),
            });
        }
        if has_extension {
            if data.len() < offset + 4 {
                return Err(PacketError::MalformedDatagram {
                    protocol: "rtp",
                    reason: "truncated extension header".to_string(),
                });
            }
            let ext_words =
                u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
            if data.len() < offset {
                return Err(PacketError::MalformedDatagram {
                    protocol: "rtp",
                    reason: "truncated extension body".to_string(),
                });
            }
        }
        let header = Self {
            payload_type: data[1] & 0x7f,
            marker: data[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };
        Ok((header, offset))
    }
}

/// Build a full RTP packet from a header and payload
pub fn build_packet(header: &RtpHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
    buf.put_slice(&header.serialize());
    buf.put_slice(payload);
    buf.freeze()
}

/// Swap 16-bit little-endian PCM into network (big-endian) order
pub fn l16_from_le(pcm_le: &[u8]) -> Vec<u8> {
    let mut out = pcm_le.to_vec();
    for pair in out.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    out
}

/// Swap 16-bit network-order PCM into little-endian engine order
pub fn l16_to_le(pcm_be: &[u8]) -> Vec<u8> {
    // The swap is symmetric
    l16_from_le(pcm_be)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = RtpHeader {
            payload_type: PAYLOAD_TYPE_L16,
            marker: true,
            sequence: 0xBEEF,
            timestamp: 0x12345678,
            ssrc: 0xDEADBEEF,
        };
        let wire = hdr.serialize();
        let (parsed, offset) = RtpHeader::parse(&wire).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(offset, RTP_HEADER_LEN);
    }

    #[test]
    fn parse_skips_csrcs_and_extensions() {
        let hdr = RtpHeader {
            payload_type: 96,
            marker: false,
            sequence: 1,
            timestamp: 2,
            ssrc: 3,
        };
        let mut wire = hdr.serialize().to_vec();
        // two CSRCs and a one-word extension
        wire[0] |= 0x12;
        wire.extend_from_slice(&[0u8; 8]);
        wire.extend_from_slice(&[0, 0, 0, 1]);
        wire.extend_from_slice(&[0u8; 4]);
        wire.extend_from_slice(&[0xAA, 0xBB]);
        let (parsed, offset) = RtpHeader::parse(&wire).unwrap();
        assert_eq!(parsed.ssrc, 3);
        assert_eq!(&wire[offset..], &[0xAA, 0xBB]);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut wire = [0u8; RTP_HEADER_LEN];
        wire[0] = 0x40; // version 1
        assert!(RtpHeader::parse(&wire).is_err());
    }

    #[test]
    fn l16_swap_round_trips() {
        let le = vec![0x01, 0x02, 0x03, 0x04];
        let be = l16_from_le(&le);
        assert_eq!(be, vec![0x02, 0x01, 0x04, 0x03]);
        assert_eq!(l16_to_le(&be), le);
    }
}
