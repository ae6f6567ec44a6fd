//! Scream wire format
//!
//! Scream datagrams are a fixed 5-byte header followed by 1152 bytes of
//! interleaved PCM:
//!
//! ```text
//! [rate_code, bit_depth, channels, chlayout1, chlayout2] + payload
//! ```
//!
//! `rate_code` encodes the sample rate with bit 7 selecting the
//! 44.1 kHz base and the low 7 bits carrying the multiplier. This
//! module is bit-exact with the reference senders; do not change the
//! layout.

use bytes::{Bytes, BytesMut};

use crate::error::{PacketError, Result};
use crate::format::{AudioFormat, BitDepth};

/// Length of the Scream header in bytes
pub const SCREAM_HEADER_LEN: usize = 5;

/// Fixed PCM payload length per datagram
pub const SCREAM_PAYLOAD_LEN: usize = 1152;

/// Total datagram length
pub const SCREAM_PACKET_LEN: usize = SCREAM_HEADER_LEN + SCREAM_PAYLOAD_LEN;

/// Encode a format into the 5-byte header
pub fn encode_header(format: &AudioFormat) -> Result<[u8; SCREAM_HEADER_LEN]> {
    Ok([
        format.scream_rate_code()?,
        format.bit_depth.bits(),
        format.channels,
        format.chlayout1,
        format.chlayout2,
    ])
}

/// Decode a 5-byte header into a format
pub fn decode_header(header: &[u8]) -> Result<AudioFormat> {
    if header.len() < SCREAM_HEADER_LEN {
        return Err(PacketError::MalformedDatagram {
            protocol: "scream",
            reason: format!("header is {} bytes, need {}", header.len(), SCREAM_HEADER_LEN),
        });
    }
    let sample_rate = AudioFormat::rate_from_scream_code(header[0])?;
    let bit_depth = BitDepth::from_bits(header[1])?;
    let channels = header[2];
    if channels == 0 || channels > 8 {
        return Err(PacketError::UnsupportedFormat {
            field: "channels",
            value: channels as u32,
        });
    }
    Ok(AudioFormat {
        sample_rate,
        bit_depth,
        channels,
        chlayout1: header[3],
        chlayout2: header[4],
    })
}

/// Build a complete datagram from a format and exactly one payload's
/// worth of PCM
pub fn encode_datagram(format: &AudioFormat, payload: &[u8]) -> Result<Bytes> {
    if payload.len() != SCREAM_PAYLOAD_LEN {
        return Err(PacketError::MalformedDatagram {
            protocol: "scream",
            reason: format!(
                "payload is {} bytes, scream datagrams carry exactly {}",
                payload.len(),
                SCREAM_PAYLOAD_LEN
            ),
        });
    }
    let mut buf = BytesMut::with_capacity(SCREAM_PACKET_LEN);
    buf.extend_from_slice(&encode_header(format)?);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Split a received datagram into format and payload
pub fn decode_datagram(datagram: &[u8]) -> Result<(AudioFormat, Bytes)> {
    if datagram.len() <= SCREAM_HEADER_LEN {
        return Err(PacketError::MalformedDatagram {
            protocol: "scream",
            reason: format!("datagram is {} bytes", datagram.len()),
        });
    }
    let format = decode_header(&datagram[..SCREAM_HEADER_LEN])?;
    Ok((format, Bytes::copy_from_slice(&datagram[SCREAM_HEADER_LEN..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let fmt = AudioFormat {
            sample_rate: 96_000,
            bit_depth: BitDepth::S24,
            channels: 6,
            chlayout1: 0x3f,
            chlayout2: 0x00,
        };
        let hdr = encode_header(&fmt).unwrap();
        assert_eq!(hdr, [0x02, 24, 6, 0x3f, 0x00]);
        assert_eq!(decode_header(&hdr).unwrap(), fmt);
    }

    #[test]
    fn fourty_four_one_sets_the_base_bit() {
        let fmt = AudioFormat::new(44_100, BitDepth::S16, 2).unwrap();
        assert_eq!(encode_header(&fmt).unwrap()[0], 0x81);
    }

    #[test]
    fn datagram_length_is_exact() {
        let fmt = AudioFormat::stereo_48k_16();
        let dg = encode_datagram(&fmt, &[0u8; SCREAM_PAYLOAD_LEN]).unwrap();
        assert_eq!(dg.len(), SCREAM_PACKET_LEN);
        assert!(encode_datagram(&fmt, &[0u8; 100]).is_err());
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(decode_datagram(&[1, 16, 2, 3]).is_err());
    }

    #[test]
    fn decode_rejects_zero_multiplier() {
        assert!(decode_header(&[0x00, 16, 2, 0, 0]).is_err());
        assert!(decode_header(&[0x80, 16, 2, 0, 0]).is_err());
    }
}
