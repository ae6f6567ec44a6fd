//! Payload decoding
//!
//! Wire payloads are interleaved little-endian PCM at 16, 24 (packed)
//! or 32 bits. Everything downstream works on 32-bit samples at Q31
//! scale, so narrower widths are shifted up on decode.

use wavecast_packet_core::{AudioFormat, BitDepth};

use crate::error::Result;

/// Decode an interleaved little-endian payload into Q31 samples
pub fn decode_payload(payload: &[u8], format: &AudioFormat) -> Result<Vec<i32>> {
    // Ragged payloads are rejected before any samples are produced.
    let frames = format.frames_in(payload.len())?;
    let samples = frames * format.channels as usize;
    let mut out = Vec::with_capacity(samples);

    match format.bit_depth {
        BitDepth::S16 => {
            for pair in payload.chunks_exact(2) {
                let s = i16::from_le_bytes([pair[0], pair[1]]) as i32;
                out.push(s << 16);
            }
        }
        BitDepth::S24 => {
            for triple in payload.chunks_exact(3) {
                // Sign-extend the packed 24-bit value.
                let raw = (triple[0] as i32)
                    | ((triple[1] as i32) << 8)
                    | ((triple[2] as i8 as i32) << 16);
                out.push(raw << 8);
            }
        }
        BitDepth::S32 => {
            for quad in payload.chunks_exact(4) {
                out.push(i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
            }
        }
    }
    Ok(out)
}

/// Convert Q31 samples to normalized f32 for the filter chain
pub fn to_f32(samples: &[i32]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 2_147_483_648.0).collect()
}

/// Convert normalized f32 back to saturated Q31
pub fn from_f32(samples: &[f32]) -> Vec<i32> {
    samples
        .iter()
        .map(|&s| {
            let scaled = (s as f64 * 2_147_483_648.0).round();
            scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s16_shifts_to_q31() {
        let fmt = AudioFormat::new(48_000, BitDepth::S16, 1).unwrap();
        let payload = [0x00, 0x40, 0x00, 0xC0]; // +16384, -16384
        let out = decode_payload(&payload, &fmt).unwrap();
        assert_eq!(out, vec![16384 << 16, -16384 << 16]);
    }

    #[test]
    fn s24_sign_extends() {
        let fmt = AudioFormat::new(48_000, BitDepth::S24, 1).unwrap();
        // 0x7FFFFF (max positive) and 0x800000 (max negative)
        let payload = [0xFF, 0xFF, 0x7F, 0x00, 0x00, 0x80];
        let out = decode_payload(&payload, &fmt).unwrap();
        assert_eq!(out[0], 0x7FFFFF << 8);
        assert_eq!(out[1], -0x800000 << 8);
    }

    #[test]
    fn s32_is_passthrough() {
        let fmt = AudioFormat::new(48_000, BitDepth::S32, 1).unwrap();
        let payload = (-123456789i32).to_le_bytes();
        let out = decode_payload(&payload, &fmt).unwrap();
        assert_eq!(out, vec![-123456789]);
    }

    #[test]
    fn ragged_payload_is_rejected() {
        let fmt = AudioFormat::new(48_000, BitDepth::S16, 2).unwrap();
        assert!(decode_payload(&[0u8; 5], &fmt).is_err());
    }

    #[test]
    fn f32_round_trip_is_lossless_enough() {
        let samples = vec![0, 1 << 16, -(1 << 16), i32::MAX, i32::MIN];
        let back = from_f32(&to_f32(&samples));
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 256, "{a} vs {b}");
        }
    }
}
