//! MP3 side stream
//!
//! When a sink has MP3 enabled, mixed PCM runs through a LAME encoder
//! owned by the mixer thread; encoded MPEG frames land in a bounded
//! shared queue the control plane drains over HTTP. Overflow drops the
//! oldest frames: a slow consumer costs history, never mixer time.

use std::collections::VecDeque;
use std::mem::MaybeUninit;

use bytes::Bytes;
use mp3lame_encoder::{Builder, InterleavedPcm};
use tracing::{debug, warn};

use crate::error::{MixerError, Result};

/// The encoder half; lives on the mixer thread
pub struct Mp3Encoder {
    encoder: mp3lame_encoder::Encoder,
}

impl Mp3Encoder {
    /// Build an encoder for the sink's output
    pub fn new(sample_rate: u32, channels: u8, bitrate_kbps: u32) -> Result<Self> {
        let mut builder = Builder::new().ok_or(MixerError::Mp3 {
            reason: "lame init failed".to_string(),
        })?;
        builder
            .set_num_channels(channels.min(2))
            .map_err(|e| MixerError::Mp3 {
                reason: format!("channels: {e:?}"),
            })?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| MixerError::Mp3 {
                reason: format!("sample rate: {e:?}"),
            })?;
        builder
            .set_brate(bitrate(bitrate_kbps))
            .map_err(|e| MixerError::Mp3 {
                reason: format!("bitrate: {e:?}"),
            })?;
        builder
            .set_quality(mp3lame_encoder::Quality::Good)
            .map_err(|e| MixerError::Mp3 {
                reason: format!("quality: {e:?}"),
            })?;
        let encoder = builder.build().map_err(|e| MixerError::Mp3 {
            reason: format!("build: {e:?}"),
        })?;
        debug!(sample_rate, channels, bitrate_kbps, "mp3 encoder ready");
        Ok(Self { encoder })
    }

    /// Encode interleaved 16-bit PCM; wider sinks must be folded down
    /// by the caller. Returns the encoded bytes, empty while LAME is
    /// still buffering.
    pub fn encode(&mut self, samples: &[i16]) -> Bytes {
        let max_output = samples.len() * 5 / 4 + 7_200;
        let mut buffer: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); max_output];
        let encoded = match self.encoder.encode(InterleavedPcm(samples), &mut buffer) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = ?e, "mp3 encode failed");
                return Bytes::new();
            }
        };
        let frame: Vec<u8> = buffer[..encoded]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect();
        Bytes::from(frame)
    }
}

/// The queue half; shared between the mixer thread and the control
/// plane
#[derive(Debug)]
pub struct Mp3Queue {
    frames: VecDeque<Bytes>,
    max_frames: usize,
    /// Frames dropped from the head on overflow
    pub dropped_frames: u64,
    /// Frames pushed into the queue
    pub encoded_frames: u64,
}

impl Mp3Queue {
    /// A queue bounded to `max_frames` entries
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_frames,
            dropped_frames: 0,
            encoded_frames: 0,
        }
    }

    /// Enqueue one encoded frame, dropping the oldest when full
    pub fn push(&mut self, frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        if self.frames.len() >= self.max_frames {
            self.frames.pop_front();
            self.dropped_frames += 1;
        }
        self.frames.push_back(frame);
        self.encoded_frames += 1;
    }

    /// Drain every queued frame into one contiguous blob
    pub fn take_data(&mut self) -> Bytes {
        let total: usize = self.frames.iter().map(|f| f.len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in self.frames.drain(..) {
            out.extend_from_slice(&frame);
        }
        Bytes::from(out)
    }

    /// Queued frame count
    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Map a kbps figure onto the nearest LAME bitrate constant
fn bitrate(kbps: u32) -> mp3lame_encoder::Bitrate {
    use mp3lame_encoder::Bitrate;
    match kbps {
        0..=96 => Bitrate::Kbps96,
        97..=112 => Bitrate::Kbps112,
        113..=128 => Bitrate::Kbps128,
        129..=160 => Bitrate::Kbps160,
        161..=192 => Bitrate::Kbps192,
        193..=224 => Bitrate::Kbps224,
        225..=256 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_becomes_mpeg_frames() {
        let mut encoder = Mp3Encoder::new(48_000, 2, 192).unwrap();
        let mut queue = Mp3Queue::new(64);
        // LAME buffers internally, so several pushes are needed before
        // frames appear.
        let tone: Vec<i16> = (0..4_608)
            .map(|i| ((i as f32 * 0.05).sin() * 8_000.0) as i16)
            .collect();
        for _ in 0..10 {
            queue.push(encoder.encode(&tone));
        }
        assert!(queue.encoded_frames > 0);
        let data = queue.take_data();
        assert!(!data.is_empty());
        // MPEG frame sync: eleven set bits.
        assert_eq!(data[0], 0xFF);
        assert_eq!(data[1] & 0xE0, 0xE0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut encoder = Mp3Encoder::new(48_000, 2, 128).unwrap();
        let mut queue = Mp3Queue::new(2);
        let tone: Vec<i16> = vec![1_000; 4_608];
        for _ in 0..40 {
            queue.push(encoder.encode(&tone));
        }
        assert!(queue.len() <= 2);
        assert!(queue.dropped_frames > 0);
    }

    #[test]
    fn empty_frames_are_not_queued() {
        let mut queue = Mp3Queue::new(4);
        queue.push(Bytes::new());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.encoded_frames, 0);
    }
}
