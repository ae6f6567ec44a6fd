//! DC blocking and dither
//!
//! The DC filter is a first-order high-pass built from the biquad
//! crate, one state per channel. The dither stage adds TPDF noise
//! scaled to the sink's output LSB with optional error-feedback noise
//! shaping, so the mixer's later truncation realizes a properly
//! dithered rounding.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use wavecast_packet_core::BitDepth;

use crate::error::{DspError, Result};

/// High-pass DC blocker
pub struct DcFilter {
    channels: u8,
    filters: Vec<DirectForm2Transposed<f32>>,
}

impl DcFilter {
    /// Build for a rate/channel pair with the given cutoff
    pub fn new(sample_rate: u32, channels: u8, cutoff_hz: f32) -> Result<Self> {
        let coeffs = Coefficients::<f32>::from_params(
            Type::HighPass,
            (sample_rate as f32).hz(),
            cutoff_hz.hz(),
            Q_BUTTERWORTH_F32,
        )
        .map_err(|_| DspError::InvalidParameter {
            name: "dc_filter_cutoff_hz",
            value: cutoff_hz as f64,
        })?;
        Ok(Self {
            channels,
            filters: (0..channels)
                .map(|_| DirectForm2Transposed::<f32>::new(coeffs))
                .collect(),
        })
    }

    /// Run over interleaved samples in place
    pub fn process(&mut self, samples: &mut [f32]) {
        let channels = self.channels as usize;
        for frame in samples.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = self.filters[ch].run(*sample);
            }
        }
    }
}

/// TPDF dither with error-feedback noise shaping
pub struct Dither {
    rng: SmallRng,
    /// LSB size of the output depth, in normalized units
    lsb: f32,
    /// Noise shaping feedback factor, 0 disables shaping
    shaping: f32,
    /// Per-channel quantization error feedback
    error: Vec<f32>,
    channels: u8,
}

impl Dither {
    /// Dither for a target output depth; `None` when the output is
    /// full 32-bit and dithering is unnecessary
    pub fn new(output_depth: BitDepth, channels: u8, shaping: f32) -> Option<Self> {
        if output_depth == BitDepth::S32 {
            return None;
        }
        let bits = output_depth.bits() as i32;
        Some(Self {
            rng: SmallRng::from_entropy(),
            lsb: (2.0f32).powi(1 - bits),
            shaping: shaping.clamp(0.0, 1.0),
            error: vec![0.0; channels as usize],
            channels,
        })
    }

    /// Add shaped TPDF noise ahead of the downstream truncation
    pub fn process(&mut self, samples: &mut [f32]) {
        let channels = self.channels as usize;
        for frame in samples.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                // Two independent uniform draws make triangular noise.
                let noise =
                    (self.rng.gen::<f32>() - self.rng.gen::<f32>()) * self.lsb;
                let shaped = *sample + noise - self.shaping * self.error[ch];
                // Track the error the output quantizer will introduce.
                let quantized = (shaped / self.lsb).round() * self.lsb;
                self.error[ch] = quantized - shaped;
                *sample = shaped;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_filter_removes_offset() {
        let mut filter = DcFilter::new(48_000, 1, 7.0).unwrap();
        let mut samples = vec![0.5f32; 48_000];
        filter.process(&mut samples);
        let tail_mean: f32 = samples[40_000..].iter().sum::<f32>() / 8_000.0;
        assert!(tail_mean.abs() < 0.01, "residual DC {tail_mean}");
    }

    #[test]
    fn dc_filter_passes_audio_band() {
        let mut filter = DcFilter::new(48_000, 1, 7.0).unwrap();
        let mut tone: Vec<f32> = (0..48_000)
            .map(|i| (2.0 * std::f32::consts::PI * 1_000.0 * i as f32 / 48_000.0).sin())
            .collect();
        let in_rms =
            (tone.iter().map(|s| s * s).sum::<f32>() / tone.len() as f32).sqrt();
        filter.process(&mut tone);
        let out_rms =
            (tone[8_000..].iter().map(|s| s * s).sum::<f32>() / 40_000.0).sqrt();
        assert!((out_rms / in_rms) > 0.95);
    }

    #[test]
    fn no_dither_for_full_width_output() {
        assert!(Dither::new(BitDepth::S32, 2, 0.5).is_none());
        assert!(Dither::new(BitDepth::S16, 2, 0.5).is_some());
    }

    #[test]
    fn dither_noise_is_bounded_by_lsbs() {
        let mut dither = Dither::new(BitDepth::S16, 1, 0.0).unwrap();
        let mut samples = vec![0.0f32; 4_096];
        dither.process(&mut samples);
        let lsb = (2.0f32).powi(-15);
        assert!(samples.iter().all(|s| s.abs() <= 2.5 * lsb));
        // And it is actually noise, not silence.
        assert!(samples.iter().any(|s| *s != 0.0));
    }
}
