//! 18-band equalizer
//!
//! Fixed geometrically spaced peaking filters from 30 Hz to 16 kHz.
//! Band gains are linear in [0, 2] with 1.0 as unity; unity bands cost
//! nothing because their filters are never instantiated. Optional
//! normalization rescales the output so a flat-spectrum unit input
//! keeps unit level regardless of the curve.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};

use crate::config::EQ_BANDS;
use crate::error::{DspError, Result};

/// Center frequencies of the 18 bands, Hz
pub const EQ_CENTERS_HZ: [f32; EQ_BANDS] = [
    30.0, 43.0, 63.0, 91.0, 132.0, 190.0, 275.0, 399.0, 577.0, 834.0, 1_207.0, 1_747.0, 2_528.0,
    3_658.0, 5_294.0, 7_660.0, 11_084.0, 16_000.0,
];

/// Q shared by all bands; chosen so adjacent bands cross near -3 dB
const BAND_Q: f32 = 1.5;

/// Smallest representable band gain; zero maps here (about -80 dB)
const MIN_GAIN: f32 = 1e-4;

struct BandFilters {
    /// One filter state per channel
    per_channel: Vec<DirectForm2Transposed<f32>>,
}

/// The equalizer for one processing chain
pub struct EighteenBandEq {
    sample_rate: u32,
    channels: u8,
    gains: [f32; EQ_BANDS],
    normalization: bool,
    norm_scalar: f32,
    bands: Vec<BandFilters>,
}

impl EighteenBandEq {
    /// Build an equalizer for a rate/channel pair with the given curve
    pub fn new(
        sample_rate: u32,
        channels: u8,
        gains: [f32; EQ_BANDS],
        normalization: bool,
    ) -> Result<Self> {
        let mut eq = Self {
            sample_rate,
            channels,
            gains,
            normalization,
            norm_scalar: 1.0,
            bands: Vec::new(),
        };
        eq.rebuild()?;
        Ok(eq)
    }

    /// Replace the curve, rebuilding filter state
    pub fn set_gains(&mut self, gains: [f32; EQ_BANDS], normalization: bool) -> Result<()> {
        self.gains = gains;
        self.normalization = normalization;
        self.rebuild()
    }

    /// Whether any band deviates from unity
    pub fn is_active(&self) -> bool {
        !self.bands.is_empty()
    }

    /// Compensation scalar currently applied (1.0 unless normalizing)
    pub fn normalization_scalar(&self) -> f32 {
        self.norm_scalar
    }

    fn rebuild(&mut self) -> Result<()> {
        self.bands.clear();
        let nyquist_guard = self.sample_rate as f32 * 0.45;
        for (band, &gain) in self.gains.iter().enumerate() {
            if (gain - 1.0).abs() < 1e-6 {
                continue;
            }
            if !(0.0..=2.0).contains(&gain) {
                return Err(DspError::InvalidParameter {
                    name: "eq_gain",
                    value: gain as f64,
                });
            }
            let center = EQ_CENTERS_HZ[band];
            if center >= nyquist_guard {
                continue;
            }
            let db = 20.0 * gain.max(MIN_GAIN).log10();
            let coeffs = Coefficients::<f32>::from_params(
                Type::PeakingEQ(db),
                (self.sample_rate as f32).hz(),
                center.hz(),
                BAND_Q,
            )
            .map_err(|_| DspError::InvalidParameter {
                name: "eq_band_center",
                value: center as f64,
            })?;
            self.bands.push(BandFilters {
                per_channel: (0..self.channels)
                    .map(|_| DirectForm2Transposed::<f32>::new(coeffs))
                    .collect(),
            });
        }

        self.norm_scalar = if self.normalization && !self.bands.is_empty() {
            let mean = self.mean_cascade_magnitude();
            if mean > 1e-6 {
                1.0 / mean
            } else {
                1.0
            }
        } else {
            1.0
        };
        Ok(())
    }

    /// Mean magnitude of the filter cascade across the band centers,
    /// used as the unit-input level estimate for normalization
    fn mean_cascade_magnitude(&self) -> f32 {
        let nyquist_guard = self.sample_rate as f32 * 0.45;
        let centers: Vec<f32> = EQ_CENTERS_HZ
            .iter()
            .copied()
            .filter(|&c| c < nyquist_guard)
            .collect();
        if centers.is_empty() {
            return 1.0;
        }
        let mut sum = 0.0f64;
        for &freq in &centers {
            let mut mag = 1.0f64;
            for (band, &gain) in self.gains.iter().enumerate() {
                if (gain - 1.0).abs() < 1e-6 {
                    continue;
                }
                let center = EQ_CENTERS_HZ[band];
                if center >= nyquist_guard {
                    continue;
                }
                let db = 20.0 * gain.max(MIN_GAIN).log10();
                if let Ok(coeffs) = Coefficients::<f32>::from_params(
                    Type::PeakingEQ(db),
                    (self.sample_rate as f32).hz(),
                    center.hz(),
                    BAND_Q,
                ) {
                    mag *= magnitude_at(&coeffs, freq, self.sample_rate);
                }
            }
            sum += mag;
        }
        (sum / centers.len() as f64) as f32
    }

    /// Run the cascade over interleaved samples in place
    pub fn process(&mut self, samples: &mut [f32]) {
        let channels = self.channels as usize;
        for band in &mut self.bands {
            for frame in samples.chunks_exact_mut(channels) {
                for (ch, sample) in frame.iter_mut().enumerate() {
                    *sample = band.per_channel[ch].run(*sample);
                }
            }
        }
        if self.norm_scalar != 1.0 {
            for sample in samples.iter_mut() {
                *sample *= self.norm_scalar;
            }
        }
    }
}

/// |H(e^jw)| of a biquad at `freq`
fn magnitude_at(coeffs: &Coefficients<f32>, freq: f32, sample_rate: u32) -> f64 {
    let w = 2.0 * std::f64::consts::PI * freq as f64 / sample_rate as f64;
    let (b0, b1, b2) = (coeffs.b0 as f64, coeffs.b1 as f64, coeffs.b2 as f64);
    let (a1, a2) = (coeffs.a1 as f64, coeffs.a2 as f64);
    let (cos_w, sin_w) = (w.cos(), w.sin());
    let (cos_2w, sin_2w) = ((2.0 * w).cos(), (2.0 * w).sin());

    let num_re = b0 + b1 * cos_w + b2 * cos_2w;
    let num_im = -(b1 * sin_w + b2 * sin_2w);
    let den_re = 1.0 + a1 * cos_w + a2 * cos_2w;
    let den_im = -(a1 * sin_w + a2 * sin_2w);

    let num = (num_re * num_re + num_im * num_im).sqrt();
    let den = (den_re * den_re + den_im * den_im).sqrt();
    if den < 1e-12 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn flat_curve_instantiates_no_filters() {
        let eq = EighteenBandEq::new(48_000, 2, [1.0; EQ_BANDS], false).unwrap();
        assert!(!eq.is_active());
        assert_eq!(eq.normalization_scalar(), 1.0);
    }

    #[test]
    fn zero_gain_band_attenuates_its_center() {
        let mut gains = [1.0f32; EQ_BANDS];
        gains[10] = 0.0; // 1207 Hz
        let mut eq = EighteenBandEq::new(48_000, 1, gains, false).unwrap();

        let mut tone = sine(EQ_CENTERS_HZ[10], 48_000, 48_000);
        let input_rms = rms(&tone);
        eq.process(&mut tone);
        // Discard the transient before measuring.
        let settled = &tone[8_000..];
        assert!(
            rms(settled) < input_rms * 0.08,
            "band not attenuated: {} vs {}",
            rms(settled),
            input_rms
        );
    }

    #[test]
    fn boost_raises_level_and_normalization_compensates() {
        let mut gains = [1.0f32; EQ_BANDS];
        for g in gains.iter_mut() {
            *g = 2.0;
        }
        let mut boosted = EighteenBandEq::new(48_000, 1, gains, false).unwrap();
        let mut normalized = EighteenBandEq::new(48_000, 1, gains, true).unwrap();
        assert!(normalized.normalization_scalar() < 1.0);

        let tone = sine(1_000.0, 48_000, 24_000);
        let mut a = tone.clone();
        let mut b = tone.clone();
        boosted.process(&mut a);
        normalized.process(&mut b);
        assert!(rms(&a[4_000..]) > rms(&tone[4_000..]) * 1.3);
        let norm_rms = rms(&b[4_000..]);
        let input_rms = rms(&tone[4_000..]);
        assert!(
            (norm_rms / input_rms) < 1.3 && (norm_rms / input_rms) > 0.5,
            "normalized ratio {}",
            norm_rms / input_rms
        );
    }

    #[test]
    fn out_of_range_gain_is_rejected() {
        let mut gains = [1.0f32; EQ_BANDS];
        gains[0] = 2.5;
        assert!(EighteenBandEq::new(48_000, 2, gains, false).is_err());
    }

    #[test]
    fn high_bands_are_skipped_at_low_rates() {
        let mut gains = [1.0f32; EQ_BANDS];
        gains[EQ_BANDS - 1] = 2.0; // 16 kHz band
        let eq = EighteenBandEq::new(16_000, 1, gains, false).unwrap();
        // 16 kHz is beyond the guard at a 16 kHz rate
        assert!(!eq.is_active());
    }
}
