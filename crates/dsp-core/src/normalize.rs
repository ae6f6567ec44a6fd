//! Volume normalization
//!
//! A slow RMS estimator with separate attack and decay smoothing
//! drives a bounded makeup gain toward the configured target level,
//! with a soft clip at the knee so transient overshoot never hard
//! clips.

use crate::config::DspTuning;

/// Level above which the soft clipper starts bending
const KNEE: f32 = 0.85;

/// Slow RMS-tracking gain stage
pub struct VolumeNormalizer {
    /// Smoothed mean-square estimate
    mean_square: f32,
    /// Currently applied gain
    gain: f32,
    /// Per-chunk attack coefficient
    attack_coeff: f32,
    /// Per-chunk decay coefficient
    decay_coeff: f32,
    /// Target RMS level
    target_rms: f32,
    /// Gain ceiling
    max_gain: f32,
}

impl VolumeNormalizer {
    /// Build from tuning, for chunks of `chunk_ms` milliseconds
    pub fn new(tuning: &DspTuning, chunk_ms: f32) -> Self {
        Self {
            mean_square: 0.0,
            gain: 1.0,
            attack_coeff: coeff(tuning.normalization_attack_ms, chunk_ms),
            decay_coeff: coeff(tuning.normalization_decay_ms, chunk_ms),
            target_rms: tuning.normalization_target_rms,
            max_gain: tuning.normalization_max_gain,
        }
    }

    /// Process one block in place
    pub fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let block_ms = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        // Rising levels track with the fast attack constant, falling
        // levels with the slow decay constant.
        let c = if block_ms > self.mean_square {
            self.attack_coeff
        } else {
            self.decay_coeff
        };
        self.mean_square += (block_ms - self.mean_square) * c;

        let rms = self.mean_square.sqrt();
        let desired = if rms > 1e-5 {
            (self.target_rms / rms).min(self.max_gain)
        } else {
            // Hold gain through silence rather than pumping up noise.
            self.gain
        };
        // Gain itself is slewed at the decay constant to stay inaudible.
        self.gain += (desired - self.gain) * self.decay_coeff;

        for sample in samples.iter_mut() {
            *sample = soft_clip(*sample * self.gain);
        }
    }

    /// Currently applied gain
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Forget level history
    pub fn reset(&mut self) {
        self.mean_square = 0.0;
        self.gain = 1.0;
    }
}

/// One-pole smoothing coefficient for a time constant over blocks of
/// `block_ms`
fn coeff(time_constant_ms: f32, block_ms: f32) -> f32 {
    if time_constant_ms <= 0.0 {
        return 1.0;
    }
    1.0 - (-block_ms / time_constant_ms).exp()
}

/// Soft clip with a linear region below the knee
fn soft_clip(x: f32) -> f32 {
    let a = x.abs();
    if a <= KNEE {
        return x;
    }
    let over = a - KNEE;
    let span = 1.0 - KNEE;
    let bent = KNEE + span * (over / span).tanh();
    bent.copysign(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> DspTuning {
        DspTuning::default()
    }

    #[test]
    fn quiet_signal_is_brought_up() {
        let mut norm = VolumeNormalizer::new(&tuning(), 10.0);
        let quiet: Vec<f32> = (0..480)
            .map(|i| (i as f32 * 0.13).sin() * 0.01)
            .collect();
        for _ in 0..400 {
            let mut block = quiet.clone();
            norm.process(&mut block);
        }
        assert!(norm.gain() > 2.0, "gain {}", norm.gain());
    }

    #[test]
    fn gain_is_bounded() {
        let mut norm = VolumeNormalizer::new(&tuning(), 10.0);
        let tiny: Vec<f32> = vec![0.001; 480];
        for _ in 0..2_000 {
            let mut block = tiny.clone();
            norm.process(&mut block);
        }
        assert!(norm.gain() <= tuning().normalization_max_gain + 1e-3);
    }

    #[test]
    fn output_never_exceeds_full_scale() {
        let mut norm = VolumeNormalizer::new(&tuning(), 10.0);
        let mut hot: Vec<f32> = vec![0.99; 480];
        norm.process(&mut hot);
        assert!(hot.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn soft_clip_is_linear_below_knee() {
        assert_eq!(soft_clip(0.5), 0.5);
        assert_eq!(soft_clip(-0.5), -0.5);
        assert!(soft_clip(2.0) < 1.0);
        assert!(soft_clip(-2.0) > -1.0);
    }
}
