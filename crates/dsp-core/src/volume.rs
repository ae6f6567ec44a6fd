//! Smoothed volume
//!
//! Volume commands take effect at chunk boundaries, but the applied
//! gain glides exponentially toward the target across samples so steps
//! never produce zipper noise.

/// Exponentially smoothed gain stage
pub struct SmoothedVolume {
    current: f32,
    target: f32,
    /// Per-sample smoothing coefficient
    coeff: f32,
}

impl SmoothedVolume {
    /// Start at `volume` with a per-chunk smoothing factor spread over
    /// `chunk_samples`
    pub fn new(volume: f32, chunk_smoothing: f32, chunk_samples: usize) -> Self {
        let per_sample = 1.0 - (1.0 - chunk_smoothing.clamp(0.0, 1.0)).powf(
            1.0 / chunk_samples.max(1) as f32,
        );
        Self {
            current: volume,
            target: volume,
            coeff: per_sample,
        }
    }

    /// Set the target volume; the glide starts on the next block
    pub fn set_target(&mut self, volume: f32) {
        self.target = volume.clamp(0.0, 1.0);
    }

    /// Currently applied gain
    pub fn current(&self) -> f32 {
        self.current
    }

    /// Apply over interleaved samples in place, gliding per frame
    pub fn process(&mut self, samples: &mut [f32], channels: u8) {
        let channels = channels as usize;
        if (self.current - self.target).abs() < 1e-6 {
            // Flat gain: a straight multiply, or nothing at unity.
            if (self.current - 1.0).abs() > 1e-9 {
                for s in samples.iter_mut() {
                    *s *= self.current;
                }
            }
            self.current = self.target;
            return;
        }
        for frame in samples.chunks_exact_mut(channels) {
            self.current += (self.target - self.current) * self.coeff;
            for s in frame.iter_mut() {
                *s *= self.current;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_volume_is_untouched() {
        let mut vol = SmoothedVolume::new(1.0, 0.15, 512);
        let mut samples = vec![0.25f32; 64];
        vol.process(&mut samples, 2);
        assert!(samples.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn steps_glide_instead_of_jumping() {
        let mut vol = SmoothedVolume::new(1.0, 0.5, 512);
        vol.set_target(0.0);
        let mut samples = vec![1.0f32; 1_024];
        vol.process(&mut samples, 1);
        // Monotic decay, no instant jump to zero
        assert!(samples[0] > 0.9);
        assert!(samples[1_023] < samples[0]);
        for pair in samples.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-6);
        }
    }

    #[test]
    fn converges_to_target_over_chunks() {
        let mut vol = SmoothedVolume::new(1.0, 0.5, 256);
        vol.set_target(0.5);
        for _ in 0..50 {
            let mut block = vec![1.0f32; 256];
            vol.process(&mut block, 1);
        }
        assert!((vol.current() - 0.5).abs() < 0.01);
    }
}
