//! Fractional resampling
//!
//! Rate conversion between the source's declared rate and the sink's
//! output rate, with a live trim so the effective ratio stays coherent
//! with the timeshift manager's playback rate and the sync
//! coordinator's per-sink adjustment. The two corrections compose
//! additively in [`effective_rate`]; this is the single place where
//! they meet.

use std::collections::VecDeque;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{DspError, Result};

/// Input frames fed to the inner resampler per call
const BLOCK_FRAMES: usize = 256;

/// Headroom for live ratio adjustment around the nominal ratio
const MAX_RELATIVE: f64 = 1.1;

/// Compose the timeshift playback rate with the coordinator trim
///
/// Both are expressed as rates near 1.0; the composition is additive
/// in their deviations.
pub fn effective_rate(playback_rate: f64, sync_trim: f64) -> f64 {
    1.0 + (playback_rate - 1.0) + (sync_trim - 1.0)
}

enum Mode {
    /// Same-rate stream with negligible rate adjustment
    Passthrough,
    /// Real conversion through rubato
    Active {
        inner: FastFixedIn<f32>,
        /// Per-channel buffered input awaiting a full block
        pending: Vec<VecDeque<f32>>,
    },
}

/// Streaming resampler for interleaved audio
pub struct FractionalResampler {
    mode: Mode,
    input_rate: u32,
    output_rate: u32,
    channels: u8,
    /// Nominal output/input ratio
    base_ratio: f64,
    /// Rate deviation (ppm) beyond which a same-rate stream leaves
    /// passthrough
    passthrough_ppm: f64,
}

impl FractionalResampler {
    /// Build for a rate pair
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: u8,
        passthrough_ppm: f64,
    ) -> Result<Self> {
        let base_ratio = output_rate as f64 / input_rate as f64;
        let mode = if input_rate == output_rate {
            Mode::Passthrough
        } else {
            Mode::Active {
                inner: make_inner(base_ratio, channels)?,
                pending: vec![VecDeque::new(); channels as usize],
            }
        };
        Ok(Self {
            mode,
            input_rate,
            output_rate,
            channels,
            base_ratio,
            passthrough_ppm,
        })
    }

    /// Whether the stream currently bypasses conversion
    pub fn is_passthrough(&self) -> bool {
        matches!(self.mode, Mode::Passthrough)
    }

    /// Feed interleaved input, returning whatever interleaved output
    /// is ready
    ///
    /// `rate` is the composed playback rate from [`effective_rate`].
    /// A same-rate stream stays in passthrough until the deviation
    /// exceeds the configured ppm threshold, then converts from that
    /// point on.
    pub fn push(&mut self, input: &[f32], rate: f64) -> Result<Vec<f32>> {
        if let Mode::Passthrough = self.mode {
            let deviation_ppm = (rate - 1.0).abs() * 1e6;
            if deviation_ppm <= self.passthrough_ppm {
                return Ok(input.to_vec());
            }
            // The stream needs real conversion from here on.
            self.mode = Mode::Active {
                inner: make_inner(self.base_ratio, self.channels)?,
                pending: vec![VecDeque::new(); self.channels as usize],
            };
        }

        let channels = self.channels as usize;
        let Mode::Active { inner, pending } = &mut self.mode else {
            unreachable!()
        };

        for frame in input.chunks_exact(channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                pending[ch].push_back(sample);
            }
        }

        // Output cadence must absorb the rate deviation, so the ratio
        // shrinks as the effective rate grows.
        let relative = (1.0 / rate.max(0.5)).clamp(1.0 / MAX_RELATIVE, MAX_RELATIVE);
        inner
            .set_resample_ratio_relative(relative, true)
            .map_err(|e| DspError::Resampler {
                input_rate: self.input_rate,
                output_rate: self.output_rate,
                reason: e.to_string(),
            })?;

        let mut out = Vec::new();
        while pending[0].len() >= BLOCK_FRAMES {
            let mut block: Vec<Vec<f32>> = Vec::with_capacity(channels);
            for queue in pending.iter_mut() {
                block.push(queue.drain(..BLOCK_FRAMES).collect());
            }
            let produced = inner
                .process(&block, None)
                .map_err(|e| DspError::Resampler {
                    input_rate: self.input_rate,
                    output_rate: self.output_rate,
                    reason: e.to_string(),
                })?;
            let frames = produced.first().map(|c| c.len()).unwrap_or(0);
            out.reserve(frames * channels);
            for f in 0..frames {
                for chan in produced.iter() {
                    out.push(chan[f]);
                }
            }
        }
        Ok(out)
    }

    /// Drop buffered input and conversion state
    pub fn reset(&mut self) -> Result<()> {
        if let Mode::Active { inner, pending } = &mut self.mode {
            *inner = make_inner(self.base_ratio, self.channels)?;
            for queue in pending.iter_mut() {
                queue.clear();
            }
        }
        Ok(())
    }
}

fn make_inner(base_ratio: f64, channels: u8) -> Result<FastFixedIn<f32>> {
    FastFixedIn::<f32>::new(
        base_ratio,
        MAX_RELATIVE,
        PolynomialDegree::Septic,
        BLOCK_FRAMES,
        channels as usize,
    )
    .map_err(|e| DspError::Resampler {
        input_rate: 0,
        output_rate: 0,
        reason: e.to_string(),
    })
}
