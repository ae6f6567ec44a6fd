//! Speaker layout matrices
//!
//! Channel remapping is an 8×8 gain matrix applied per frame: output
//! channel `o` is the dot product of row `o` with the input frame.
//! Auto mode picks a built-in downmix/upmix table for the channel
//! pair; manual matrices compose right-to-left when chained.

use serde::{Deserialize, Serialize};

/// One 8×8 remap matrix plus the auto-mode flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerLayout {
    /// Use the built-in matrix for the active channel pair instead of
    /// `matrix`
    pub auto_mode: bool,
    /// Row-major output-by-input gains
    pub matrix: [[f32; 8]; 8],
}

impl SpeakerLayout {
    /// The identity mapping
    pub fn identity() -> Self {
        let mut matrix = [[0.0f32; 8]; 8];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            auto_mode: false,
            matrix,
        }
    }

    /// An auto-mode layout; the matrix is ignored until auto is
    /// switched off
    pub fn auto() -> Self {
        Self {
            auto_mode: true,
            ..Self::identity()
        }
    }

    /// Compose `self` after `earlier` (right-to-left, as matrices)
    pub fn compose(&self, earlier: &SpeakerLayout) -> SpeakerLayout {
        let mut matrix = [[0.0f32; 8]; 8];
        for o in 0..8 {
            for i in 0..8 {
                let mut acc = 0.0f32;
                for k in 0..8 {
                    acc += self.matrix[o][k] * earlier.matrix[k][i];
                }
                matrix[o][i] = acc;
            }
        }
        SpeakerLayout {
            auto_mode: false,
            matrix,
        }
    }

    /// The matrix that will actually be applied for a channel pair
    pub fn effective_matrix(&self, in_channels: u8, out_channels: u8) -> [[f32; 8]; 8] {
        if self.auto_mode {
            auto_matrix(in_channels, out_channels)
        } else {
            self.matrix
        }
    }
}

impl Default for SpeakerLayout {
    fn default() -> Self {
        Self::auto()
    }
}

/// Built-in downmix/upmix table for a channel pair
pub fn auto_matrix(in_channels: u8, out_channels: u8) -> [[f32; 8]; 8] {
    let mut m = [[0.0f32; 8]; 8];
    match (in_channels, out_channels) {
        // mono fans out equally
        (1, o) => {
            for row in m.iter_mut().take(o as usize) {
                row[0] = 1.0;
            }
        }
        // stereo collapse averages the pair
        (2, 1) => {
            m[0][0] = 0.5;
            m[0][1] = 0.5;
        }
        // stereo to quad/5.1/7.1 mirrors the front pair backwards
        (2, o) if o >= 2 => {
            m[0][0] = 1.0;
            m[1][1] = 1.0;
            for pair in (2..o as usize).step_by(2) {
                m[pair][0] = 1.0;
                if pair + 1 < o as usize {
                    m[pair + 1][1] = 1.0;
                }
            }
        }
        // surround to stereo: front pair plus attenuated center/rears
        (i, 2) if i > 2 => {
            m[0][0] = 1.0;
            m[1][1] = 1.0;
            for ch in 2..i as usize {
                m[0][ch] = 0.5;
                m[1][ch] = 0.5;
            }
        }
        // surround to mono: equal-power collapse
        (i, 1) => {
            let g = 1.0 / i as f32;
            for ch in 0..i as usize {
                m[0][ch] = g;
            }
        }
        // everything else passes channels straight through
        (i, o) => {
            for ch in 0..i.min(o) as usize {
                m[ch][ch] = 1.0;
            }
        }
    }
    m
}

/// Apply a matrix to interleaved frames, producing `out_channels`
/// interleaved output
pub fn remap(
    input: &[f32],
    in_channels: u8,
    out_channels: u8,
    matrix: &[[f32; 8]; 8],
) -> Vec<f32> {
    let in_ch = in_channels as usize;
    let out_ch = out_channels as usize;
    if in_ch == 0 {
        return Vec::new();
    }
    let frames = input.len() / in_ch;
    let mut out = vec![0.0f32; frames * out_ch];
    for f in 0..frames {
        let frame = &input[f * in_ch..(f + 1) * in_ch];
        for (o, out_sample) in out[f * out_ch..(f + 1) * out_ch].iter_mut().enumerate() {
            let row = &matrix[o];
            let mut acc = 0.0f32;
            for (i, &s) in frame.iter().enumerate() {
                acc += row[i] * s;
            }
            *out_sample = acc;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_a_passthrough() {
        let layout = SpeakerLayout::identity();
        let input = vec![0.1, 0.2, 0.3, 0.4];
        let out = remap(&input, 2, 2, &layout.effective_matrix(2, 2));
        assert_eq!(out, input);
    }

    #[test]
    fn mono_upmix_duplicates() {
        let m = auto_matrix(1, 2);
        let out = remap(&[0.5, -0.5], 1, 2, &m);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn stereo_downmix_averages() {
        let m = auto_matrix(2, 1);
        let out = remap(&[0.2, 0.4], 2, 1, &m);
        assert!((out[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn stereo_upmix_mirrors_rear_pairs() {
        let m = auto_matrix(2, 4);
        let out = remap(&[0.1, 0.2], 2, 4, &m);
        assert_eq!(out, vec![0.1, 0.2, 0.1, 0.2]);
    }

    #[test]
    fn composition_matches_sequential_application() {
        let mut swap = SpeakerLayout::identity();
        swap.matrix[0][0] = 0.0;
        swap.matrix[1][1] = 0.0;
        swap.matrix[0][1] = 1.0;
        swap.matrix[1][0] = 1.0;

        let mut gain = SpeakerLayout::identity();
        gain.matrix[0][0] = 0.5;
        gain.matrix[1][1] = 0.25;

        let composed = gain.compose(&swap);
        let input = vec![0.8, 0.4];
        let sequential = remap(&remap(&input, 2, 2, &swap.matrix), 2, 2, &gain.matrix);
        let at_once = remap(&input, 2, 2, &composed.matrix);
        for (a, b) in sequential.iter().zip(at_once.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
