//! Bipolar Encoding: FP32 → sign bit
//!
//! Every real value maps to exactly one bit: `value >= 0 → true`, otherwise
//! `false`. A set bit stands for +1 and a cleared bit for -1, so agreement of
//! two bits models the sign of the product of two ±1 values.
//!
//! NaN compares false against zero and therefore encodes as `false` (-1).

use crate::bits::{BitMatrix, BitVector};

/// Sign statistics of an encoded tensor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignStats {
    /// Number of values encoded as `true` (+1)
    pub positive_count: usize,
    /// Number of values encoded as `false` (-1)
    pub negative_count: usize,
}

impl SignStats {
    /// Fraction of +1 bits (0.0 for an empty tensor)
    pub fn positive_ratio(&self) -> f32 {
        let total = self.positive_count + self.negative_count;
        if total == 0 {
            0.0
        } else {
            self.positive_count as f32 / total as f32
        }
    }

    fn from_ones(ones: usize, total: usize) -> Self {
        Self { positive_count: ones, negative_count: total - ones }
    }
}

/// Sign of a single value
#[inline(always)]
pub fn bipolar(value: f32) -> bool {
    value >= 0.0
}

/// Encode `input` into `out` (DPS)
///
/// `out` is resized to `input.len()` and fully overwritten.
pub fn float_to_bipolar(input: &[f32], out: &mut BitVector) {
    out.reset(input.len());
    for (i, &v) in input.iter().enumerate() {
        if bipolar(v) {
            out.set(i, true);
        }
    }
}

/// Encode `input` into a fresh bit vector
///
/// **WARNING**: Allocates! Use [`float_to_bipolar`] on the hot path.
pub fn encode(input: &[f32]) -> BitVector {
    let mut out = BitVector::new(input.len());
    float_to_bipolar(input, &mut out);
    out
}

/// Encode a connection-major float tensor (`c * units + i`) into `out`
///
/// Every bit of `out` is rewritten; nothing from its previous state survives.
pub fn float_to_bipolar_matrix(weights: &[f32], out: &mut BitMatrix) -> SignStats {
    debug_assert_eq!(weights.len(), out.len());
    let units = out.units();
    let mut ones = 0usize;
    for (idx, &w) in weights.iter().enumerate() {
        let bit = bipolar(w);
        ones += bit as usize;
        out.set(idx / units, idx % units, bit);
    }
    SignStats::from_ones(ones, weights.len())
}

/// Encode a flat float tensor into `out` in the same linear order
pub fn float_to_bipolar_stats(input: &[f32], out: &mut BitVector) -> SignStats {
    float_to_bipolar(input, out);
    SignStats::from_ones(out.count_ones(), input.len())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_convention() {
        assert!(bipolar(0.0), "zero encodes as +1");
        assert!(bipolar(-0.0), "negative zero compares equal to zero");
        assert!(bipolar(3.5));
        assert!(!bipolar(-1e-9));
        assert!(!bipolar(f32::NAN), "NaN encodes as -1");
        assert!(bipolar(f32::INFINITY));
        assert!(!bipolar(f32::NEG_INFINITY));
    }

    #[test]
    fn test_encode_preserves_order() {
        let bits = encode(&[1.0, -2.0, 0.0, -0.5, 7.0]);
        assert_eq!(bits.to_bools(), vec![true, false, true, false, true]);
    }

    #[test]
    fn test_encode_deterministic() {
        let input: Vec<f32> = (0..200).map(|i| (i as f32 * 0.37).sin()).collect();
        assert_eq!(encode(&input), encode(&input));
    }

    #[test]
    fn test_dps_overwrites_previous_state() {
        let mut out = BitVector::from_bools(&[true; 100]);
        float_to_bipolar(&[-1.0, 1.0], &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out.to_bools(), vec![false, true]);
    }

    #[test]
    fn test_matrix_encoding_stats() {
        // fan_in = 2, units = 2
        let mut m = BitMatrix::new(2, 2);
        m.set(1, 1, true);
        let stats = float_to_bipolar_matrix(&[0.5, -0.5, -1.0, -2.0], &mut m);

        assert!(m.get(0, 0));
        assert!(!m.get(0, 1));
        assert!(!m.get(1, 0));
        assert!(!m.get(1, 1), "stale bit must be overwritten");
        assert_eq!(stats, SignStats { positive_count: 1, negative_count: 3 });
        assert!((stats.positive_ratio() - 0.25).abs() < 1e-6);
    }
}
