//! Offload hook for external accelerators
//!
//! An offload replaces the software popcount+threshold kernel for a whole
//! forward call. Contract: given the encoded input, the popcount thresholds
//! and the binarized weights, write one fire bit per output unit into
//! `output` (already sized to the layer's fan-out). Bit `i` must equal
//! `matches(i) >= thresholds[i]`; the layer maps `true → +1`, `false → -1`.
//!
//! Only the interface is checked. Whatever the accelerator computes is taken
//! as-is.

use crate::bits::{BitMatrix, BitVector};

/// Binarized matrix-vector product delegated to external compute
pub trait MatVecOffload: Send + Sync {
    /// Compute fire bits for every output unit
    fn bin_mat_vec(&self, input: &BitVector, thresholds: &[i64], weights: &BitMatrix, output: &mut [bool]);
}

impl<F> MatVecOffload for F
where
    F: Fn(&BitVector, &[i64], &BitMatrix, &mut [bool]) + Send + Sync,
{
    #[inline]
    fn bin_mat_vec(&self, input: &BitVector, thresholds: &[i64], weights: &BitMatrix, output: &mut [bool]) {
        self(input, thresholds, weights, output)
    }
}

/// Software implementation of the offload contract
///
/// Useful as a stand-in accelerator and as the reference an accelerator is
/// checked against.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareOffload;

impl MatVecOffload for SoftwareOffload {
    fn bin_mat_vec(&self, input: &BitVector, thresholds: &[i64], weights: &BitMatrix, output: &mut [bool]) {
        debug_assert_eq!(output.len(), weights.units());
        for (i, out) in output.iter_mut().enumerate() {
            let matches = crate::bits::xnor_popcount(weights.row(i), input.words(), weights.fan_in());
            *out = matches as i64 >= thresholds[i];
        }
    }
}
