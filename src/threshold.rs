//! Batch-Normalization Threshold Folding
//!
//! At inference time a binarized neuron followed by batchnorm and the sign
//! activation computes
//!
//! ```text
//! sign(gamma * (acc - mean) * invstd + beta)
//! ```
//!
//! The batchnorm output is linear in `acc`, so its sign changes at exactly one
//! point:
//!
//! ```text
//! acc* = mean - beta / (gamma * invstd)
//! ```
//!
//! When `gamma * invstd < 0` the step function runs the other way. Instead of
//! carrying a per-unit flip flag, the unit's weight bits and the threshold are
//! negated so the kernel stays uniform. Finally the threshold is moved from the
//! signed ±1 domain into the popcount domain with `(acc* + fan_in) / 2`, since
//! `acc_signed = 2 * popcount - fan_in`.

use log::warn;

use crate::error::{BnnError, Result};

/// Result of folding one unit's batchnorm parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FoldedThreshold {
    /// Popcount threshold: the unit fires +1 when `matches >= threshold`
    pub threshold: i64,
    /// The unit's weight column must be negated (`gamma * invstd < 0`)
    pub flip: bool,
}

/// Fold `(mean, gamma, invstd, beta)` into a popcount threshold
///
/// The crossing point is truncated toward zero before the sign correction and
/// the final halving also truncates toward zero.
///
/// # Errors
/// [`BnnError::DegenerateBatchNorm`] when `gamma * invstd` is zero or the
/// crossing point is not finite. `index` is only used for the error.
pub fn fold_batchnorm(
    index: usize,
    mean: f32,
    gamma: f32,
    invstd: f32,
    beta: f32,
    fan_in: usize,
) -> Result<FoldedThreshold> {
    let scale = gamma as f64 * invstd as f64;
    if scale == 0.0 || !scale.is_finite() {
        return Err(BnnError::DegenerateBatchNorm { index });
    }

    let crossing = mean as f64 - beta as f64 / scale;
    if !crossing.is_finite() {
        return Err(BnnError::DegenerateBatchNorm { index });
    }

    // negate before the cast: `as` saturates, and negating i64::MIN overflows
    let flip = scale < 0.0;
    let raw = (if flip { -crossing } else { crossing }) as i64;

    let threshold = raw.saturating_add(fan_in as i64) / 2;
    Ok(FoldedThreshold { threshold, flip })
}

/// True when `threshold` can be compared against an unsigned popcount
/// without changing the decision boundary
#[inline]
pub fn in_popcount_range(threshold: i64, fan_in: usize) -> bool {
    (0..=fan_in as i64).contains(&threshold)
}

/// One popcount threshold per output unit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThresholdVector {
    values: Vec<i64>,
}

impl ThresholdVector {
    /// All-zero thresholds for `units` outputs
    pub fn new(units: usize) -> Self {
        Self { values: vec![0; units] }
    }

    /// Wrap existing thresholds
    pub fn from_vec(values: Vec<i64>) -> Self {
        Self { values }
    }

    /// Number of units
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when there are no units
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Threshold of unit `i`
    #[inline]
    pub fn get(&self, i: usize) -> i64 {
        self.values[i]
    }

    /// Raw thresholds
    #[inline]
    pub fn as_slice(&self) -> &[i64] {
        &self.values
    }

    pub(crate) fn set(&mut self, i: usize, value: i64, fan_in: usize) {
        if !in_popcount_range(value, fan_in) {
            warn!(
                "folded threshold {} for unit {} lies outside [0, {}]; popcount comparison changes the decision boundary",
                value, i, fan_in
            );
        }
        self.values[i] = value;
    }

    /// Units whose threshold lies outside `[0, fan_in]`
    pub fn out_of_range(&self, fan_in: usize) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, &t)| !in_popcount_range(t, fan_in))
            .map(|(i, _)| i)
            .collect()
    }

    /// Fail if any threshold lies outside `[0, fan_in]`
    ///
    /// Nothing is clamped: resolving an out-of-range unit changes the trained
    /// decision boundary and is left to the integrator.
    pub fn validate(&self, fan_in: usize) -> Result<()> {
        let units = self.out_of_range(fan_in);
        if units.is_empty() {
            Ok(())
        } else {
            Err(BnnError::ThresholdOutOfRange { units, fan_in })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
