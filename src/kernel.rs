//! XNOR Similarity Kernels: The Heart of ALICE-BNN
//!
//! **No multiplication.** Two ±1 values multiply to +1 exactly when their
//! sign bits agree, so an inner product of bipolar vectors reduces to counting
//! agreeing bits:
//!
//! ```text
//! popcount mode: acc = matches                  (compare against a threshold)
//! signed mode:   acc = matches - mismatches = 2 * matches - fan_in
//! ```
//!
//! All kernels use Destination Passing Style (DPS): the caller owns the
//! accumulator/output buffers and no allocation happens in the hot path.
//! Every output unit is independent, so with the `parallel` feature the unit
//! loop fans out over rayon with exactly one writer per accumulator slot.

use crate::bits::{xnor_popcount, BitMatrix, BitVector};

/// How agreeing/disagreeing bit pairs contribute to the accumulator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AccumulationMode {
    /// +1 for agreement, -1 for disagreement
    #[default]
    Signed,
    /// +1 for agreement, 0 for disagreement
    Popcount,
}

impl AccumulationMode {
    /// Accumulator value for `matches` agreements out of `fan_in` pairs
    #[inline(always)]
    pub const fn accumulate(self, matches: usize, fan_in: usize) -> i32 {
        match self {
            AccumulationMode::Signed => signed_from_popcount(matches, fan_in),
            AccumulationMode::Popcount => matches as i32,
        }
    }
}

/// `2 * matches - fan_in`: the signed accumulator implied by a popcount
#[inline(always)]
pub const fn signed_from_popcount(matches: usize, fan_in: usize) -> i32 {
    2 * matches as i32 - fan_in as i32
}

/// Map a fire/no-fire decision to the bipolar output value
#[inline(always)]
pub const fn bipolar_output(fire: bool) -> f32 {
    if fire {
        1.0
    } else {
        -1.0
    }
}

// ============================================================================
// DPS Kernels: ZERO ALLOCATION
// ============================================================================

/// Signed-mode matvec (DPS)
///
/// `acc[i] = Σ_c (w[c,i] == x[c] ? +1 : -1)`
///
/// # Arguments
/// * `input` - Encoded input (length = fan_in)
/// * `weights` - Binarized weights
/// * `acc` - Pre-allocated accumulator (length = units)
/// * `parallel` - Fan out over output units (needs the `parallel` feature)
#[inline]
pub fn xnor_matvec_signed(input: &BitVector, weights: &BitMatrix, acc: &mut [i32], parallel: bool) {
    debug_assert_eq!(input.len(), weights.fan_in());
    debug_assert_eq!(acc.len(), weights.units());

    let fan_in = weights.fan_in();
    let unit = |(i, a): (usize, &mut i32)| {
        let matches = xnor_popcount(weights.row(i), input.words(), fan_in);
        *a = signed_from_popcount(matches, fan_in);
    };

    #[cfg(feature = "parallel")]
    {
        if parallel {
            use rayon::prelude::*;
            acc.par_iter_mut().enumerate().for_each(unit);
            return;
        }
    }

    let _ = parallel;
    acc.iter_mut().enumerate().for_each(unit);
}

/// Popcount-mode matvec (DPS)
///
/// `acc[i] = Σ_c (w[c,i] == x[c] ? 1 : 0)`
#[inline]
pub fn xnor_matvec_popcount(input: &BitVector, weights: &BitMatrix, acc: &mut [u32], parallel: bool) {
    debug_assert_eq!(input.len(), weights.fan_in());
    debug_assert_eq!(acc.len(), weights.units());

    let fan_in = weights.fan_in();
    let unit = |(i, a): (usize, &mut u32)| {
        *a = xnor_popcount(weights.row(i), input.words(), fan_in) as u32;
    };

    #[cfg(feature = "parallel")]
    {
        if parallel {
            use rayon::prelude::*;
            acc.par_iter_mut().enumerate().for_each(unit);
            return;
        }
    }

    let _ = parallel;
    acc.iter_mut().enumerate().for_each(unit);
}

/// Threshold activation (DPS)
///
/// `out[i] = acc[i] >= thresholds[i] ? +1 : -1`
#[inline]
pub fn threshold_activate(acc: &[u32], thresholds: &[i64], out: &mut [f32]) {
    debug_assert_eq!(acc.len(), thresholds.len());
    debug_assert_eq!(acc.len(), out.len());

    for ((o, &a), &t) in out.iter_mut().zip(acc.iter()).zip(thresholds.iter()) {
        *o = bipolar_output(a as i64 >= t);
    }
}

/// Fused popcount + threshold matvec (DPS)
///
/// Equivalent to [`xnor_matvec_popcount`] followed by [`threshold_activate`],
/// writing the popcounts into `acc` on the way.
#[inline]
pub fn xnor_matvec_threshold(
    input: &BitVector,
    weights: &BitMatrix,
    thresholds: &[i64],
    acc: &mut [u32],
    out: &mut [f32],
    parallel: bool,
) {
    debug_assert_eq!(thresholds.len(), weights.units());
    debug_assert_eq!(out.len(), weights.units());

    let fan_in = weights.fan_in();
    let unit = |(i, (a, o)): (usize, (&mut u32, &mut f32))| {
        let matches = xnor_popcount(weights.row(i), input.words(), fan_in);
        *a = matches as u32;
        *o = bipolar_output(matches as i64 >= thresholds[i]);
    };

    #[cfg(feature = "parallel")]
    {
        if parallel {
            use rayon::prelude::*;
            acc.par_iter_mut().zip(out.par_iter_mut()).enumerate().for_each(unit);
            return;
        }
    }

    let _ = parallel;
    acc.iter_mut().zip(out.iter_mut()).enumerate().for_each(unit);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-by-bit reference in linear `c * units + i` order
    fn reference(mode: AccumulationMode, input: &[bool], weights: &[bool], units: usize) -> Vec<i32> {
        (0..units)
            .map(|i| {
                input
                    .iter()
                    .enumerate()
                    .map(|(c, &x)| mode.accumulate((weights[c * units + i] == x) as usize, 1))
                    .sum()
            })
            .collect()
    }

    fn pattern(len: usize, seed: usize) -> Vec<bool> {
        (0..len).map(|i| (i * 7 + seed * 13 + i / 3) % 5 < 2).collect()
    }

    #[test]
    fn test_mode_equivalence_concrete() {
        // n = 4, m = 3: signed = 2, popcount = 3, 2*3 - 4 = 2
        let input = BitVector::from_bools(&[true, true, false, false]);
        let weights = BitMatrix::from_linear_bools(&[true, true, false, true], 4, 1);

        let mut signed = [0i32; 1];
        let mut pop = [0u32; 1];
        xnor_matvec_signed(&input, &weights, &mut signed, false);
        xnor_matvec_popcount(&input, &weights, &mut pop, false);

        assert_eq!(signed[0], 2, "signed accumulator for 3 of 4 matches");
        assert_eq!(pop[0], 3, "popcount for 3 of 4 matches");
        assert_eq!(signed_from_popcount(pop[0] as usize, 4), signed[0]);
    }

    #[test]
    fn test_packed_matches_reference() {
        // fan_in spans several words to exercise the tail handling
        for &(fan_in, units) in &[(1usize, 1usize), (63, 3), (64, 2), (65, 4), (200, 5)] {
            let x = pattern(fan_in, 1);
            let w = pattern(fan_in * units, 2);
            let input = BitVector::from_bools(&x);
            let weights = BitMatrix::from_linear_bools(&w, fan_in, units);

            let mut signed = vec![0i32; units];
            xnor_matvec_signed(&input, &weights, &mut signed, false);
            assert_eq!(signed, reference(AccumulationMode::Signed, &x, &w, units), "signed fan_in={}", fan_in);

            let mut pop = vec![0u32; units];
            xnor_matvec_popcount(&input, &weights, &mut pop, false);
            let expected: Vec<u32> = reference(AccumulationMode::Popcount, &x, &w, units)
                .into_iter()
                .map(|v| v as u32)
                .collect();
            assert_eq!(pop, expected, "popcount fan_in={}", fan_in);
        }
    }

    #[test]
    fn test_parallel_flag_same_result() {
        let x = pattern(130, 3);
        let w = pattern(130 * 9, 4);
        let input = BitVector::from_bools(&x);
        let weights = BitMatrix::from_linear_bools(&w, 130, 9);

        let mut seq = vec![0i32; 9];
        let mut par = vec![0i32; 9];
        xnor_matvec_signed(&input, &weights, &mut seq, false);
        xnor_matvec_signed(&input, &weights, &mut par, true);
        assert_eq!(seq, par);
    }

    #[test]
    fn test_threshold_activate() {
        let acc = [0u32, 3, 4, 2];
        let thresholds = [0i64, 4, 4, -1];
        let mut out = [0.0f32; 4];

        threshold_activate(&acc, &thresholds, &mut out);
        assert_eq!(out, [1.0, -1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_fused_threshold_matches_two_step() {
        let x = pattern(70, 5);
        let w = pattern(70 * 6, 6);
        let thresholds = [0i64, 20, 35, 36, 50, 71];
        let input = BitVector::from_bools(&x);
        let weights = BitMatrix::from_linear_bools(&w, 70, 6);

        let mut acc = [0u32; 6];
        let mut two_step = [0.0f32; 6];
        xnor_matvec_popcount(&input, &weights, &mut acc, false);
        threshold_activate(&acc, &thresholds, &mut two_step);

        let mut fused_acc = [0u32; 6];
        let mut fused = [0.0f32; 6];
        xnor_matvec_threshold(&input, &weights, &thresholds, &mut fused_acc, &mut fused, true);

        assert_eq!(fused_acc, acc);
        assert_eq!(fused, two_step);
        assert!(fused.iter().all(|&v| v == 1.0 || v == -1.0));
    }

    #[test]
    fn test_mode_accumulate_table() {
        use AccumulationMode::*;
        // single pair: agreement, disagreement
        assert_eq!(Signed.accumulate(1, 1), 1);
        assert_eq!(Signed.accumulate(0, 1), -1);
        assert_eq!(Popcount.accumulate(1, 1), 1);
        assert_eq!(Popcount.accumulate(0, 1), 0);
        // n = 4, m = 3
        assert_eq!(Popcount.accumulate(3, 4), 3);
        assert_eq!(Signed.accumulate(3, 4), 2);
    }
}
