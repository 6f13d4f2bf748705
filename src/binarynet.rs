//! BinaryNet fully-connected layer with folded batchnorm
//!
//! Inference-only. Call [`BinaryNetLayer::set_threshold_from_batchnorm`] once
//! per neuron after synchronizing the weights to absorb the batchnorm
//! parameters into an integer threshold. The forward pass then reduces to a
//! popcount compared against that threshold; no activation function is needed.
//!
//! Folding flips weight bits of units with a negative batchnorm scale, so a
//! later [`BinaryNetLayer::synchronize`] discards those flips and the
//! thresholds must be folded again.

use std::io::{BufRead, Write};

use log::{debug, trace};

use crate::bits::BitMatrix;
use crate::codec::{read_bits_text, read_thresholds_text, write_bits_text, write_thresholds_text, TokenReader};
use crate::encode::{float_to_bipolar, float_to_bipolar_matrix, SignStats};
use crate::error::{ensure_len, BnnError, Result};
use crate::kernel::{bipolar_output, xnor_matvec_threshold};
use crate::layer::{zeroed, Layer, Workspace};
use crate::offload::MatVecOffload;
use crate::threshold::{fold_batchnorm, FoldedThreshold, ThresholdVector};
use crate::weights::{FloatWeights, SyncStamp};

/// Layer identifier
pub const BINARYNET_LAYER_TYPE: &str = "binarynet-fully-connected";

/// Binarized fully-connected layer with per-neuron popcount thresholds
pub struct BinaryNetLayer {
    in_size: usize,
    out_size: usize,
    weights: BitMatrix,
    thresholds: ThresholdVector,
    offload: Option<Box<dyn MatVecOffload>>,
    parallelize: bool,
    synced: SyncStamp,
    next: Option<Box<dyn Layer>>,
}

impl BinaryNetLayer {
    /// New layer: all weight bits `false`, all thresholds `0`
    pub fn new(in_size: usize, out_size: usize) -> Self {
        Self {
            in_size,
            out_size,
            weights: BitMatrix::new(in_size, out_size),
            thresholds: ThresholdVector::new(out_size),
            offload: None,
            parallelize: true,
            synced: SyncStamp::default(),
            next: None,
        }
    }

    /// New layer whose forward pass is delegated to `offload`
    pub fn with_offload<O: MatVecOffload + 'static>(in_size: usize, out_size: usize, offload: O) -> Self {
        let mut layer = Self::new(in_size, out_size);
        layer.offload = Some(Box::new(offload));
        layer
    }

    /// Install or remove the offload hook
    pub fn set_offload(&mut self, offload: Option<Box<dyn MatVecOffload>>) {
        self.offload = offload;
    }

    /// True when forward passes go through the offload hook
    pub fn has_offload(&self) -> bool {
        self.offload.is_some()
    }

    /// Enable/disable fan-out over output units (`parallel` feature)
    pub fn set_parallelize(&mut self, parallelize: bool) {
        self.parallelize = parallelize;
    }

    /// Link a downstream layer
    pub fn connect(&mut self, next: Box<dyn Layer>) {
        self.next = Some(next);
    }

    /// Binarized weights
    #[inline]
    pub fn weights(&self) -> &BitMatrix {
        &self.weights
    }

    /// Weight bit of connection `c` into unit `i`
    #[inline]
    pub fn weight_bit(&self, c: usize, i: usize) -> bool {
        self.weights.get(c, i)
    }

    /// Popcount thresholds
    #[inline]
    pub fn thresholds(&self) -> &ThresholdVector {
        &self.thresholds
    }

    /// Re-derive every weight bit from `weights` (`c * out_size + i` order)
    pub fn synchronize(&mut self, weights: &FloatWeights) -> Result<SignStats> {
        ensure_len("binarynet float weights", self.weights.len(), weights.len())?;
        let stats = float_to_bipolar_matrix(weights.data(), &mut self.weights);
        self.synced.record(weights);
        debug!(
            "[binarynet] synchronized {} weights ({} positive)",
            weights.len(),
            stats.positive_count
        );
        Ok(stats)
    }

    /// True when the binarized weights reflect the current `weights`
    pub fn is_synchronized_with(&self, weights: &FloatWeights) -> bool {
        self.synced.matches(weights)
    }

    /// Absorb unit `index`'s batchnorm parameters into its threshold
    ///
    /// With a negative `gamma * invstd` every weight bit of the unit is
    /// negated. A threshold outside `[0, fan_in]` is stored as computed and
    /// logged; see [`BinaryNetLayer::validate_thresholds`].
    pub fn set_threshold_from_batchnorm(
        &mut self,
        index: usize,
        mean: f32,
        gamma: f32,
        invstd: f32,
        beta: f32,
    ) -> Result<FoldedThreshold> {
        if index >= self.out_size {
            return Err(BnnError::IndexOutOfRange { index, len: self.out_size });
        }

        let folded = fold_batchnorm(index, mean, gamma, invstd, beta, self.in_size)?;
        if folded.flip {
            self.weights.flip_unit(index);
        }
        self.thresholds.set(index, folded.threshold, self.in_size);
        Ok(folded)
    }

    /// Units whose threshold lies outside `[0, fan_in]`
    pub fn out_of_range_units(&self) -> Vec<usize> {
        self.thresholds.out_of_range(self.in_size)
    }

    /// Fail if any threshold lies outside `[0, fan_in]`
    pub fn validate_thresholds(&self) -> Result<()> {
        self.thresholds.validate(self.in_size)
    }
}

impl Layer for BinaryNetLayer {
    fn layer_type(&self) -> &'static str {
        BINARYNET_LAYER_TYPE
    }

    fn in_data_size(&self) -> usize {
        self.in_size
    }

    fn out_data_size(&self) -> usize {
        self.out_size
    }

    /// One per synaptic weight, plus a threshold and a flip indicator per neuron
    fn connection_size(&self) -> usize {
        self.in_size * self.out_size + 2 * self.out_size
    }

    fn fan_in_size(&self) -> usize {
        self.in_size
    }

    fn fan_out_size(&self) -> usize {
        self.out_size
    }

    fn forward_into(&self, input: &[f32], workspace: &mut Workspace, output: &mut [f32]) -> Result<()> {
        ensure_len("binarynet input", self.in_size, input.len())?;
        ensure_len("binarynet output", self.out_size, output.len())?;

        let Workspace { input_bits, popcount_acc, fire, .. } = workspace;
        float_to_bipolar(input, input_bits);

        match &self.offload {
            Some(offload) => {
                let fire = zeroed(fire, self.out_size);
                offload.bin_mat_vec(input_bits, self.thresholds.as_slice(), &self.weights, fire);
                for (out, &f) in output.iter_mut().zip(fire.iter()) {
                    *out = bipolar_output(f);
                }
            }
            None => {
                let acc = zeroed(popcount_acc, self.out_size);
                xnor_matvec_threshold(
                    input_bits,
                    &self.weights,
                    self.thresholds.as_slice(),
                    acc,
                    output,
                    self.parallelize,
                );
            }
        }

        trace!("[binarynet] forward: {:?}", output);
        Ok(())
    }

    fn next(&self) -> Option<&dyn Layer> {
        self.next.as_deref()
    }

    fn post_update(&mut self, weights: &FloatWeights) -> Result<()> {
        self.synchronize(weights).map(|_| ())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_bits_text(writer, self.weights.iter_linear())?;
        write_thresholds_text(writer, self.thresholds.as_slice())
    }

    fn load(&mut self, reader: &mut dyn BufRead) -> Result<()> {
        let mut tokens = TokenReader::new(reader);
        let bits = read_bits_text(&mut tokens, self.weights.len())?;
        let thresholds = read_thresholds_text(&mut tokens, self.out_size)?;

        self.weights = BitMatrix::from_linear_bools(&bits, self.in_size, self.out_size);
        self.thresholds = ThresholdVector::from_vec(thresholds);
        self.synced.detach();
        debug!(
            "[binarynet] loaded {} weight bits and {} thresholds",
            bits.len(),
            self.out_size
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
