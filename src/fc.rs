//! Binarized fully-connected layer
//!
//! Weights and inputs are both reduced to their signs; the signed XNOR
//! accumulator (`2 * matches - fan_in`) is handed to an activation function.

use std::io::{BufRead, Write};

use log::{debug, trace};

use crate::bits::BitMatrix;
use crate::codec::{read_bits_text, write_bits_text, TokenReader};
use crate::encode::{float_to_bipolar, float_to_bipolar_matrix, SignStats};
use crate::error::{ensure_len, Result};
use crate::kernel::xnor_matvec_signed;
use crate::layer::{zeroed, Activation, Layer, Sign, Workspace};
use crate::weights::{FloatWeights, SyncStamp};

/// Layer identifier
pub const BINARIZED_FC_LAYER_TYPE: &str = "binarized-fully-connected";

/// Fully-connected layer with sign-binarized weights and inputs
pub struct BinarizedFcLayer<A: Activation = Sign> {
    in_size: usize,
    out_size: usize,
    weights: BitMatrix,
    activation: A,
    parallelize: bool,
    synced: SyncStamp,
    next: Option<Box<dyn Layer>>,
}

impl BinarizedFcLayer<Sign> {
    /// New layer with all weight bits `false` and the sign activation
    pub fn new(in_size: usize, out_size: usize) -> Self {
        Self::with_activation(in_size, out_size, Sign)
    }
}

impl<A: Activation> BinarizedFcLayer<A> {
    /// New layer with a custom activation
    pub fn with_activation(in_size: usize, out_size: usize, activation: A) -> Self {
        Self {
            in_size,
            out_size,
            weights: BitMatrix::new(in_size, out_size),
            activation,
            parallelize: true,
            synced: SyncStamp::default(),
            next: None,
        }
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

    /// Re-derive every weight bit from `weights` (`c * out_size + i` order)
    pub fn synchronize(&mut self, weights: &FloatWeights) -> Result<SignStats> {
        ensure_len("binarized-fully-connected float weights", self.weights.len(), weights.len())?;
        let stats = float_to_bipolar_matrix(weights.data(), &mut self.weights);
        self.synced.record(weights);
        debug!(
            "[bfc] synchronized {} weights ({} positive)",
            weights.len(),
            stats.positive_count
        );
        Ok(stats)
    }

    /// True when the binarized weights reflect the current `weights`
    pub fn is_synchronized_with(&self, weights: &FloatWeights) -> bool {
        self.synced.matches(weights)
    }
}

impl<A: Activation> Layer for BinarizedFcLayer<A> {
    fn layer_type(&self) -> &'static str {
        BINARIZED_FC_LAYER_TYPE
    }

    fn in_data_size(&self) -> usize {
        self.in_size
    }

    fn out_data_size(&self) -> usize {
        self.out_size
    }

    fn connection_size(&self) -> usize {
        self.in_size * self.out_size
    }

    fn fan_in_size(&self) -> usize {
        self.in_size
    }

    fn fan_out_size(&self) -> usize {
        self.out_size
    }

    fn forward_into(&self, input: &[f32], workspace: &mut Workspace, output: &mut [f32]) -> Result<()> {
        ensure_len("binarized-fully-connected input", self.in_size, input.len())?;
        ensure_len("binarized-fully-connected output", self.out_size, output.len())?;

        let Workspace { input_bits, signed_acc, pre_activation, .. } = workspace;
        float_to_bipolar(input, input_bits);

        let acc = zeroed(signed_acc, self.out_size);
        xnor_matvec_signed(input_bits, &self.weights, acc, self.parallelize);

        let pre = zeroed(pre_activation, self.out_size);
        for (p, &a) in pre.iter_mut().zip(acc.iter()) {
            *p = a as f32;
        }
        for (i, out) in output.iter_mut().enumerate() {
            *out = self.activation.apply(pre, i);
        }

        trace!("[bfc] forward: {:?}", output);
        Ok(())
    }

    fn next(&self) -> Option<&dyn Layer> {
        self.next.as_deref()
    }

    fn post_update(&mut self, weights: &FloatWeights) -> Result<()> {
        self.synchronize(weights).map(|_| ())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_bits_text(writer, self.weights.iter_linear())
    }

    fn load(&mut self, reader: &mut dyn BufRead) -> Result<()> {
        let mut tokens = TokenReader::new(reader);
        let bits = read_bits_text(&mut tokens, self.weights.len())?;
        self.weights = BitMatrix::from_linear_bools(&bits, self.in_size, self.out_size);
        self.synced.detach();
        debug!("[bfc] loaded {} weight bits", bits.len());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
