//! Layer capability interface
//!
//! Every binarized layer implements [`Layer`] on its own; there is no shared
//! base. The network container drives layers through this trait only.

use std::io::{BufRead, Write};

use crate::bits::BitVector;
use crate::error::{BnnError, Result};
use crate::weights::FloatWeights;

/// Operations a binarized layer exposes to its container
///
/// `forward_propagation` takes `&self`: weights and thresholds are read-only
/// while any forward pass is in flight. Everything that mutates binarized
/// state takes `&mut self`, so the borrow checker serializes updates against
/// readers.
pub trait Layer: Send + Sync {
    /// Stable identifier of the layer kind
    fn layer_type(&self) -> &'static str;

    /// Length of the input vector
    fn in_data_size(&self) -> usize;

    /// Length of this layer's output vector
    fn out_data_size(&self) -> usize;

    /// Number of connections/parameters
    fn connection_size(&self) -> usize;

    /// Incoming connections per output unit
    fn fan_in_size(&self) -> usize;

    /// Outgoing connections per input unit
    fn fan_out_size(&self) -> usize;

    /// Compute this layer's output into `output` (DPS, no chaining)
    fn forward_into(&self, input: &[f32], workspace: &mut Workspace, output: &mut [f32]) -> Result<()>;

    /// Downstream layer, if linked
    fn next(&self) -> Option<&dyn Layer>;

    /// Compute this layer's output and pass it down the chain
    ///
    /// Returns the last layer's output.
    fn forward_propagation(&self, input: &[f32], workspace: &mut Workspace) -> Result<Vec<f32>> {
        let mut output = vec![0.0f32; self.out_data_size()];
        self.forward_into(input, workspace, &mut output)?;
        match self.next() {
            Some(next) => next.forward_propagation(&output, workspace),
            None => Ok(output),
        }
    }

    /// Re-derive binarized weights from the float weights
    fn post_update(&mut self, weights: &FloatWeights) -> Result<()>;

    /// Persist binarized state
    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Restore binarized state; existing state is untouched on failure
    fn load(&mut self, reader: &mut dyn BufRead) -> Result<()>;

    /// First-order gradient propagation (always fails)
    fn back_propagation(&self, _curr_delta: &[f32]) -> Result<Vec<f32>> {
        Err(BnnError::training(self.layer_type(), "back_propagation"))
    }

    /// Second-order gradient propagation (always fails)
    fn back_propagation_2nd(&self, _curr_delta2: &[f32]) -> Result<Vec<f32>> {
        Err(BnnError::training(self.layer_type(), "back_propagation_2nd"))
    }
}

// ============================================================================
// Activation
// ============================================================================

/// Activation applied to the signed accumulator of a fully-connected layer
///
/// Receives the whole pre-activation vector so that normalizing activations
/// can look at every unit.
pub trait Activation: Send + Sync {
    /// Output of unit `index`
    fn apply(&self, pre: &[f32], index: usize) -> f32;
}

/// Bipolar sign: `pre >= 0 → +1`, else `-1`
#[derive(Clone, Copy, Debug, Default)]
pub struct Sign;

impl Activation for Sign {
    #[inline]
    fn apply(&self, pre: &[f32], index: usize) -> f32 {
        if pre[index] >= 0.0 {
            1.0
        } else {
            -1.0
        }
    }
}

/// Pass the accumulator through unchanged
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Activation for Identity {
    #[inline]
    fn apply(&self, pre: &[f32], index: usize) -> f32 {
        pre[index]
    }
}

// ============================================================================
// Workspace: caller-owned scratch
// ============================================================================

/// Per-caller scratch for forward passes
///
/// Each concurrent caller owns one workspace; buffers are resized on demand
/// and reused across calls, so steady-state inference does not allocate for
/// scratch.
#[derive(Debug, Default)]
pub struct Workspace {
    pub(crate) input_bits: BitVector,
    pub(crate) signed_acc: Vec<i32>,
    pub(crate) popcount_acc: Vec<u32>,
    pub(crate) pre_activation: Vec<f32>,
    pub(crate) fire: Vec<bool>,
}

impl Workspace {
    /// Empty workspace; buffers grow on first use
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved by scratch buffers
    pub fn capacity_bytes(&self) -> usize {
        self.input_bits.word_capacity() * 8
            + self.signed_acc.capacity() * 4
            + self.popcount_acc.capacity() * 4
            + self.pre_activation.capacity() * 4
            + self.fire.capacity()
    }
}

/// Resize `buf` to `len` zeros and hand it out
#[inline]
pub(crate) fn zeroed<T: Copy + Default>(buf: &mut Vec<T>, len: usize) -> &mut [T] {
    buf.clear();
    buf.resize(len, T::default());
    buf
}
