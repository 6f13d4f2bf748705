//! Binarized 2D Convolution
//!
//! "Valid" padding, stride 1, no bias. Weights are stored as one flat bit
//! vector in `(oc, ic, ky, kx)` order; inputs are channel-major
//! `(ic, y, x)` and outputs `(oc, oy, ox)`.
//!
//! The layer has no threshold step: the raw accumulator of every output
//! position is handed to the next layer as `f32`. Forward passes run on the
//! calling thread only.

use std::io::{BufRead, Write};
use std::path::Path;

use log::{debug, trace};

use crate::bits::BitVector;
use crate::codec::{self, read_bits_text, write_bits_text, TokenReader};
use crate::encode::{float_to_bipolar, float_to_bipolar_stats, SignStats};
use crate::error::{ensure_len, BnnError, Result};
use crate::kernel::AccumulationMode;
use crate::layer::{Layer, Workspace};
use crate::weights::{FloatWeights, SyncStamp};

/// Layer identifier
pub const BNN_CONV_LAYER_TYPE: &str = "bnn_conv_layer";

// ============================================================================
// Geometry
// ============================================================================

/// Immutable convolution configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    in_width: usize,
    in_height: usize,
    window_size: usize,
    in_channels: usize,
    out_channels: usize,
}

impl ConvGeometry {
    /// Validate and build a geometry
    ///
    /// # Errors
    /// [`BnnError::InvalidGeometry`] for zero-sized dimensions or a window
    /// larger than the input.
    pub fn new(
        in_width: usize,
        in_height: usize,
        window_size: usize,
        in_channels: usize,
        out_channels: usize,
    ) -> Result<Self> {
        if in_width == 0 || in_height == 0 || window_size == 0 || in_channels == 0 || out_channels == 0 {
            return Err(BnnError::InvalidGeometry(format!(
                "zero-sized dimension in {}x{} input, window {}, channels {} -> {}",
                in_width, in_height, window_size, in_channels, out_channels
            )));
        }
        if window_size > in_width || window_size > in_height {
            return Err(BnnError::InvalidGeometry(format!(
                "window {} does not fit a {}x{} input",
                window_size, in_width, in_height
            )));
        }
        Ok(Self { in_width, in_height, window_size, in_channels, out_channels })
    }

    /// Input width
    #[inline]
    pub fn in_width(&self) -> usize {
        self.in_width
    }

    /// Input height
    #[inline]
    pub fn in_height(&self) -> usize {
        self.in_height
    }

    /// Kernel side length `k`
    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Input channels
    #[inline]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Output channels
    #[inline]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// `in_width - k + 1`
    #[inline]
    pub fn out_width(&self) -> usize {
        self.in_width - self.window_size + 1
    }

    /// `in_height - k + 1`
    #[inline]
    pub fn out_height(&self) -> usize {
        self.in_height - self.window_size + 1
    }

    /// Connections per output position: `in_channels * k * k`
    #[inline]
    pub fn fan_in(&self) -> usize {
        self.in_channels * self.window_size * self.window_size
    }

    /// `out_channels * in_channels * k * k`
    #[inline]
    pub fn weight_count(&self) -> usize {
        self.out_channels * self.fan_in()
    }

    /// Input vector length
    #[inline]
    pub fn in_size(&self) -> usize {
        self.in_channels * self.in_width * self.in_height
    }

    /// Output vector length
    #[inline]
    pub fn out_size(&self) -> usize {
        self.out_channels * self.out_width() * self.out_height()
    }

    /// Linear weight bit offset of `(oc, ic, ky, kx)`
    #[inline(always)]
    pub fn weight_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        let k = self.window_size;
        oc * (k * k * self.in_channels) + ic * (k * k) + ky * k + kx
    }

    /// Linear input bit offset seen by output position `(oy, ox)` at kernel
    /// tap `(ky, kx)` of channel `ic`
    #[inline(always)]
    pub fn input_index(&self, ic: usize, oy: usize, ox: usize, ky: usize, kx: usize) -> usize {
        ic * (self.in_width * self.in_height) + (oy + ky) * self.in_width + ox + kx
    }

    /// Linear output offset of `(oc, oy, ox)`
    #[inline(always)]
    pub fn output_index(&self, oc: usize, oy: usize, ox: usize) -> usize {
        oc * self.out_height() * self.out_width() + oy * self.out_width() + ox
    }
}

// ============================================================================
// Kernel
// ============================================================================

/// Convolution accumulation (DPS)
///
/// `out[output_index(oc, oy, ox)] = mode.accumulate(matches, fan_in)`, where
/// `matches` counts `w[oc,ic,ky,kx] == x[ic,oy+ky,ox+kx]` over the window
///
/// # Arguments
/// * `input` - Encoded input (length = `geometry.in_size()`)
/// * `weights` - Weight bits (length = `geometry.weight_count()`)
/// * `out` - Pre-allocated output (length = `geometry.out_size()`)
pub fn conv_accumulate(
    input: &BitVector,
    weights: &BitVector,
    geometry: &ConvGeometry,
    mode: AccumulationMode,
    out: &mut [f32],
) {
    debug_assert_eq!(input.len(), geometry.in_size());
    debug_assert_eq!(weights.len(), geometry.weight_count());
    debug_assert_eq!(out.len(), geometry.out_size());

    let k = geometry.window_size();
    let fan_in = geometry.fan_in();
    for oc in 0..geometry.out_channels() {
        for oy in 0..geometry.out_height() {
            for ox in 0..geometry.out_width() {
                let mut matches = 0usize;
                for ic in 0..geometry.in_channels() {
                    for ky in 0..k {
                        for kx in 0..k {
                            let w = weights.get(geometry.weight_index(oc, ic, ky, kx));
                            let x = input.get(geometry.input_index(ic, oy, ox, ky, kx));
                            matches += (w == x) as usize;
                        }
                    }
                }
                out[geometry.output_index(oc, oy, ox)] = mode.accumulate(matches, fan_in) as f32;
            }
        }
    }
}

// ============================================================================
// Layer
// ============================================================================

/// Binarized convolution layer
pub struct BnnConvLayer {
    geometry: ConvGeometry,
    mode: AccumulationMode,
    weights: BitVector,
    synced: SyncStamp,
    next: Option<Box<dyn Layer>>,
}

impl BnnConvLayer {
    /// New layer with all weight bits `false`
    pub fn new(geometry: ConvGeometry, mode: AccumulationMode) -> Self {
        Self {
            geometry,
            mode,
            weights: BitVector::new(geometry.weight_count()),
            synced: SyncStamp::default(),
            next: None,
        }
    }

    /// New layer with weights read from a fixed-width binary file
    pub fn from_binary_file<P: AsRef<Path>>(geometry: ConvGeometry, mode: AccumulationMode, path: P) -> Result<Self> {
        let mut layer = Self::new(geometry, mode);
        layer.load_binary_weights(path)?;
        Ok(layer)
    }

    /// Replace the weights with the contents of a fixed-width binary file
    ///
    /// On error the current weights are kept.
    pub fn load_binary_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.weights = codec::load_binary_weights(path, self.geometry.weight_count())?;
        self.synced.detach();
        Ok(())
    }

    /// Write the weights to a fixed-width binary file
    pub fn save_binary_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        codec::save_binary_weights(path, &self.weights)
    }

    /// Write the weights in the fixed-width binary format
    pub fn write_binary_weights<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        codec::write_binary_weights(writer, &self.weights)
    }

    /// Layer geometry
    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    /// Accumulation rule chosen at construction
    pub fn mode(&self) -> AccumulationMode {
        self.mode
    }

    /// Link a downstream layer
    pub fn connect(&mut self, next: Box<dyn Layer>) {
        self.next = Some(next);
    }

    /// Weight bits in `(oc, ic, ky, kx)` order
    pub fn weights(&self) -> &BitVector {
        &self.weights
    }

    /// Weight bit of `(oc, ic, ky, kx)`
    pub fn weight_bit(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> bool {
        self.weights.get(self.geometry.weight_index(oc, ic, ky, kx))
    }

    /// Re-derive every weight bit from `weights` (`(oc, ic, ky, kx)` order)
    pub fn synchronize(&mut self, weights: &FloatWeights) -> Result<SignStats> {
        ensure_len("bnn_conv_layer float weights", self.weights.len(), weights.len())?;
        let stats = float_to_bipolar_stats(weights.data(), &mut self.weights);
        self.synced.record(weights);
        debug!(
            "[bnn_conv_layer] synchronized {} weights ({} positive)",
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

impl Layer for BnnConvLayer {
    fn layer_type(&self) -> &'static str {
        BNN_CONV_LAYER_TYPE
    }

    fn in_data_size(&self) -> usize {
        self.geometry.in_size()
    }

    fn out_data_size(&self) -> usize {
        self.geometry.out_size()
    }

    fn connection_size(&self) -> usize {
        self.geometry.out_height() * self.geometry.out_width() * self.geometry.fan_in()
    }

    fn fan_in_size(&self) -> usize {
        self.geometry.fan_in()
    }

    fn fan_out_size(&self) -> usize {
        let k = self.geometry.window_size();
        self.geometry.out_channels() * k * k
    }

    fn forward_into(&self, input: &[f32], workspace: &mut Workspace, output: &mut [f32]) -> Result<()> {
        ensure_len("bnn_conv_layer input", self.geometry.in_size(), input.len())?;
        ensure_len("bnn_conv_layer output", self.geometry.out_size(), output.len())?;

        float_to_bipolar(input, &mut workspace.input_bits);
        conv_accumulate(&workspace.input_bits, &self.weights, &self.geometry, self.mode, output);

        trace!("[bnn_conv_layer] forward: {:?}", output);
        Ok(())
    }

    fn next(&self) -> Option<&dyn Layer> {
        self.next.as_deref()
    }

    fn post_update(&mut self, weights: &FloatWeights) -> Result<()> {
        self.synchronize(weights).map(|_| ())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_bits_text(writer, self.weights.iter())
    }

    fn load(&mut self, reader: &mut dyn BufRead) -> Result<()> {
        let mut tokens = TokenReader::new(reader);
        let bits = read_bits_text(&mut tokens, self.weights.len())?;
        self.weights = BitVector::from_bools(&bits);
        self.synced.detach();
        debug!("[bnn_conv_layer] loaded {} weight bits", bits.len());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn geometry(w: usize, h: usize, k: usize, ic: usize, oc: usize) -> ConvGeometry {
        ConvGeometry::new(w, h, k, ic, oc).unwrap()
    }

    /// Direct evaluation on unpacked bools
    fn reference(input: &[bool], weights: &[bool], g: &ConvGeometry, mode: AccumulationMode) -> Vec<f32> {
        let k = g.window_size();
        let mut out = Vec::new();
        for oc in 0..g.out_channels() {
            for oy in 0..g.out_height() {
                for ox in 0..g.out_width() {
                    let mut acc = 0;
                    for ic in 0..g.in_channels() {
                        for ky in 0..k {
                            for kx in 0..k {
                                let w = weights[((oc * g.in_channels() + ic) * k + ky) * k + kx];
                                let x = input[(ic * g.in_height() + oy + ky) * g.in_width() + ox + kx];
                                acc += mode.accumulate((w == x) as usize, 1);
                            }
                        }
                    }
                    out.push(acc as f32);
                }
            }
        }
        out
    }

    #[test]
    fn test_geometry_5x5_k3() {
        let g = geometry(5, 5, 3, 2, 4);
        assert_eq!(g.out_width(), 3);
        assert_eq!(g.out_height(), 3);
        assert_eq!(g.out_size(), 4 * 9);
        assert_eq!(g.fan_in(), 2 * 9);
        assert_eq!(g.weight_count(), 4 * 2 * 9);
        assert_eq!(g.in_size(), 2 * 25);
    }

    #[test]
    fn test_geometry_rejects_invalid() {
        assert!(matches!(ConvGeometry::new(3, 3, 4, 1, 1), Err(BnnError::InvalidGeometry(_))));
        assert!(matches!(ConvGeometry::new(5, 2, 3, 1, 1), Err(BnnError::InvalidGeometry(_))));
        assert!(ConvGeometry::new(5, 5, 0, 1, 1).is_err());
        assert!(ConvGeometry::new(5, 5, 3, 0, 1).is_err());
        assert!(ConvGeometry::new(5, 5, 3, 1, 0).is_err());
        assert!(ConvGeometry::new(3, 3, 3, 1, 1).is_ok(), "window equal to input is valid");
    }

    #[test]
    fn test_index_mapping() {
        let g = geometry(5, 4, 3, 2, 3);
        // weight_base = oc*(k*k*ic_n) + ic*k*k, then ky*k + kx
        assert_eq!(g.weight_index(1, 1, 2, 0), 18 + 9 + 6);
        // input_base = ic*(W*H) + oy*W + ox, then ky*W + kx
        assert_eq!(g.input_index(1, 1, 2, 1, 2), 20 + 5 + 2 + 5 + 2);
        // out = 3x2 per channel
        assert_eq!(g.output_index(2, 1, 0), 2 * 6 + 3);
    }

    #[test]
    fn test_matches_reference_both_modes() {
        let g = geometry(6, 5, 3, 2, 3);
        let input: Vec<bool> = (0..g.in_size()).map(|i| (i * 7 + i / 4) % 3 == 0).collect();
        let weights: Vec<bool> = (0..g.weight_count()).map(|i| (i * 5 + 1) % 4 < 2).collect();
        let x = BitVector::from_bools(&input);
        let w = BitVector::from_bools(&weights);

        for mode in [AccumulationMode::Signed, AccumulationMode::Popcount] {
            let mut out = vec![0.0f32; g.out_size()];
            conv_accumulate(&x, &w, &g, mode, &mut out);
            assert_eq!(out, reference(&input, &weights, &g, mode), "mode {:?}", mode);
        }
    }

    #[test]
    fn test_single_window_all_match() {
        // 3x3 input, 3x3 kernel, 1 channel: one output equal to ±fan_in
        let g = geometry(3, 3, 3, 1, 1);
        let mut layer = BnnConvLayer::new(g, AccumulationMode::Signed);
        layer.synchronize(&FloatWeights::new(vec![1.0; 9])).unwrap();

        let mut ws = Workspace::new();
        assert_eq!(layer.forward_propagation(&[0.5; 9], &mut ws).unwrap(), vec![9.0]);
        assert_eq!(layer.forward_propagation(&[-0.5; 9], &mut ws).unwrap(), vec![-9.0]);

        let pop = BnnConvLayer::new(g, AccumulationMode::Popcount);
        // all weights false, all inputs true: no matches
        assert_eq!(pop.forward_propagation(&[1.0; 9], &mut ws).unwrap(), vec![0.0]);
    }

    #[test]
    fn test_topology() {
        let g = geometry(5, 5, 3, 2, 4);
        let layer = BnnConvLayer::new(g, AccumulationMode::Popcount);
        assert_eq!(layer.layer_type(), "bnn_conv_layer");
        assert_eq!(layer.in_data_size(), 50);
        assert_eq!(layer.out_data_size(), 36);
        assert_eq!(layer.fan_in_size(), 18);
        assert_eq!(layer.fan_out_size(), 36);
        assert_eq!(layer.connection_size(), 9 * 18);
        assert_eq!(layer.weights().len(), 72);
    }

    #[test]
    fn test_weight_bit_order() {
        let g = geometry(4, 4, 2, 2, 2);
        let mut layer = BnnConvLayer::new(g, AccumulationMode::Signed);
        let mut w = vec![-1.0f32; g.weight_count()];
        w[g.weight_index(1, 0, 1, 0)] = 1.0;
        layer.synchronize(&FloatWeights::new(w)).unwrap();

        assert!(layer.weight_bit(1, 0, 1, 0));
        assert_eq!(layer.weights().count_ones(), 1);
    }

    #[test]
    fn test_binary_file_constructor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conv.bin");
        let g = geometry(3, 3, 2, 1, 2);

        let mut bytes = Vec::new();
        for i in 0..g.weight_count() as u64 {
            // entries 0, 1, 2, 0, 1, 2, 0, 1: only exact 1s are set
            bytes.extend_from_slice(&(i % 3).to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();

        let layer = BnnConvLayer::from_binary_file(g, AccumulationMode::Popcount, &path).unwrap();
        let expected: Vec<bool> = (0..g.weight_count()).map(|i| i % 3 == 1).collect();
        assert_eq!(layer.weights().to_bools(), expected);

        let out = dir.path().join("copy.bin");
        layer.save_binary_weights(&out).unwrap();
        let copy = BnnConvLayer::from_binary_file(g, AccumulationMode::Popcount, &out).unwrap();
        assert_eq!(copy.weights(), layer.weights());
    }

    #[test]
    fn test_binary_file_missing() {
        let g = geometry(3, 3, 2, 1, 1);
        let dir = tempfile::tempdir().unwrap();
        let err = BnnConvLayer::from_binary_file(g, AccumulationMode::Signed, dir.path().join("nope.bin"))
            .err()
            .unwrap();
        assert!(matches!(err, BnnError::ResourceUnavailable { .. }), "got {:?}", err);
    }

    #[test]
    fn test_write_binary_weights_layout() {
        let g = geometry(2, 2, 1, 1, 2);
        let mut layer = BnnConvLayer::new(g, AccumulationMode::Signed);
        layer.synchronize(&FloatWeights::new(vec![0.0, -1.0])).unwrap();

        let mut buf = Vec::new();
        layer.write_binary_weights(&mut buf).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..8], &1u64.to_le_bytes());
        assert_eq!(&buf[8..], &0u64.to_le_bytes());
    }

    #[test]
    fn test_text_roundtrip() {
        let g = geometry(4, 3, 2, 2, 2);
        let mut layer = BnnConvLayer::new(g, AccumulationMode::Signed);
        let w: Vec<f32> = (0..g.weight_count()).map(|i| (i as f32 * 0.7).cos()).collect();
        layer.synchronize(&FloatWeights::new(w)).unwrap();

        let mut buf = Vec::new();
        layer.save(&mut buf).unwrap();
        let mut restored = BnnConvLayer::new(g, AccumulationMode::Signed);
        restored.load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(restored.weights(), layer.weights());
    }

    #[test]
    fn test_training_not_supported() {
        let layer = BnnConvLayer::new(geometry(3, 3, 3, 1, 1), AccumulationMode::Signed);
        assert!(matches!(
            layer.back_propagation(&[0.0]),
            Err(BnnError::CapabilityNotSupported { layer: "bnn_conv_layer", .. })
        ));
    }
}
