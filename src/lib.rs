//! ALICE-BNN: Binarized (XNOR) Neural Network Inference Layers
//!
//! > "Multiplication is expensive. Agreement is all you need."
//!
//! Inference-only layers for networks whose weights and activations are both
//! reduced to a single sign bit:
//! - **No multiplication** → two ±1 values multiply to +1 exactly when their
//!   sign bits agree, so inner products become XNOR + popcount
//! - **No batchnorm at runtime** → batchnorm + sign folds into one integer
//!   threshold per neuron
//! - **No scratch allocation in steady state** → DPS kernels over a
//!   caller-owned [`Workspace`]
//!
//! # Layers
//!
//! | Layer | `layer_type()` | Output |
//! |-------|----------------|--------|
//! | [`BinarizedFcLayer`] | `binarized-fully-connected` | activation of `2·matches − fan_in` |
//! | [`BinaryNetLayer`] | `binarynet-fully-connected` | `matches ≥ threshold ? +1 : −1` |
//! | [`BnnConvLayer`] | `bnn_conv_layer` | raw accumulator per output position |
//!
//! # Example
//!
//! ```rust
//! use alice_bnn::{BinaryNetLayer, FloatWeights, Layer, Workspace};
//!
//! // 4 inputs, 2 outputs; float weights in `c * out + i` order
//! let weights = FloatWeights::new(vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0]);
//! let mut layer = BinaryNetLayer::new(4, 2);
//! layer.synchronize(&weights).unwrap();
//!
//! // batchnorm crossing at a signed accumulator of 2 → popcount threshold 3
//! layer.set_threshold_from_batchnorm(0, 2.0, 1.0, 1.0, 0.0).unwrap();
//! layer.set_threshold_from_batchnorm(1, 2.0, 1.0, 1.0, 0.0).unwrap();
//!
//! let mut ws = Workspace::new();
//! let out = layer.forward_propagation(&[0.5, 1.0, 2.0, -1.0], &mut ws).unwrap();
//! assert_eq!(out, vec![1.0, -1.0]);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          ALICE-BNN                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  synchronize   ┌──────────────────────────┐   │
//! │  │ FloatWeights │───────────────▶│ BitMatrix / BitVector    │   │
//! │  │ (versioned)  │  (v ≥ 0 → 1)   │ (u64 words per unit)     │   │
//! │  └──────────────┘                └──────────────────────────┘   │
//! │                                             │                   │
//! │  ┌──────────────┐  fold_batchnorm           │                   │
//! │  │ mean, gamma, │─────────────▶ ThresholdVector + column flip   │
//! │  │ invstd, beta │                           │                   │
//! │  └──────────────┘                           ▼                   │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │        XNOR Kernels (Destination Passing Style)          │   │
//! │  │  signed:   acc = 2·popcount(!(w ^ x)) − fan_in           │   │
//! │  │  popcount: out = popcount(!(w ^ x)) ≥ t ? +1 : −1        │   │
//! │  │  conv:     same rule over (oc, ic, ky, kx) windows       │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                          │                                      │
//! │                          ▼                                      │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  Layer trait: forward_propagation → next layer → ...     │   │
//! │  │  MatVecOffload: optional accelerator for binarynet       │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod binarynet;
pub mod bits;
pub mod codec;
pub mod conv;
pub mod encode;
pub mod error;
pub mod fc;
pub mod kernel;
pub mod layer;
pub mod offload;
pub mod threshold;
pub mod weights;

#[cfg(feature = "pyo3")]
pub mod python;

// ============================================================================
// Core Re-exports
// ============================================================================

pub use error::{BnnError, Result};

// Bit storage
pub use bits::{
    BitMatrix, // Per-unit packed rows
    BitVector, // Packed sign bits
};

// Encoding and weights
pub use encode::{encode, float_to_bipolar, SignStats};
pub use weights::FloatWeights;

// Threshold folding
pub use threshold::{fold_batchnorm, FoldedThreshold, ThresholdVector};

// DPS kernels (the hot path)
pub use kernel::{
    threshold_activate,
    xnor_matvec_popcount,
    xnor_matvec_signed,
    xnor_matvec_threshold,
    AccumulationMode,
};

// Layers
pub use binarynet::BinaryNetLayer;
pub use conv::{conv_accumulate, BnnConvLayer, ConvGeometry};
pub use fc::BinarizedFcLayer;
pub use layer::{Activation, Identity, Layer, Sign, Workspace};
pub use offload::{MatVecOffload, SoftwareOffload};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Prelude
// ============================================================================

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AccumulationMode, BinarizedFcLayer, BinaryNetLayer, BnnConvLayer, BnnError, ConvGeometry,
        FloatWeights, Layer, Workspace,
    };
}

// ============================================================================
// Tests
// ============================================================================
