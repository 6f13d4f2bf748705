//! Error types for binarized layers

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Binarized-layer error type
#[derive(Debug, Error)]
pub enum BnnError {
    /// The layer is inference-only; gradient propagation is not implemented
    #[error("{layer}: {operation} is not supported (inference-only layer)")]
    CapabilityNotSupported {
        /// Layer type identifier
        layer: &'static str,
        /// Rejected operation
        operation: &'static str,
    },

    /// A required parameter file could not be opened
    #[error("could not open {}: {}", path.display(), source)]
    ResourceUnavailable {
        /// File that failed to open
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Persisted state does not have the expected shape or content
    #[error("malformed {context}: {detail}")]
    Malformed {
        /// What was being read
        context: &'static str,
        /// What was wrong with it
        detail: String,
    },

    /// A vector or tensor has the wrong number of elements
    #[error("{context}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        /// Which vector
        context: &'static str,
        /// Required length
        expected: usize,
        /// Provided length
        actual: usize,
    },

    /// Convolution geometry cannot produce a valid output
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Output unit index past the end of the layer
    #[error("unit index {index} out of range (fan-out {len})")]
    IndexOutOfRange {
        /// Requested unit
        index: usize,
        /// Number of units
        len: usize,
    },

    /// gamma * invstd is zero, or the folded threshold is not finite
    #[error("degenerate batchnorm parameters for unit {index}")]
    DegenerateBatchNorm {
        /// Unit being folded
        index: usize,
    },

    /// Some folded thresholds lie outside `[0, fan_in]`
    #[error("{} threshold(s) outside [0, {}]", units.len(), fan_in)]
    ThresholdOutOfRange {
        /// Offending units
        units: Vec<usize>,
        /// Fan-in of the layer
        fan_in: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BnnError {
    pub(crate) fn training(layer: &'static str, operation: &'static str) -> Self {
        BnnError::CapabilityNotSupported { layer, operation }
    }

    pub(crate) fn malformed(context: &'static str, detail: impl Into<String>) -> Self {
        BnnError::Malformed { context, detail: detail.into() }
    }
}

/// Result type for binarized-layer operations
pub type Result<T> = std::result::Result<T, BnnError>;

/// Fail with [`BnnError::ShapeMismatch`] unless `actual == expected`.
#[inline]
pub(crate) fn ensure_len(context: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(BnnError::ShapeMismatch { context, expected, actual })
    }
}
