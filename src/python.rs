//! PyO3 Python Bindings for ALICE-BNN
//!
//! - GIL Release: forward passes run GIL-free
//! - NumPy in, NumPy out: inputs are read as contiguous `float32` slices
//! - One `Workspace` per Python object, reused across calls

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use numpy::{IntoPyArray, PyArray1, PyReadonlyArray1};
use pyo3::exceptions::{PyIOError, PyNotImplementedError, PyValueError};
use pyo3::prelude::*;

use crate::binarynet::BinaryNetLayer;
use crate::conv::{BnnConvLayer, ConvGeometry};
use crate::error::BnnError;
use crate::fc::BinarizedFcLayer;
use crate::kernel::AccumulationMode;
use crate::layer::{Layer, Workspace};
use crate::weights::FloatWeights;

fn to_py_err(err: BnnError) -> PyErr {
    match &err {
        BnnError::CapabilityNotSupported { .. } => PyNotImplementedError::new_err(err.to_string()),
        BnnError::ResourceUnavailable { .. } | BnnError::Io(_) => PyIOError::new_err(err.to_string()),
        _ => PyValueError::new_err(err.to_string()),
    }
}

fn float_weights(values: &PyReadonlyArray1<'_, f32>) -> PyResult<FloatWeights> {
    let slice = values.as_slice().map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(FloatWeights::new(slice.to_vec()))
}

fn forward<'py, L: Layer>(
    py: Python<'py>,
    layer: &L,
    workspace: &mut Workspace,
    input: PyReadonlyArray1<'py, f32>,
) -> PyResult<Bound<'py, PyArray1<f32>>> {
    let input_slice = input.as_slice().map_err(|e| PyValueError::new_err(e.to_string()))?;
    let result = py.detach(|| layer.forward_propagation(input_slice, workspace));
    Ok(result.map_err(to_py_err)?.into_pyarray(py))
}

fn save_text<L: Layer>(layer: &L, path: PathBuf) -> PyResult<()> {
    let file = File::create(&path)
        .map_err(|source| to_py_err(BnnError::ResourceUnavailable { path, source }))?;
    let mut writer = BufWriter::new(file);
    layer.save(&mut writer).map_err(to_py_err)?;
    writer.flush().map_err(|e| to_py_err(BnnError::Io(e)))
}

fn load_text<L: Layer>(layer: &mut L, path: PathBuf) -> PyResult<()> {
    let file = File::open(&path)
        .map_err(|source| to_py_err(BnnError::ResourceUnavailable { path, source }))?;
    layer.load(&mut BufReader::new(file)).map_err(to_py_err)
}

// ============================================================================
// BinarizedFcLayer
// ============================================================================

/// Fully-connected layer with sign-binarized weights and sign activation
#[pyclass(name = "BinarizedFcLayer")]
pub struct PyBinarizedFcLayer {
    inner: BinarizedFcLayer,
    workspace: Workspace,
}

#[pymethods]
impl PyBinarizedFcLayer {
    #[new]
    fn new(in_size: usize, out_size: usize) -> Self {
        Self { inner: BinarizedFcLayer::new(in_size, out_size), workspace: Workspace::new() }
    }

    #[getter]
    fn layer_type(&self) -> &'static str {
        self.inner.layer_type()
    }

    #[getter]
    fn in_size(&self) -> usize {
        self.inner.in_data_size()
    }

    #[getter]
    fn out_size(&self) -> usize {
        self.inner.out_data_size()
    }

    #[getter]
    fn connection_size(&self) -> usize {
        self.inner.connection_size()
    }

    /// Binarize float weights (`c * out_size + i` order).
    ///
    /// Returns `(positive_count, negative_count)`.
    fn synchronize(&mut self, weights: PyReadonlyArray1<'_, f32>) -> PyResult<(usize, usize)> {
        let stats = self.inner.synchronize(&float_weights(&weights)?).map_err(to_py_err)?;
        Ok((stats.positive_count, stats.negative_count))
    }

    /// Forward pass (GIL released). Output values are ±1.
    fn forward<'py>(
        &mut self,
        py: Python<'py>,
        input: PyReadonlyArray1<'py, f32>,
    ) -> PyResult<Bound<'py, PyArray1<f32>>> {
        forward(py, &self.inner, &mut self.workspace, input)
    }

    /// Save weight bits as text
    fn save(&self, path: PathBuf) -> PyResult<()> {
        save_text(&self.inner, path)
    }

    /// Load weight bits from text
    fn load(&mut self, path: PathBuf) -> PyResult<()> {
        load_text(&mut self.inner, path)
    }

    fn __repr__(&self) -> String {
        format!(
            "BinarizedFcLayer(in={}, out={})",
            self.inner.in_data_size(),
            self.inner.out_data_size()
        )
    }
}

// ============================================================================
// BinaryNetLayer
// ============================================================================

/// Fully-connected layer with batchnorm folded into popcount thresholds
#[pyclass(name = "BinaryNetLayer")]
pub struct PyBinaryNetLayer {
    inner: BinaryNetLayer,
    workspace: Workspace,
}

#[pymethods]
impl PyBinaryNetLayer {
    #[new]
    fn new(in_size: usize, out_size: usize) -> Self {
        Self { inner: BinaryNetLayer::new(in_size, out_size), workspace: Workspace::new() }
    }

    #[getter]
    fn layer_type(&self) -> &'static str {
        self.inner.layer_type()
    }

    #[getter]
    fn in_size(&self) -> usize {
        self.inner.in_data_size()
    }

    #[getter]
    fn out_size(&self) -> usize {
        self.inner.out_data_size()
    }

    #[getter]
    fn connection_size(&self) -> usize {
        self.inner.connection_size()
    }

    /// Popcount thresholds as int64
    #[getter]
    fn thresholds<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<i64>> {
        self.inner.thresholds().as_slice().to_vec().into_pyarray(py)
    }

    /// Binarize float weights (`c * out_size + i` order).
    ///
    /// Thresholds must be folded again afterwards.
    fn synchronize(&mut self, weights: PyReadonlyArray1<'_, f32>) -> PyResult<(usize, usize)> {
        let stats = self.inner.synchronize(&float_weights(&weights)?).map_err(to_py_err)?;
        Ok((stats.positive_count, stats.negative_count))
    }

    /// Fold one unit's batchnorm parameters.
    ///
    /// Returns `(threshold, flipped)`.
    fn set_threshold_from_batchnorm(
        &mut self,
        index: usize,
        mean: f32,
        gamma: f32,
        invstd: f32,
        beta: f32,
    ) -> PyResult<(i64, bool)> {
        let folded = self
            .inner
            .set_threshold_from_batchnorm(index, mean, gamma, invstd, beta)
            .map_err(to_py_err)?;
        Ok((folded.threshold, folded.flip))
    }

    /// Units whose threshold lies outside `[0, fan_in]`
    fn out_of_range_units(&self) -> Vec<usize> {
        self.inner.out_of_range_units()
    }

    /// Forward pass (GIL released). Output values are ±1.
    fn forward<'py>(
        &mut self,
        py: Python<'py>,
        input: PyReadonlyArray1<'py, f32>,
    ) -> PyResult<Bound<'py, PyArray1<f32>>> {
        forward(py, &self.inner, &mut self.workspace, input)
    }

    /// Save weight bits and thresholds as text
    fn save(&self, path: PathBuf) -> PyResult<()> {
        save_text(&self.inner, path)
    }

    /// Load weight bits and thresholds from text
    fn load(&mut self, path: PathBuf) -> PyResult<()> {
        load_text(&mut self.inner, path)
    }

    fn __repr__(&self) -> String {
        format!(
            "BinaryNetLayer(in={}, out={}, out_of_range={})",
            self.inner.in_data_size(),
            self.inner.out_data_size(),
            self.inner.out_of_range_units().len()
        )
    }
}

// ============================================================================
// BnnConvLayer
// ============================================================================

/// Binarized 2D convolution ("valid" padding, stride 1)
#[pyclass(name = "BnnConvLayer")]
pub struct PyBnnConvLayer {
    inner: BnnConvLayer,
    workspace: Workspace,
}

#[pymethods]
impl PyBnnConvLayer {
    #[new]
    #[pyo3(signature = (in_width, in_height, window_size, in_channels, out_channels, use_popcount=false, binary_param_file=None))]
    fn new(
        in_width: usize,
        in_height: usize,
        window_size: usize,
        in_channels: usize,
        out_channels: usize,
        use_popcount: bool,
        binary_param_file: Option<PathBuf>,
    ) -> PyResult<Self> {
        let geometry = ConvGeometry::new(in_width, in_height, window_size, in_channels, out_channels)
            .map_err(to_py_err)?;
        let mode = if use_popcount { AccumulationMode::Popcount } else { AccumulationMode::Signed };
        let inner = match binary_param_file {
            Some(path) => BnnConvLayer::from_binary_file(geometry, mode, path).map_err(to_py_err)?,
            None => BnnConvLayer::new(geometry, mode),
        };
        Ok(Self { inner, workspace: Workspace::new() })
    }

    #[getter]
    fn layer_type(&self) -> &'static str {
        self.inner.layer_type()
    }

    #[getter]
    fn in_size(&self) -> usize {
        self.inner.in_data_size()
    }

    #[getter]
    fn out_size(&self) -> usize {
        self.inner.out_data_size()
    }

    #[getter]
    fn out_width(&self) -> usize {
        self.inner.geometry().out_width()
    }

    #[getter]
    fn out_height(&self) -> usize {
        self.inner.geometry().out_height()
    }

    /// Binarize float weights (`(oc, ic, ky, kx)` order)
    fn synchronize(&mut self, weights: PyReadonlyArray1<'_, f32>) -> PyResult<(usize, usize)> {
        let stats = self.inner.synchronize(&float_weights(&weights)?).map_err(to_py_err)?;
        Ok((stats.positive_count, stats.negative_count))
    }

    /// Forward pass (GIL released). Output values are raw accumulators.
    fn forward<'py>(
        &mut self,
        py: Python<'py>,
        input: PyReadonlyArray1<'py, f32>,
    ) -> PyResult<Bound<'py, PyArray1<f32>>> {
        forward(py, &self.inner, &mut self.workspace, input)
    }

    /// Load weights from a fixed-width binary file
    fn load_binary(&mut self, path: PathBuf) -> PyResult<()> {
        self.inner.load_binary_weights(path).map_err(to_py_err)
    }

    /// Save weights to a fixed-width binary file
    fn save_binary(&self, path: PathBuf) -> PyResult<()> {
        self.inner.save_binary_weights(path).map_err(to_py_err)
    }

    /// Save weight bits as text
    fn save(&self, path: PathBuf) -> PyResult<()> {
        save_text(&self.inner, path)
    }

    /// Load weight bits from text
    fn load(&mut self, path: PathBuf) -> PyResult<()> {
        load_text(&mut self.inner, path)
    }

    fn __repr__(&self) -> String {
        let g = self.inner.geometry();
        format!(
            "BnnConvLayer({}x{}x{} -> {}x{}x{}, k={}, mode={:?})",
            g.in_channels(),
            g.in_height(),
            g.in_width(),
            g.out_channels(),
            g.out_height(),
            g.out_width(),
            g.window_size(),
            self.inner.mode()
        )
    }
}

// ============================================================================
// Module
// ============================================================================

/// Python module entry point
#[pymodule]
pub fn alice_bnn(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyBinarizedFcLayer>()?;
    m.add_class::<PyBinaryNetLayer>()?;
    m.add_class::<PyBnnConvLayer>()?;
    m.add("__version__", crate::VERSION)?;
    Ok(())
}
