//! Python bindings for the AEDAT 3.1 decoder and frame integrator with numpy
//! output.
//!
//! Decoded events are exposed as columnar numpy arrays, frame stacks as
//! `[T, 2, H, W]` `uint32` arrays.

use dvsframe_core::{
    pad_frame_stacks, AedatDecoder, DatasetAssembler, DatasetConfig, DecodeOptions, Event,
    FrameIntegrator, FrameStack, WindowPolicy,
};
use numpy::{IntoPyArray, PyArray1, PyArray4, PyArray5, PyReadonlyArray4};
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::path::PathBuf;

/// Container for decoded polarity events with numpy access.
///
/// The data is stored in columnar format (separate arrays for t, x, y, p).
#[pyclass]
pub struct Events {
    /// Timestamps in microseconds
    t: Vec<u64>,
    x: Vec<u16>,
    y: Vec<u16>,
    /// Polarities, 0 or 1
    p: Vec<u8>,
}

#[pymethods]
impl Events {
    fn __len__(&self) -> usize {
        self.t.len()
    }

    fn __repr__(&self) -> String {
        match (self.t.first(), self.t.last()) {
            (Some(first), Some(last)) => {
                format!("Events(count={}, t=[{}, {}])", self.t.len(), first, last)
            }
            _ => "Events(count=0)".to_string(),
        }
    }

    /// Returns the timestamps as a numpy array (in microseconds).
    #[getter]
    fn t<'py>(&self, py: Python<'py>) -> &'py PyArray1<u64> {
        self.t.clone().into_pyarray(py)
    }

    /// Returns the X coordinates as a numpy array.
    #[getter]
    fn x<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.x.clone().into_pyarray(py)
    }

    /// Returns the Y coordinates as a numpy array.
    #[getter]
    fn y<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.y.clone().into_pyarray(py)
    }

    /// Returns the polarities as a numpy array.
    #[getter]
    fn p<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.p.clone().into_pyarray(py)
    }

    /// Returns all arrays as a dictionary keyed t, x, y, p.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        dict.set_item("t", self.t.clone().into_pyarray(py))?;
        dict.set_item("x", self.x.clone().into_pyarray(py))?;
        dict.set_item("y", self.y.clone().into_pyarray(py))?;
        dict.set_item("p", self.p.clone().into_pyarray(py))?;
        Ok(dict.into())
    }
}

impl Events {
    fn from_events(events: Vec<Event>) -> Self {
        let len = events.len();
        let mut t = Vec::with_capacity(len);
        let mut x = Vec::with_capacity(len);
        let mut y = Vec::with_capacity(len);
        let mut p = Vec::with_capacity(len);

        for event in events {
            t.push(event.t);
            x.push(event.x);
            y.push(event.y);
            p.push(event.p);
        }

        Self { t, x, y, p }
    }

    fn to_events(&self) -> Vec<Event> {
        self.t
            .iter()
            .zip(&self.x)
            .zip(&self.y)
            .zip(&self.p)
            .map(|(((&t, &x), &y), &p)| Event::new(t, x, y, p))
            .collect()
    }
}

fn value_error<E: std::fmt::Display>(e: E) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Decodes an AEDAT 3.1 file and returns its polarity events.
///
/// Args:
///     path: Path to the .aedat file
///     skip_invalid: Drop events whose validity bit is cleared
///
/// Returns:
///     Events: Container with t, x, y and p arrays
///
/// Example:
///     >>> import dvsframe
///     >>> events = dvsframe.decode_file("user01_fluorescent.aedat")
///     >>> print(f"Decoded {len(events)} events")
#[pyfunction]
#[pyo3(signature = (path, skip_invalid=false))]
fn decode_file(py: Python<'_>, path: &str, skip_invalid: bool) -> PyResult<Py<Events>> {
    let path = PathBuf::from(path);

    let mut decoder = AedatDecoder::with_options(DecodeOptions { skip_invalid });
    let result = py
        .allow_threads(|| decoder.decode_file(&path))
        .map_err(|e| PyIOError::new_err(format!("Failed to decode file: {}", e)))?;

    Py::new(py, Events::from_events(result.events))
}

/// Decodes AEDAT 3.1 data already in memory.
///
/// Args:
///     data: Complete file contents, header included
///
/// Returns:
///     Events: Container with decoded events
#[pyfunction]
#[pyo3(signature = (data, skip_invalid=false))]
fn decode_bytes(py: Python<'_>, data: &[u8], skip_invalid: bool) -> PyResult<Py<Events>> {
    let mut decoder = AedatDecoder::with_options(DecodeOptions { skip_invalid });
    let result = decoder
        .decode_bytes(data)
        .map_err(|e| PyValueError::new_err(format!("Failed to decode data: {}", e)))?;

    Py::new(py, Events::from_events(result.events))
}

/// Integrates events into a `[T, 2, H, W]` uint32 frame stack.
///
/// Args:
///     events: Events returned by decode_file or decode_bytes
///     policy: "number:N", "time:N" or "duration:US"
///     height: Sensor height in pixels (default: 128)
///     width: Sensor width in pixels (default: 128)
///
/// Example:
///     >>> frames = dvsframe.integrate(events, "number:20")
///     >>> frames.shape
///     (20, 2, 128, 128)
#[pyfunction]
#[pyo3(signature = (events, policy, height=128, width=128))]
fn integrate<'py>(
    py: Python<'py>,
    events: PyRef<'_, Events>,
    policy: &str,
    height: usize,
    width: usize,
) -> PyResult<&'py PyArray4<u32>> {
    let policy: WindowPolicy = policy.parse().map_err(value_error)?;
    let integrator = FrameIntegrator::new(height, width).map_err(value_error)?;
    let events = events.to_events();

    let stack = py
        .allow_threads(|| integrator.integrate(&events, &policy))
        .map_err(value_error)?;
    Ok(stack.into_array().into_pyarray(py))
}

/// Pads frame stacks with trailing zero frames to the longest one.
///
/// Args:
///     stacks: List of `[T_i, 2, H, W]` uint32 arrays of equal frame size
///
/// Returns:
///     tuple: (`[S, T_max, 2, H, W]` uint32 array, valid lengths as uint64 array)
#[pyfunction]
fn pad<'py>(
    py: Python<'py>,
    stacks: Vec<PyReadonlyArray4<'py, u32>>,
) -> PyResult<(&'py PyArray5<u32>, &'py PyArray1<u64>)> {
    let stacks = stacks
        .iter()
        .map(|stack| FrameStack::new(stack.as_array().to_owned()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(value_error)?;

    let batch = pad_frame_stacks(&stacks).map_err(value_error)?;
    let (frames, lengths) = batch.into_parts();
    let lengths: Vec<u64> = lengths.into_iter().map(|len| len as u64).collect();
    Ok((frames.into_pyarray(py), lengths.into_pyarray(py)))
}

/// Builds a frame dataset from a directory of labeled recordings.
///
/// Returns:
///     dict: train_samples, test_samples, frames_per_sample, failed
#[pyfunction]
#[pyo3(signature = (dataset_root, output_root, policy="number:20", height=128, width=128, workers=None, collections=false))]
#[allow(clippy::too_many_arguments)]
fn build_dataset(
    py: Python<'_>,
    dataset_root: &str,
    output_root: &str,
    policy: &str,
    height: usize,
    width: usize,
    workers: Option<usize>,
    collections: bool,
) -> PyResult<PyObject> {
    let config = DatasetConfig {
        dataset_root: PathBuf::from(dataset_root),
        output_root: PathBuf::from(output_root),
        policy: policy.parse().map_err(value_error)?,
        height,
        width,
        max_workers: workers,
        write_collections: collections,
        ..Default::default()
    };
    let assembler = DatasetAssembler::new(config).map_err(value_error)?;
    let summary = py
        .allow_threads(|| assembler.run())
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;

    let failed: Vec<(String, String)> = summary
        .failures
        .iter()
        .map(|f| (f.path.display().to_string(), f.error.clone()))
        .collect();
    let dict = PyDict::new(py);
    dict.set_item("train_samples", summary.train_samples)?;
    dict.set_item("test_samples", summary.test_samples)?;
    dict.set_item("frames_per_sample", summary.frames_per_sample)?;
    dict.set_item("samples_per_label", summary.samples_per_label.clone())?;
    dict.set_item("failed", failed)?;
    Ok(dict.into())
}

/// AEDAT 3.1 decoding and frame integration for Python.
#[pymodule]
fn dvsframe(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_file, m)?)?;
    m.add_function(wrap_pyfunction!(decode_bytes, m)?)?;
    m.add_function(wrap_pyfunction!(integrate, m)?)?;
    m.add_function(wrap_pyfunction!(pad, m)?)?;
    m.add_function(wrap_pyfunction!(build_dataset, m)?)?;
    m.add_class::<Events>()?;
    Ok(())
}
