//! Serializable optimizer state.
//!
//! Tensors are stored as shape + flat data so state dicts serialize with
//! plain serde (JSON on disk). Fields added after the first release carry
//! `#[serde(default)]` so older saved states load with sensible
//! default-fill instead of failing.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A float tensor flattened for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        Ok(Self { shape, data })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.data.clone(),
            self.shape.clone(),
            device,
        )?)
    }
}

/// An unsigned-integer tensor flattened for serialization (usage counts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTensorData {
    pub shape: Vec<usize>,
    pub data: Vec<u32>,
}

impl CountTensorData {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data = tensor.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?;
        Ok(Self { shape, data })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.data.clone(),
            self.shape.clone(),
            device,
        )?)
    }
}

/// Persisted state of an [`EmaCodebookOptimizer`].
///
/// Per-codebook vectors are index-aligned: entry `k` everywhere refers to
/// tracked codebook `k`.
///
/// [`EmaCodebookOptimizer`]: crate::optim::EmaCodebookOptimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaCodebookState {
    /// Codebook weights, one per tracked codebook.
    pub codebooks: Vec<TensorData>,

    /// Smoothed per-codeword assignment counts.
    pub num_samples_tracked: Vec<TensorData>,

    /// Smoothed per-codeword vector sums.
    pub momentum: Vec<TensorData>,

    /// Absent in older saves; the live value is kept when missing.
    #[serde(default)]
    pub smooth: Option<f64>,

    /// Absent in older saves; the live value is kept when missing.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Absent in older saves; the live value is kept when missing.
    #[serde(default)]
    pub iteration: Option<u64>,

    /// Only present when the dead-codeword reset is enabled.
    #[serde(default)]
    pub reset: Option<ResetStateData>,
}

/// Persisted dead-codeword reset state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetStateData {
    pub step: u64,
    pub var: f64,
    pub rate: f64,
    pub accumulated_steps: u64,
    pub num_accumulated: Vec<CountTensorData>,
}

impl EmaCodebookState {
    /// Write the state as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Read a state previously written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

/// Persisted state of a [`MovingAverageWrapper`]: the shadow parameters
/// and the smoothing factor. The wrapped optimizer's own state is not
/// serializable through candle and is reconstructed by the caller.
///
/// [`MovingAverageWrapper`]: crate::optim::MovingAverageWrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovingAverageState {
    pub shadow: Vec<TensorData>,

    /// Absent in older saves; the live value is kept when missing.
    #[serde(default)]
    pub smooth: Option<f64>,
}

/// Check that a loaded group has the same cardinality as the live one.
pub(crate) fn ensure_group_len(what: &str, live: usize, saved: usize) -> Result<()> {
    if live != saved {
        return Err(Error::StateDict(format!(
            "loaded state has {saved} {what} entries, optimizer tracks {live}"
        )));
    }
    Ok(())
}

/// Check that a loaded tensor has the shape of its live counterpart.
pub(crate) fn ensure_shape(what: &str, index: usize, live: &[usize], saved: &[usize]) -> Result<()> {
    if live != saved {
        return Err(Error::StateDict(format!(
            "{what}[{index}] shape mismatch: saved {saved:?}, live {live:?}"
        )));
    }
    Ok(())
}
