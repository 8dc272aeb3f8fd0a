//! Vector quantization layers.
//!
//! ## Components
//!
//! - [`codebook`] — the learned codeword table and nearest-codeword lookup
//! - [`vq`] — single-stage quantizer with straight-through gradients
//! - [`rvq`] — residual (multi-stage) quantizer
//!
//! Quantizers return a [`Quantization`] carrying the straight-through
//! output, the assignment indices, and the raw per-stage assignment data
//! ([`BatchAssignments`]) that orchestration code hands to the EMA
//! optimizer between the forward pass and `step()`.

pub mod codebook;
pub mod rvq;
pub mod vq;

pub use codebook::Codebook;
pub use rvq::ResidualVectorQuantizer;
pub use vq::VectorQuantizer;

use candle_core::Tensor;

use crate::{Error, Result};

/// Output of a quantize call.
///
/// For the single-stage quantizer, `quantized` has the input's shape
/// `(batch, embedding_dim, *spatial)` and `indices` drops the embedding
/// axis. For the residual quantizer both are stacked with the stage
/// dimension first.
#[derive(Debug, Clone)]
pub struct Quantization {
    /// Input with each vector replaced by its nearest codeword.
    ///
    /// Behaves as the identity for backpropagation (straight-through): the
    /// gradient flows to the quantizer's input unchanged and the codebook
    /// receives none.
    pub quantized: Tensor,

    /// Selected codeword index per position, `u32` in `[0, codebook_size)`.
    pub indices: Tensor,

    /// Raw assignment data for the EMA optimizer.
    pub assignments: BatchAssignments,
}

/// Assignment data for one quantizer stage: which codeword each position
/// chose, and the (pre-quantization) vectors that chose it.
#[derive(Debug, Clone)]
pub struct StageAssignments {
    /// Indices as returned by the lookup, shape `(batch, *spatial)`.
    pub indices: Tensor,

    /// The stage's input, shape `(batch, embedding_dim, *spatial)`,
    /// detached from the autograd graph. For residual stages this is the
    /// running residual that stage actually quantized, not the top-level
    /// input.
    pub input: Tensor,
}

/// Per-stage assignment data captured by one forward pass.
///
/// One slot per configured stage; `None` marks a stage skipped by stage
/// dropout, which therefore contributes no statistics for that pass.
#[derive(Debug, Clone)]
pub struct BatchAssignments {
    pub(crate) stages: Vec<Option<StageAssignments>>,
}

impl BatchAssignments {
    pub(crate) fn single(stage: StageAssignments) -> Self {
        Self {
            stages: vec![Some(stage)],
        }
    }

    pub(crate) fn from_stages(stages: Vec<Option<StageAssignments>>) -> Self {
        Self { stages }
    }

    /// Total number of configured stages (recorded or skipped).
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Assignment data for stage `k`, `None` if it was skipped.
    pub fn stage(&self, k: usize) -> Option<&StageAssignments> {
        self.stages.get(k).and_then(|s| s.as_ref())
    }

    /// Indices of the stages that actually ran.
    pub fn active_stages(&self) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter_map(|(k, s)| s.as_ref().map(|_| k))
            .collect()
    }
}

/// Capability interface the EMA optimizer tracks codebooks through.
///
/// Both quantizer variants implement it, so the optimizer never needs to
/// know which concrete module backs the statistics.
pub trait TrackedCodebooks {
    /// The codebooks to be EMA-trained, in stage order.
    fn codebooks(&self) -> Vec<&Codebook>;
}

/// Flatten `(batch, embedding_dim, *spatial)` to per-position rows
/// `(batch * spatial, embedding_dim)`.
///
/// Returns the flattened rows together with the original dims so callers
/// can reassemble outputs.
pub(crate) fn flatten_positions(input: &Tensor) -> Result<(Tensor, Vec<usize>)> {
    let dims = input.dims().to_vec();
    if dims.len() < 2 {
        return Err(Error::Config(format!(
            "expected input of shape (batch, embedding_dim, ...), got {dims:?}"
        )));
    }
    let (batch, dim) = (dims[0], dims[1]);
    let positions: usize = dims[2..].iter().product();
    let flat = input
        .reshape((batch, dim, positions))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch * positions, dim))?;
    Ok((flat, dims))
}

/// Inverse of [`flatten_positions`] for per-position rows.
pub(crate) fn unflatten_positions(rows: &Tensor, dims: &[usize]) -> Result<Tensor> {
    let (batch, dim) = (dims[0], dims[1]);
    let positions: usize = dims[2..].iter().product();
    let out = rows
        .reshape((batch, positions, dim))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape(dims.to_vec())?;
    Ok(out)
}
