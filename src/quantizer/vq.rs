//! Single-stage vector quantizer.

use candle_core::{Device, Tensor};

use super::{
    flatten_positions, unflatten_positions, BatchAssignments, Codebook, Quantization,
    StageAssignments, TrackedCodebooks,
};
use crate::config::VectorQuantizerConfig;
use crate::{Error, Result};

/// Quantizes `(batch, embedding_dim, *spatial)` inputs against a single
/// codebook, replacing every position's vector with its nearest codeword.
///
/// The quantized output uses the straight-through estimator
/// `input + (codewords - input).detach()`: forward value is the codeword,
/// backward gradient is the identity into the input. The codebook is
/// trained separately by the EMA optimizer from the returned assignments.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    codebook: Codebook,
}

impl VectorQuantizer {
    pub fn new(config: &VectorQuantizerConfig, device: &Device) -> Result<Self> {
        let codebook = Codebook::randn(
            config.codebook_size,
            config.embedding_dim,
            config.seed,
            device,
        )?;
        Ok(Self { codebook })
    }

    /// Build around an existing codebook (e.g. restored weights).
    pub fn from_codebook(codebook: Codebook) -> Self {
        Self { codebook }
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    /// Quantize a `(batch, embedding_dim, *spatial)` tensor.
    ///
    /// Fails with [`Error::Config`] when the channel dim does not match
    /// the codebook's embedding dim.
    pub fn quantize(&self, input: &Tensor) -> Result<Quantization> {
        let (quantized, indices, stage) = self.quantize_stage(input)?;
        Ok(Quantization {
            quantized,
            indices,
            assignments: BatchAssignments::single(stage),
        })
    }

    pub(crate) fn quantize_stage(
        &self,
        input: &Tensor,
    ) -> Result<(Tensor, Tensor, StageAssignments)> {
        let dims = input.dims();
        if dims.len() >= 2 && dims[1] != self.codebook.embedding_dim() {
            return Err(Error::Config(format!(
                "input embedding dim {} does not match codebook dim {}",
                dims[1],
                self.codebook.embedding_dim()
            )));
        }

        let (flat, dims) = flatten_positions(input)?;
        let flat_indices = self.codebook.lookup(&flat)?;
        let codewords = self.codebook.decode(&flat_indices)?;
        let codewords = unflatten_positions(&codewords, &dims)?;

        // Straight-through: forward value is the codeword, gradient is the
        // identity into `input`; the codebook stays out of the graph.
        let quantized = (input + (codewords - input)?.detach())?;

        let mut index_dims = vec![dims[0]];
        index_dims.extend_from_slice(&dims[2..]);
        let indices = flat_indices.reshape(index_dims)?;

        let stage = StageAssignments {
            indices: indices.clone(),
            input: input.detach(),
        };

        Ok((quantized, indices, stage))
    }
}

impl TrackedCodebooks for VectorQuantizer {
    fn codebooks(&self) -> Vec<&Codebook> {
        vec![&self.codebook]
    }
}
