//! Residual (multi-stage) vector quantizer.

use candle_core::{Device, Tensor};

use super::{BatchAssignments, Codebook, Quantization, TrackedCodebooks, VectorQuantizer};
use crate::config::{ResidualVectorQuantizerConfig, VectorQuantizerConfig};
use crate::{Error, Result};

/// Chains independent single-stage quantizers: each stage quantizes the
/// residual left by the stages before it, producing a coarse-to-fine
/// hierarchical code.
///
/// The aggregate reconstruction is the sum of the per-stage quantized
/// outputs; callers needing it sum over the stage dimension themselves.
/// Stages share `embedding_dim` but may be independently sized.
#[derive(Debug, Clone)]
pub struct ResidualVectorQuantizer {
    stages: Vec<VectorQuantizer>,
}

impl ResidualVectorQuantizer {
    pub fn new(config: &ResidualVectorQuantizerConfig, device: &Device) -> Result<Self> {
        if config.codebook_sizes.is_empty() {
            return Err(Error::Config(
                "residual quantizer needs at least one stage".to_string(),
            ));
        }
        let stages = config
            .codebook_sizes
            .iter()
            .enumerate()
            .map(|(k, &codebook_size)| {
                VectorQuantizer::new(
                    &VectorQuantizerConfig {
                        codebook_size,
                        embedding_dim: config.embedding_dim,
                        seed: config.seed + k as u64,
                    },
                    device,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// Build from pre-constructed stages (e.g. restored codebooks).
    pub fn from_stages(stages: Vec<VectorQuantizer>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::Config(
                "residual quantizer needs at least one stage".to_string(),
            ));
        }
        let dim = stages[0].codebook().embedding_dim();
        if stages.iter().any(|s| s.codebook().embedding_dim() != dim) {
            return Err(Error::Config(
                "all residual stages must share the embedding dim".to_string(),
            ));
        }
        Ok(Self { stages })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, k: usize) -> Option<&VectorQuantizer> {
        self.stages.get(k)
    }

    /// Quantize through every stage.
    ///
    /// `quantized` is `(num_stages, batch, embedding_dim, *spatial)` and
    /// `indices` is `(num_stages, batch, *spatial)`, stage dimension
    /// first.
    pub fn quantize(&self, input: &Tensor) -> Result<Quantization> {
        let all: Vec<usize> = (0..self.stages.len()).collect();
        self.quantize_stages(input, &all)
    }

    /// Quantize through a subset of stages (stage dropout).
    ///
    /// Stages run in ascending order regardless of the order given;
    /// skipped stages leave the residual untouched and produce no
    /// assignment statistics, which the returned
    /// [`BatchAssignments`] records as `None` slots. The stacked outputs
    /// contain only the active stages, in stage order.
    pub fn quantize_stages(&self, input: &Tensor, active: &[usize]) -> Result<Quantization> {
        if active.is_empty() {
            return Err(Error::Config(
                "at least one active stage is required".to_string(),
            ));
        }
        let mut run = vec![false; self.stages.len()];
        for &k in active {
            if k >= self.stages.len() {
                return Err(Error::Config(format!(
                    "active stage {k} out of range for {} stages",
                    self.stages.len()
                )));
            }
            if run[k] {
                return Err(Error::Config(format!("active stage {k} listed twice")));
            }
            run[k] = true;
        }

        let mut residual = input.clone();
        let mut stage_assignments = Vec::with_capacity(self.stages.len());
        let mut quantized = Vec::with_capacity(active.len());
        let mut indices = Vec::with_capacity(active.len());

        for (stage, run) in self.stages.iter().zip(run) {
            if !run {
                stage_assignments.push(None);
                continue;
            }
            let (stage_quantized, stage_indices, assignments) = stage.quantize_stage(&residual)?;
            residual = (&residual - &stage_quantized)?;
            stage_assignments.push(Some(assignments));
            quantized.push(stage_quantized);
            indices.push(stage_indices);
        }

        Ok(Quantization {
            quantized: Tensor::stack(&quantized, 0)?,
            indices: Tensor::stack(&indices, 0)?,
            assignments: BatchAssignments::from_stages(stage_assignments),
        })
    }
}

impl TrackedCodebooks for ResidualVectorQuantizer {
    fn codebooks(&self) -> Vec<&Codebook> {
        self.stages.iter().map(|s| s.codebook()).collect()
    }
}
