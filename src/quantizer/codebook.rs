//! The learned codeword table and nearest-codeword lookup.

use candle_core::{D, Device, Tensor, Var};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{Error, Result};

/// An ordered table of `codebook_size` codewords of `embedding_dim` each.
///
/// The weights live in a [`Var`] so the EMA optimizer can rewrite them in
/// place through a shared handle; they are never registered with a
/// gradient-based optimizer, and the quantizer's straight-through output
/// routes no gradient to them.
#[derive(Debug, Clone)]
pub struct Codebook {
    weight: Var,
    codebook_size: usize,
    embedding_dim: usize,
}

impl Codebook {
    /// Initialize with unit-Gaussian codewords drawn from a seeded stream.
    ///
    /// Distributed workers constructing with the same seed start from
    /// identical codebooks.
    pub fn randn(
        codebook_size: usize,
        embedding_dim: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if codebook_size == 0 || embedding_dim == 0 {
            return Err(Error::Config(format!(
                "codebook dimensions must be nonzero, got {codebook_size}x{embedding_dim}"
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let weight = gaussian(&mut rng, &[codebook_size, embedding_dim], device)?;
        Self::from_tensor(weight)
    }

    /// Wrap an existing `(codebook_size, embedding_dim)` weight tensor.
    pub fn from_tensor(weight: Tensor) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(Error::Config(format!(
                "codebook weight must be 2-D (codebook_size, embedding_dim), got {dims:?}"
            )));
        }
        let (codebook_size, embedding_dim) = (dims[0], dims[1]);
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            codebook_size,
            embedding_dim,
        })
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// The shared weight handle. Mutating it through [`Var::set`] is
    /// visible to every clone of this codebook.
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Index of the nearest codeword (squared Euclidean) per query row.
    ///
    /// `queries` is `(n, embedding_dim)`; the result is `(n,)` `u32`. Ties
    /// resolve to the lowest index. Only the relative distances matter for
    /// the argmin, so the constant `||x||²` term is dropped:
    /// `argmin_e ||x - e||² = argmin_e (||e||²/2 - x·e)`.
    pub fn lookup(&self, queries: &Tensor) -> Result<Tensor> {
        let dims = queries.dims();
        if dims.len() != 2 || dims[1] != self.embedding_dim {
            return Err(Error::Config(format!(
                "lookup queries must be (n, {}), got {dims:?}",
                self.embedding_dim
            )));
        }
        let weight = self.weight.as_tensor();
        let half_sq_norms = weight.sqr()?.sum(D::Minus1)?.affine(0.5, 0.)?;
        let dot = queries.matmul(&weight.t()?)?;
        let scores = half_sq_norms.broadcast_sub(&dot)?;
        Ok(scores.argmin(D::Minus1)?)
    }

    /// Fetch the codewords for a flat `(n,)` index tensor.
    pub fn decode(&self, indices: &Tensor) -> Result<Tensor> {
        Ok(self.weight.as_tensor().index_select(indices, 0)?)
    }
}

/// Draw a standard-normal tensor from a seeded ChaCha stream.
pub(crate) fn gaussian(rng: &mut ChaCha8Rng, shape: &[usize], device: &Device) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count)
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Ok(Tensor::from_vec(data, shape.to_vec(), device)?)
}
