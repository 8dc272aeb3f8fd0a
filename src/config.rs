//! Configuration for quantizers and optimizers.
//!
//! Defaults are the usual neural audio codec training hyperparameters:
//! EMA smoothing 0.999, reset variance 0.01, reset rate 0.03.

use serde::{Deserialize, Serialize};

/// Configuration for a single-codebook [`VectorQuantizer`].
///
/// [`VectorQuantizer`]: crate::quantizer::VectorQuantizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorQuantizerConfig {
    /// Number of codewords in the codebook.
    pub codebook_size: usize,

    /// Dimension of each codeword (must match the input channel dim).
    pub embedding_dim: usize,

    /// Seed for codebook initialization. Every distributed worker must use
    /// the same seed so codebooks start identical.
    #[serde(default)]
    pub seed: u64,
}

/// Configuration for a [`ResidualVectorQuantizer`].
///
/// Stages share `embedding_dim` but are independently sized.
///
/// [`ResidualVectorQuantizer`]: crate::quantizer::ResidualVectorQuantizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualVectorQuantizerConfig {
    /// Dimension of each codeword (must match the input channel dim).
    pub embedding_dim: usize,

    /// Codebook size per stage; the vector length is the number of stages.
    pub codebook_sizes: Vec<usize>,

    /// Seed for codebook initialization; stage `k` draws from `seed + k`.
    #[serde(default)]
    pub seed: u64,
}

impl ResidualVectorQuantizerConfig {
    /// Uniform stage sizing convenience constructor.
    pub fn uniform(embedding_dim: usize, codebook_size: usize, num_stages: usize) -> Self {
        Self {
            embedding_dim,
            codebook_sizes: vec![codebook_size; num_stages],
            seed: 0,
        }
    }
}

/// Configuration for the [`EmaCodebookOptimizer`].
///
/// The dead-codeword reset is enabled by setting `reset_step`; `reset_var`
/// and `reset_rate` are only meaningful with it and fall back to 0.01 and
/// 0.03 when left unset.
///
/// [`EmaCodebookOptimizer`]: crate::optim::EmaCodebookOptimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaCodebookConfig {
    /// EMA smoothing factor in (0, 1).
    #[serde(default = "default_smooth")]
    pub smooth: f64,

    /// Check for dead codewords every this many steps. `None` disables the
    /// reset entirely.
    #[serde(default)]
    pub reset_step: Option<u64>,

    /// Variance of the Gaussian perturbation applied to the replacement
    /// codeword.
    #[serde(default)]
    pub reset_var: Option<f64>,

    /// A codeword is reset when its accumulated usage falls below
    /// `reset_rate` times the most-used codeword's.
    #[serde(default)]
    pub reset_rate: Option<f64>,

    /// Base seed for the reset replacement noise. All workers must agree on
    /// it; the per-step draw is seeded with `seed + iteration`.
    #[serde(default)]
    pub seed: u64,
}

impl Default for EmaCodebookConfig {
    fn default() -> Self {
        Self {
            smooth: default_smooth(),
            reset_step: None,
            reset_var: None,
            reset_rate: None,
            seed: 0,
        }
    }
}

impl EmaCodebookConfig {
    /// Enable the dead-codeword reset with the given check interval.
    pub fn with_reset(mut self, reset_step: u64) -> Self {
        self.reset_step = Some(reset_step);
        self
    }
}

/// Default EMA smoothing factor.
pub(crate) fn default_smooth() -> f64 {
    0.999
}

/// Default reset variance, used when `reset_step` is set without one.
pub(crate) fn default_reset_var() -> f64 {
    0.01
}

/// Default reset rate, used when `reset_step` is set without one.
pub(crate) fn default_reset_rate() -> f64 {
    0.03
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_config_defaults_from_empty_json() {
        let config: EmaCodebookConfig = serde_json::from_str("{}").unwrap();
        assert!((config.smooth - 0.999).abs() < 1e-12);
        assert!(config.reset_step.is_none());
        assert!(config.reset_var.is_none());
        assert!(config.reset_rate.is_none());
        assert_eq!(config.seed, 0);
    }

    #[test]
    fn quantizer_config_round_trips() {
        let config = ResidualVectorQuantizerConfig {
            embedding_dim: 8,
            codebook_sizes: vec![16, 32, 64],
            seed: 7,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ResidualVectorQuantizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.codebook_sizes, vec![16, 32, 64]);
        assert_eq!(back.embedding_dim, 8);
        assert_eq!(back.seed, 7);
    }

    #[test]
    fn uniform_stages() {
        let config = ResidualVectorQuantizerConfig::uniform(4, 256, 6);
        assert_eq!(config.codebook_sizes.len(), 6);
        assert!(config.codebook_sizes.iter().all(|&s| s == 256));
    }
}
