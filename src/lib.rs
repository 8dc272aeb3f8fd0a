//! Residual vector quantization with EMA codebook learning in pure Rust.
//!
//! A candle-based implementation of the quantization subsystem used by
//! neural audio codecs (VQ-VAE, SoundStream-style residual quantizers):
//! nearest-codeword lookup with straight-through gradients, and a
//! gradient-free exponential-moving-average optimizer that learns the
//! codebooks from assignment statistics.
//!
//! ## Architecture
//!
//! The training loop wires the pieces together explicitly:
//!
//! ```text
//! embeddings → VectorQuantizer / ResidualVectorQuantizer
//!                   │
//!                   ├→ quantized (straight-through) + indices → decoder, losses
//!                   │
//!                   └→ batch assignments → EmaCodebookOptimizer::record_batch
//!                                                 ↓
//!                                        EmaCodebookOptimizer::step
//!                                                 ↓
//!                                        codebooks updated in place
//! ```
//!
//! Codebooks are excluded from gradient descent entirely: the quantizer's
//! output carries gradients to its *input* only, and the codebook weights
//! are rewritten by [`optim::EmaCodebookOptimizer`] from smoothed usage
//! statistics. Under distributed data parallelism the statistics are
//! all-gathered through an explicit [`distributed::Communicator`] so every
//! worker applies the identical update.
//!
//! ## Modules
//!
//! - [`quantizer`] — codebook lookup, single-stage and residual quantizers
//! - [`optim`] — EMA codebook optimizer, moving-average weight wrapper
//! - [`distributed`] — communication context for multi-worker statistics
//! - [`config`] — serde-backed configuration types

pub mod config;
pub mod distributed;
pub mod optim;
pub mod quantizer;

mod error;

pub use error::{Error, Result};
