//! Optimizers for codebook and weight averaging.
//!
//! ## Components
//!
//! - [`ema_codebook`] — gradient-free EMA codebook optimizer with usage
//!   tracking and dead-codeword reset
//! - [`moving_average`] — moving-average wrapper around any gradient
//!   optimizer (weight averaging for evaluation)
//! - [`gan`] — generator/discriminator optimizer pairing
//!
//! Parameters come in two kinds and the training loop routes each kind to
//! its own optimizer: ordinary weights are gradient-trained (candle's
//! [`Optimizer`] implementations, optionally wrapped in
//! [`MovingAverageWrapper`]), while codebooks are EMA-trained by
//! [`EmaCodebookOptimizer`] and must never be handed to a gradient
//! optimizer.
//!
//! [`Optimizer`]: candle_nn::Optimizer

pub mod ema_codebook;
pub mod gan;
pub mod moving_average;
pub mod state;

pub use ema_codebook::EmaCodebookOptimizer;
pub use gan::GanOptimizer;
pub use moving_average::MovingAverageWrapper;
