//! Communication context for multi-worker training.
//!
//! The EMA codebook optimizer needs every worker to compute identical
//! usage statistics, which requires all-gathering per-position assignment
//! data across the group before reducing. Rather than querying ambient
//! process-global state, the communication context is passed explicitly
//! into [`record_batch`]; single-worker runs pass [`SingleWorker`] and all
//! synchronization degenerates to the N=1 arithmetic.
//!
//! Collective calls are blocking and must be invoked identically (same
//! call, same order) by every participating worker in a given step; a
//! worker skipping a collective call deadlocks the group. Real backends
//! (NCCL, TCP rings, ...) live outside this crate; they only need to
//! implement [`Communicator`].
//!
//! [`record_batch`]: crate::optim::EmaCodebookOptimizer::record_batch

use candle_core::Tensor;

use crate::Result;

/// Blocking collective primitives over tensors.
pub trait Communicator {
    /// Number of workers participating in the group.
    fn world_size(&self) -> usize;

    /// Gather `local` from every worker, ordered by rank.
    ///
    /// Every worker receives the same result. The gathered tensors must
    /// all share the trailing dimensions of `local`; leading (position)
    /// dimensions may differ per worker.
    fn all_gather(&self, local: &Tensor) -> Result<Vec<Tensor>>;

    /// Whether more than one worker participates.
    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }
}

/// The no-op context for single-process runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWorker;

impl Communicator for SingleWorker {
    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![local.clone()])
    }
}
