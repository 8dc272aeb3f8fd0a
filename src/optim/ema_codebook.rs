//! Gradient-free EMA codebook optimizer.
//!
//! Codebooks are learned from assignment statistics instead of gradients:
//! every forward pass the training loop records which codeword each
//! position chose ([`record_batch`]), and `step()` folds those counts and
//! vector sums into exponential moving averages whose ratio becomes the
//! new codeword values. Rarely used codewords can periodically be reset
//! next to the most used one to escape codebook collapse.
//!
//! Under distributed data parallelism the per-position assignment data is
//! all-gathered across workers before reduction, so every worker computes
//! identical statistics and applies the identical update without any
//! gradient all-reduce. The dead-codeword replacement draws its noise
//! from a `ChaCha8Rng` seeded with `seed + iteration`, which keeps the
//! workers in lockstep without a broadcast, provided every worker calls
//! `step()` the same number of times.
//!
//! [`record_batch`]: EmaCodebookOptimizer::record_batch

use candle_core::{D, DType, IndexOp, Tensor, Var};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::state::{
    ensure_group_len, ensure_shape, CountTensorData, EmaCodebookState, ResetStateData, TensorData,
};
use crate::config::{default_reset_rate, default_reset_var, EmaCodebookConfig};
use crate::distributed::Communicator;
use crate::quantizer::codebook::gaussian;
use crate::quantizer::{flatten_positions, BatchAssignments, TrackedCodebooks};
use crate::{Error, Result};

/// Statistics from the latest recorded batch for one codebook.
///
/// Overwritten by every capture; consumed by `step()`.
struct CurrentStats {
    /// Assignment count per codeword, `u32`, shape `(codebook_size,)`.
    one_hot_sum: Tensor,
    /// Sum of assigned input vectors per codeword, shape
    /// `(codebook_size, embedding_dim)`.
    z_e_sum: Tensor,
}

/// Dead-codeword reset bookkeeping.
struct ResetState {
    step: u64,
    var: f64,
    rate: f64,
    accumulated_steps: u64,
    /// Per-codeword assignment count since the last reset check, `u32`.
    num_accumulated: Vec<Tensor>,
}

/// Updates codebooks from exponential moving averages of their usage
/// statistics.
///
/// Tracks the codebooks of one quantizer (single-stage or residual,
/// anything implementing [`TrackedCodebooks`]) and rewrites their weights
/// in place on `step()`; the codebooks must not be registered with any
/// gradient optimizer.
///
/// The protocol is two-phase and explicit: call
/// [`record_batch`](Self::record_batch) exactly once after each forward
/// pass, then [`step`](Self::step) once per training iteration. Recording
/// twice before a step discards the earlier statistics (storage is
/// overwrite, not accumulate).
pub struct EmaCodebookOptimizer {
    codebooks: Vec<Var>,
    num_samples_tracked: Vec<Tensor>,
    momentum: Vec<Tensor>,
    current: Vec<Option<CurrentStats>>,
    smooth: f64,
    seed: u64,
    iteration: u64,
    reset: Option<ResetState>,
}

impl EmaCodebookOptimizer {
    pub fn new(model: &impl TrackedCodebooks, config: &EmaCodebookConfig) -> Result<Self> {
        if !(config.smooth > 0.0 && config.smooth < 1.0) {
            return Err(Error::Config(format!(
                "smooth must lie in (0, 1), got {}",
                config.smooth
            )));
        }

        let reset_enabled = match config.reset_step {
            Some(0) => {
                return Err(Error::Config("reset_step must be positive".to_string()));
            }
            Some(step) => Some((
                step,
                config.reset_var.unwrap_or_else(default_reset_var),
                config.reset_rate.unwrap_or_else(default_reset_rate),
            )),
            None => {
                if config.reset_var.is_some() {
                    return Err(Error::Config(
                        "reset_var is specified, but reset_step is not".to_string(),
                    ));
                }
                if config.reset_rate.is_some() {
                    return Err(Error::Config(
                        "reset_rate is specified, but reset_step is not".to_string(),
                    ));
                }
                None
            }
        };

        let tracked = model.codebooks();
        if tracked.is_empty() {
            return Err(Error::Config("no codebooks to track".to_string()));
        }

        let codebooks: Vec<Var> = tracked.iter().map(|cb| cb.weight().clone()).collect();
        let mut num_samples_tracked = Vec::with_capacity(codebooks.len());
        let mut momentum = Vec::with_capacity(codebooks.len());
        let mut num_accumulated = Vec::with_capacity(codebooks.len());

        for var in &codebooks {
            let weight = var.as_tensor();
            let (codebook_size, _) = weight.dims2()?;
            // Every codeword starts as if seen once, so the running count
            // can never divide by zero.
            num_samples_tracked.push(Tensor::ones(
                codebook_size,
                DType::F32,
                weight.device(),
            )?);
            momentum.push(weight.copy()?);
            num_accumulated.push(Tensor::zeros(codebook_size, DType::U32, weight.device())?);
        }

        let reset = reset_enabled.map(|(step, var, rate)| ResetState {
            step,
            var,
            rate,
            accumulated_steps: 0,
            num_accumulated,
        });

        tracing::debug!(
            codebooks = codebooks.len(),
            smooth = config.smooth,
            reset = reset.is_some(),
            "tracking codebooks for EMA updates"
        );

        let current = (0..codebooks.len()).map(|_| None).collect();

        Ok(Self {
            codebooks,
            num_samples_tracked,
            momentum,
            current,
            smooth: config.smooth,
            seed: config.seed,
            iteration: 0,
            reset,
        })
    }

    pub fn smooth(&self) -> f64 {
        self.smooth
    }

    /// Number of `step()` calls so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn num_codebooks(&self) -> usize {
        self.codebooks.len()
    }

    /// Record the assignment statistics of one forward pass.
    ///
    /// With more than one worker, the per-position indices and input
    /// vectors are all-gathered through `comm` before reduction; every
    /// worker must make this call with its own batch in the same step.
    /// Stages skipped by stage dropout keep their previous (consumed or
    /// absent) statistics and will be frozen by the next `step()`.
    pub fn record_batch(
        &mut self,
        assignments: &BatchAssignments,
        comm: &dyn Communicator,
    ) -> Result<()> {
        if assignments.num_stages() != self.codebooks.len() {
            return Err(Error::Tracking(format!(
                "assignments cover {} stages, optimizer tracks {}",
                assignments.num_stages(),
                self.codebooks.len()
            )));
        }

        for k in 0..self.codebooks.len() {
            let Some(stage) = assignments.stage(k) else {
                continue;
            };
            let (codebook_size, embedding_dim) = self.codebooks[k].as_tensor().dims2()?;

            let (inputs, dims) = flatten_positions(&stage.input)?;
            if dims[1] != embedding_dim {
                return Err(Error::Tracking(format!(
                    "stage {k} input dim {} does not match codebook dim {embedding_dim}",
                    dims[1]
                )));
            }
            let indices = stage.indices.flatten_all()?;
            if indices.dim(0)? != inputs.dim(0)? {
                return Err(Error::Tracking(format!(
                    "stage {k} has {} indices for {} input vectors",
                    indices.dim(0)?,
                    inputs.dim(0)?
                )));
            }

            let (indices, inputs) = if comm.is_distributed() {
                let indices = Tensor::cat(&comm.all_gather(&indices)?, 0)?;
                let inputs = Tensor::cat(&comm.all_gather(&inputs)?, 0)?;
                (indices, inputs)
            } else {
                (indices, inputs)
            };

            let device = inputs.device();
            let positions = indices.dim(0)?;
            let ones = Tensor::ones(positions, DType::U32, device)?;
            let one_hot_sum =
                Tensor::zeros(codebook_size, DType::U32, device)?.index_add(&indices, &ones, 0)?;
            let z_e_sum = Tensor::zeros((codebook_size, embedding_dim), DType::F32, device)?
                .index_add(&indices, &inputs.to_dtype(DType::F32)?, 0)?;

            if let Some(reset) = self.reset.as_mut() {
                reset.num_accumulated[k] = (&reset.num_accumulated[k] + &one_hot_sum)?;
            }
            self.current[k] = Some(CurrentStats {
                one_hot_sum,
                z_e_sum,
            });
        }

        Ok(())
    }

    /// Apply one EMA update from the recorded statistics.
    ///
    /// For each codebook with statistics recorded since the previous
    /// step:
    ///
    /// ```text
    /// num_samples_tracked ← smooth · num_samples_tracked + (1 − smooth) · one_hot_sum
    /// momentum            ← smooth · momentum            + (1 − smooth) · z_e_sum
    /// codebook            ← momentum / num_samples_tracked
    /// ```
    ///
    /// Codebooks with no recorded statistics (skipped stages) are frozen.
    /// Fails with [`Error::Tracking`] when nothing at all was recorded.
    pub fn step(&mut self) -> Result<()> {
        if self.current.iter().all(|c| c.is_none()) {
            return Err(Error::Tracking(
                "step() called with no batch statistics recorded since the previous step"
                    .to_string(),
            ));
        }

        self.iteration += 1;
        if let Some(reset) = self.reset.as_mut() {
            reset.accumulated_steps += 1;
        }

        let smooth = self.smooth;
        for k in 0..self.codebooks.len() {
            let Some(stats) = self.current[k].take() else {
                continue;
            };
            let one_hot_sum = stats.one_hot_sum.to_dtype(DType::F32)?;
            let tracked =
                ((&self.num_samples_tracked[k] * smooth)? + (one_hot_sum * (1.0 - smooth))?)?;
            let momentum = ((&self.momentum[k] * smooth)? + (&stats.z_e_sum * (1.0 - smooth))?)?;
            let weight = momentum.broadcast_div(&tracked.unsqueeze(D::Minus1)?)?;

            self.codebooks[k].set(&weight)?;
            self.num_samples_tracked[k] = tracked;
            self.momentum[k] = momentum;
        }

        self.maybe_reset()
    }

    /// Reset the least-used codeword next to the most-used one when its
    /// accumulated usage has fallen below `rate` times the maximum.
    ///
    /// The accumulation window restarts on every check, reset or not.
    fn maybe_reset(&mut self) -> Result<()> {
        let Some(reset) = self.reset.as_mut() else {
            return Ok(());
        };
        if reset.accumulated_steps % reset.step != 0 {
            return Ok(());
        }

        let std = reset.var.sqrt();
        for k in 0..self.codebooks.len() {
            let usage = reset.num_accumulated[k].to_vec1::<u32>()?;
            let mut min_idx = 0;
            let mut max_idx = 0;
            for (i, &count) in usage.iter().enumerate() {
                if count < usage[min_idx] {
                    min_idx = i;
                }
                if count > usage[max_idx] {
                    max_idx = i;
                }
            }

            if (usage[min_idx] as f64) < reset.rate * (usage[max_idx] as f64) {
                let weight = self.codebooks[k].as_tensor();
                let (_, embedding_dim) = weight.dims2()?;
                let device = weight.device().clone();

                // Seeded with seed + iteration: every worker draws the
                // identical replacement without a broadcast.
                let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.iteration));
                let noise = gaussian(&mut rng, &[embedding_dim], &device)?;
                let replaced = (weight.i(max_idx)? + (noise * std)?)?.unsqueeze(0)?;

                self.codebooks[k].set(&overwrite_row(weight, min_idx, &replaced)?)?;
                self.momentum[k] = overwrite_row(&self.momentum[k], min_idx, &replaced)?;
                self.num_samples_tracked[k] = overwrite_row(
                    &self.num_samples_tracked[k],
                    min_idx,
                    &Tensor::ones(1, DType::F32, &device)?,
                )?;

                tracing::debug!(
                    stage = k,
                    replaced = min_idx,
                    source = max_idx,
                    "dead codeword reset"
                );
            }

            reset.num_accumulated[k] = reset.num_accumulated[k].zeros_like()?;
        }

        Ok(())
    }

    /// Snapshot all persistent state.
    pub fn state_dict(&self) -> Result<EmaCodebookState> {
        let codebooks = self
            .codebooks
            .iter()
            .map(|v| TensorData::from_tensor(v.as_tensor()))
            .collect::<Result<Vec<_>>>()?;
        let num_samples_tracked = self
            .num_samples_tracked
            .iter()
            .map(TensorData::from_tensor)
            .collect::<Result<Vec<_>>>()?;
        let momentum = self
            .momentum
            .iter()
            .map(TensorData::from_tensor)
            .collect::<Result<Vec<_>>>()?;

        let reset = match &self.reset {
            Some(reset) => Some(ResetStateData {
                step: reset.step,
                var: reset.var,
                rate: reset.rate,
                accumulated_steps: reset.accumulated_steps,
                num_accumulated: reset
                    .num_accumulated
                    .iter()
                    .map(CountTensorData::from_tensor)
                    .collect::<Result<Vec<_>>>()?,
            }),
            None => None,
        };

        Ok(EmaCodebookState {
            codebooks,
            num_samples_tracked,
            momentum,
            smooth: Some(self.smooth),
            seed: Some(self.seed),
            iteration: Some(self.iteration),
            reset,
        })
    }

    /// Restore a snapshot taken by [`state_dict`](Self::state_dict).
    ///
    /// The saved state must track the same number of codebooks with the
    /// same shapes; anything else is an incompatible checkpoint and fails
    /// with [`Error::StateDict`]. Optional fields missing from older
    /// saves keep their live values.
    pub fn load_state_dict(&mut self, state: &EmaCodebookState) -> Result<()> {
        ensure_group_len("codebook", self.codebooks.len(), state.codebooks.len())?;
        ensure_group_len(
            "num_samples_tracked",
            self.num_samples_tracked.len(),
            state.num_samples_tracked.len(),
        )?;
        ensure_group_len("momentum", self.momentum.len(), state.momentum.len())?;

        for (k, var) in self.codebooks.iter().enumerate() {
            let live = var.as_tensor().dims();
            ensure_shape("codebook", k, live, &state.codebooks[k].shape)?;
            ensure_shape("momentum", k, live, &state.momentum[k].shape)?;
            ensure_shape(
                "num_samples_tracked",
                k,
                &live[..1],
                &state.num_samples_tracked[k].shape,
            )?;
        }

        for k in 0..self.codebooks.len() {
            let device = self.codebooks[k].as_tensor().device().clone();
            self.codebooks[k].set(&state.codebooks[k].to_tensor(&device)?)?;
            self.num_samples_tracked[k] = state.num_samples_tracked[k].to_tensor(&device)?;
            self.momentum[k] = state.momentum[k].to_tensor(&device)?;
            self.current[k] = None;
        }

        if let Some(smooth) = state.smooth {
            self.smooth = smooth;
        }
        if let Some(seed) = state.seed {
            self.seed = seed;
        }
        if let Some(iteration) = state.iteration {
            self.iteration = iteration;
        }

        // Saves taken before reset was enabled carry no reset state; the
        // live accumulator is kept as-is.
        if let (Some(live), Some(saved)) = (self.reset.as_mut(), state.reset.as_ref()) {
            ensure_group_len(
                "num_accumulated",
                live.num_accumulated.len(),
                saved.num_accumulated.len(),
            )?;
            for (k, accumulated) in live.num_accumulated.iter().enumerate() {
                ensure_shape(
                    "num_accumulated",
                    k,
                    accumulated.dims(),
                    &saved.num_accumulated[k].shape,
                )?;
            }
            for (k, accumulated) in saved.num_accumulated.iter().enumerate() {
                let device = self.codebooks[k].as_tensor().device().clone();
                live.num_accumulated[k] = accumulated.to_tensor(&device)?;
            }
            live.step = saved.step;
            live.var = saved.var;
            live.rate = saved.rate;
            live.accumulated_steps = saved.accumulated_steps;
        }

        Ok(())
    }
}

/// Replace row `row` of a tensor (first axis) with `value`.
fn overwrite_row(tensor: &Tensor, row: usize, value: &Tensor) -> Result<Tensor> {
    let rows = tensor.dim(0)?;
    let mut parts = Vec::with_capacity(3);
    if row > 0 {
        parts.push(tensor.narrow(0, 0, row)?);
    }
    parts.push(value.clone());
    if row + 1 < rows {
        parts.push(tensor.narrow(0, row + 1, rows - row - 1)?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use candle_core::Device;

    use crate::config::{ResidualVectorQuantizerConfig, VectorQuantizerConfig};
    use crate::distributed::SingleWorker;
    use crate::quantizer::{Codebook, ResidualVectorQuantizer, VectorQuantizer};

    fn abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    /// Codebook whose row 0 sits at the origin and rows 1, 2 far away, so
    /// small inputs all map to codeword 0.
    fn skewed_quantizer(device: &Device) -> VectorQuantizer {
        let weight = Tensor::new(
            &[
                [0.0f32, 0.0, 0.0, 0.0],
                [100.0, 100.0, 100.0, 100.0],
                [-100.0, -100.0, -100.0, -100.0],
            ],
            device,
        )
        .unwrap();
        VectorQuantizer::from_codebook(Codebook::from_tensor(weight).unwrap())
    }

    #[test]
    fn single_step_matches_lerp_arithmetic() {
        // codebook_size=3, embedding_dim=4, batch_size=2, length=5,
        // smooth=0.999, all 10 positions assigned to codeword 0.
        let device = Device::Cpu;
        let vq = skewed_quantizer(&device);
        let old = vq.codebook().weight().as_tensor().copy().unwrap();

        let input = Tensor::randn(0f32, 0.1, (2, 4, 5), &device).unwrap();
        let q = vq.quantize(&input).unwrap();
        assert_eq!(
            q.indices.flatten_all().unwrap().to_vec1::<u32>().unwrap(),
            vec![0; 10]
        );

        let mut optimizer =
            EmaCodebookOptimizer::new(&vq, &EmaCodebookConfig::default()).unwrap();
        optimizer.record_batch(&q.assignments, &SingleWorker).unwrap();
        optimizer.step().unwrap();

        // Codeword 0: (0.999 * 1 * old + 0.001 * sum_of_10_inputs)
        //           / (0.999 * 1 + 0.001 * 10)
        let (flat, _) = crate::quantizer::flatten_positions(&input).unwrap();
        let input_sum = flat.sum(0).unwrap();
        let expected = ((old.i(0).unwrap() * 0.999).unwrap() + (input_sum * 0.001).unwrap())
            .unwrap()
            .affine(1.0 / (0.999 + 0.001 * 10.0), 0.0)
            .unwrap();

        let updated = vq.codebook().weight().as_tensor();
        let err = abs_diff(&updated.i(0).unwrap(), &expected);
        assert!(err < 1e-5, "codeword 0 deviates from lerp formula: {err}");

        // Unassigned codewords stay put: momentum and count both decay by
        // the same factor, so the ratio is unchanged.
        assert!(abs_diff(&updated.i(1).unwrap(), &old.i(1).unwrap()) < 1e-4);
        assert!(abs_diff(&updated.i(2).unwrap(), &old.i(2).unwrap()) < 1e-4);
    }

    #[test]
    fn assigned_codeword_moves_toward_batch_mean() {
        let device = Device::Cpu;
        let weight = Tensor::new(
            &[[1.0f32, 1.0, 1.0, 1.0], [500.0, 500.0, 500.0, 500.0]],
            &device,
        )
        .unwrap();
        let vq = VectorQuantizer::from_codebook(Codebook::from_tensor(weight).unwrap());
        let old = vq.codebook().weight().as_tensor().copy().unwrap();

        // Batch clustered around 2.0: codeword 0 captures everything.
        let input = (Tensor::randn(0f32, 0.05, (2, 4, 8), &device).unwrap() + 2.0).unwrap();
        let q = vq.quantize(&input).unwrap();

        let mut optimizer =
            EmaCodebookOptimizer::new(&vq, &EmaCodebookConfig::default()).unwrap();
        optimizer.record_batch(&q.assignments, &SingleWorker).unwrap();
        optimizer.step().unwrap();

        let (flat, _) = crate::quantizer::flatten_positions(&input).unwrap();
        let mean = flat.mean(0).unwrap();
        let updated = vq.codebook().weight().as_tensor().i(0).unwrap();

        let before = abs_diff(&old.i(0).unwrap(), &mean);
        let after = abs_diff(&updated, &mean);
        assert!(
            after < before,
            "codeword should move toward the batch mean ({before} -> {after})"
        );
    }

    #[test]
    fn step_without_statistics_fails() {
        let device = Device::Cpu;
        let vq = skewed_quantizer(&device);
        let mut optimizer =
            EmaCodebookOptimizer::new(&vq, &EmaCodebookConfig::default()).unwrap();

        assert!(matches!(optimizer.step(), Err(Error::Tracking(_))));

        // Statistics are consumed by step(): a second step without a new
        // capture fails the same way.
        let input = Tensor::randn(0f32, 0.1, (2, 4, 5), &device).unwrap();
        let q = vq.quantize(&input).unwrap();
        optimizer.record_batch(&q.assignments, &SingleWorker).unwrap();
        optimizer.step().unwrap();
        assert!(matches!(optimizer.step(), Err(Error::Tracking(_))));
    }

    #[test]
    fn reset_config_requires_reset_step() {
        let device = Device::Cpu;
        let vq = skewed_quantizer(&device);

        let config = EmaCodebookConfig {
            reset_var: Some(0.01),
            ..Default::default()
        };
        assert!(matches!(
            EmaCodebookOptimizer::new(&vq, &config),
            Err(Error::Config(_))
        ));

        let config = EmaCodebookConfig {
            reset_rate: Some(0.03),
            ..Default::default()
        };
        assert!(matches!(
            EmaCodebookOptimizer::new(&vq, &config),
            Err(Error::Config(_))
        ));

        let config = EmaCodebookConfig {
            smooth: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            EmaCodebookOptimizer::new(&vq, &config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn dead_codeword_reset_replaces_least_used() {
        let device = Device::Cpu;
        let vq = skewed_quantizer(&device);

        let config = EmaCodebookConfig {
            reset_step: Some(1),
            reset_var: Some(0.0001),
            reset_rate: Some(1.0),
            ..Default::default()
        };
        let mut optimizer = EmaCodebookOptimizer::new(&vq, &config).unwrap();

        // All positions on codeword 0; codewords 1 and 2 are dead.
        let input = Tensor::randn(0f32, 0.1, (2, 4, 5), &device).unwrap();
        let q = vq.quantize(&input).unwrap();
        optimizer.record_batch(&q.assignments, &SingleWorker).unwrap();
        optimizer.step().unwrap();

        let updated = vq.codebook().weight().as_tensor();
        // The least-used codeword (lowest index among the dead ones, so
        // row 1) lands next to the most-used one, within the noise scale
        // sqrt(0.0001) = 0.01.
        let distance = abs_diff(&updated.i(1).unwrap(), &updated.i(0).unwrap());
        assert!(
            distance < 0.1,
            "reset codeword should sit next to the most used one, distance {distance}"
        );
        // Row 2 is untouched (only one reset per check).
        let far: f32 = updated.i(2).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(far > 100.0);

        // The accumulation window restarted.
        let reset = optimizer.reset.as_ref().unwrap();
        assert_eq!(
            reset.num_accumulated[0].to_vec1::<u32>().unwrap(),
            vec![0, 0, 0]
        );
        // And the reset entry's running count restarted at 1.
        let tracked = optimizer.num_samples_tracked[0].to_vec1::<f32>().unwrap();
        assert!((tracked[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn reset_replacement_is_deterministic_per_iteration() {
        let device = Device::Cpu;
        let make = || {
            let vq = skewed_quantizer(&device);
            let config = EmaCodebookConfig {
                reset_step: Some(1),
                reset_rate: Some(1.0),
                seed: 7,
                ..Default::default()
            };
            let optimizer = EmaCodebookOptimizer::new(&vq, &config).unwrap();
            (vq, optimizer)
        };
        let (vq_a, mut opt_a) = make();
        let (vq_b, mut opt_b) = make();

        let input = Tensor::randn(0f32, 0.1, (2, 4, 5), &device).unwrap();
        for (vq, opt) in [(&vq_a, &mut opt_a), (&vq_b, &mut opt_b)] {
            let q = vq.quantize(&input).unwrap();
            opt.record_batch(&q.assignments, &SingleWorker).unwrap();
            opt.step().unwrap();
        }

        let diff = abs_diff(
            vq_a.codebook().weight().as_tensor(),
            vq_b.codebook().weight().as_tensor(),
        );
        assert_eq!(diff, 0.0, "identical seed and iteration must draw identical noise");
    }

    /// Two-worker all-gather stub: returns `[rank 0 tensor, rank 1
    /// tensor]` on both sides, popping the peer's tensors in call order.
    struct TwoWorker {
        rank: usize,
        peer: RefCell<VecDeque<Tensor>>,
    }

    impl Communicator for TwoWorker {
        fn world_size(&self) -> usize {
            2
        }

        fn all_gather(&self, local: &Tensor) -> Result<Vec<Tensor>> {
            let peer = self
                .peer
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| Error::Tracking("peer queue exhausted".to_string()))?;
            Ok(if self.rank == 0 {
                vec![local.clone(), peer]
            } else {
                vec![peer, local.clone()]
            })
        }
    }

    #[test]
    fn distributed_workers_compute_identical_updates() {
        let device = Device::Cpu;
        let batch_a = Tensor::randn(0f32, 0.1, (2, 4, 5), &device).unwrap();
        let batch_b = (Tensor::randn(0f32, 0.1, (2, 4, 5), &device).unwrap() + 0.5).unwrap();

        // Per-stage capture gathers indices first, then inputs.
        let peer_queue = |vq: &VectorQuantizer, batch: &Tensor| {
            let q = vq.quantize(batch).unwrap();
            let stage = q.assignments.stage(0).unwrap();
            let (flat, _) = crate::quantizer::flatten_positions(&stage.input).unwrap();
            VecDeque::from(vec![stage.indices.flatten_all().unwrap(), flat])
        };

        let vq_a = skewed_quantizer(&device);
        let vq_b = skewed_quantizer(&device);
        let comm_a = TwoWorker {
            rank: 0,
            peer: RefCell::new(peer_queue(&vq_b, &batch_b)),
        };
        let comm_b = TwoWorker {
            rank: 1,
            peer: RefCell::new(peer_queue(&vq_a, &batch_a)),
        };

        let mut opt_a = EmaCodebookOptimizer::new(&vq_a, &EmaCodebookConfig::default()).unwrap();
        let mut opt_b = EmaCodebookOptimizer::new(&vq_b, &EmaCodebookConfig::default()).unwrap();

        let q_a = vq_a.quantize(&batch_a).unwrap();
        opt_a.record_batch(&q_a.assignments, &comm_a).unwrap();
        opt_a.step().unwrap();

        let q_b = vq_b.quantize(&batch_b).unwrap();
        opt_b.record_batch(&q_b.assignments, &comm_b).unwrap();
        opt_b.step().unwrap();

        assert_eq!(
            abs_diff(
                vq_a.codebook().weight().as_tensor(),
                vq_b.codebook().weight().as_tensor(),
            ),
            0.0,
            "workers must apply identical codebook updates"
        );

        // And both match a single worker fed the combined batch.
        let vq_c = skewed_quantizer(&device);
        let mut opt_c = EmaCodebookOptimizer::new(&vq_c, &EmaCodebookConfig::default()).unwrap();
        let combined = Tensor::cat(&[&batch_a, &batch_b], 0).unwrap();
        let q_c = vq_c.quantize(&combined).unwrap();
        opt_c.record_batch(&q_c.assignments, &SingleWorker).unwrap();
        opt_c.step().unwrap();

        let diff = abs_diff(
            vq_a.codebook().weight().as_tensor(),
            vq_c.codebook().weight().as_tensor(),
        );
        assert!(diff < 1e-5, "gathered update must equal combined-batch update: {diff}");
    }

    #[test]
    fn skipped_stages_freeze() {
        let device = Device::Cpu;
        let config = ResidualVectorQuantizerConfig::uniform(4, 16, 2);
        let rvq = ResidualVectorQuantizer::new(&config, &device).unwrap();
        let before = rvq.stage(1).unwrap().codebook().weight().as_tensor().copy().unwrap();

        let mut optimizer =
            EmaCodebookOptimizer::new(&rvq, &EmaCodebookConfig::default()).unwrap();

        let input = Tensor::randn(0f32, 1.0, (2, 4, 6), &device).unwrap();
        let q = rvq.quantize_stages(&input, &[0]).unwrap();
        optimizer.record_batch(&q.assignments, &SingleWorker).unwrap();
        optimizer.step().unwrap();

        // Stage 1 was skipped: its codebook and running count are frozen.
        assert_eq!(
            abs_diff(
                rvq.stage(1).unwrap().codebook().weight().as_tensor(),
                &before
            ),
            0.0
        );
        let tracked = optimizer.num_samples_tracked[1].to_vec1::<f32>().unwrap();
        assert!(tracked.iter().all(|&t| t == 1.0));
    }

    #[test]
    fn stage_cardinality_mismatch_is_fatal() {
        let device = Device::Cpu;
        let rvq =
            ResidualVectorQuantizer::new(&ResidualVectorQuantizerConfig::uniform(4, 16, 3), &device)
                .unwrap();
        let vq = VectorQuantizer::new(
            &VectorQuantizerConfig {
                codebook_size: 16,
                embedding_dim: 4,
                seed: 0,
            },
            &device,
        )
        .unwrap();

        let mut optimizer =
            EmaCodebookOptimizer::new(&rvq, &EmaCodebookConfig::default()).unwrap();
        let input = Tensor::randn(0f32, 1.0, (2, 4, 6), &device).unwrap();
        let q = vq.quantize(&input).unwrap();

        assert!(matches!(
            optimizer.record_batch(&q.assignments, &SingleWorker),
            Err(Error::Tracking(_))
        ));
    }

    #[test]
    fn state_round_trips_through_json() {
        let device = Device::Cpu;
        let vq = skewed_quantizer(&device);
        let config = EmaCodebookConfig {
            reset_step: Some(10),
            seed: 3,
            ..Default::default()
        };
        let mut optimizer = EmaCodebookOptimizer::new(&vq, &config).unwrap();

        for _ in 0..3 {
            let input = Tensor::randn(0f32, 0.1, (2, 4, 5), &device).unwrap();
            let q = vq.quantize(&input).unwrap();
            optimizer.record_batch(&q.assignments, &SingleWorker).unwrap();
            optimizer.step().unwrap();
        }

        let state = optimizer.state_dict().unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let restored: EmaCodebookState = serde_json::from_str(&json).unwrap();

        let vq2 = skewed_quantizer(&device);
        let mut optimizer2 = EmaCodebookOptimizer::new(&vq2, &config).unwrap();
        optimizer2.load_state_dict(&restored).unwrap();

        assert_eq!(optimizer2.iteration(), 3);
        assert_eq!(
            abs_diff(
                vq.codebook().weight().as_tensor(),
                vq2.codebook().weight().as_tensor()
            ),
            0.0
        );
        assert_eq!(
            abs_diff(&optimizer.num_samples_tracked[0], &optimizer2.num_samples_tracked[0]),
            0.0
        );
        assert_eq!(abs_diff(&optimizer.momentum[0], &optimizer2.momentum[0]), 0.0);

        let live = optimizer.reset.as_ref().unwrap();
        let loaded = optimizer2.reset.as_ref().unwrap();
        assert_eq!(loaded.accumulated_steps, live.accumulated_steps);
        assert_eq!(
            loaded.num_accumulated[0].to_vec1::<u32>().unwrap(),
            live.num_accumulated[0].to_vec1::<u32>().unwrap()
        );
    }

    #[test]
    fn old_state_without_optional_fields_keeps_live_values() {
        let device = Device::Cpu;
        let vq = skewed_quantizer(&device);
        let config = EmaCodebookConfig {
            seed: 99,
            ..Default::default()
        };
        let mut optimizer = EmaCodebookOptimizer::new(&vq, &config).unwrap();

        let state = optimizer.state_dict().unwrap();
        let mut value = serde_json::to_value(&state).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("smooth");
        object.remove("seed");
        object.remove("iteration");
        let old_state: EmaCodebookState = serde_json::from_value(value).unwrap();

        optimizer.load_state_dict(&old_state).unwrap();
        assert_eq!(optimizer.seed, 99);
        assert!((optimizer.smooth() - 0.999).abs() < 1e-12);
    }

    #[test]
    fn incompatible_state_is_rejected() {
        let device = Device::Cpu;
        let rvq2 =
            ResidualVectorQuantizer::new(&ResidualVectorQuantizerConfig::uniform(4, 16, 2), &device)
                .unwrap();
        let optimizer2 =
            EmaCodebookOptimizer::new(&rvq2, &EmaCodebookConfig::default()).unwrap();
        let state = optimizer2.state_dict().unwrap();

        // Different stage count.
        let vq = skewed_quantizer(&device);
        let mut optimizer1 =
            EmaCodebookOptimizer::new(&vq, &EmaCodebookConfig::default()).unwrap();
        assert!(matches!(
            optimizer1.load_state_dict(&state),
            Err(Error::StateDict(_))
        ));

        // Same stage count, different codebook shape.
        let rvq_other = ResidualVectorQuantizer::new(
            &ResidualVectorQuantizerConfig::uniform(4, 32, 2),
            &device,
        )
        .unwrap();
        let mut optimizer_other =
            EmaCodebookOptimizer::new(&rvq_other, &EmaCodebookConfig::default()).unwrap();
        assert!(matches!(
            optimizer_other.load_state_dict(&state),
            Err(Error::StateDict(_))
        ));
    }
}
