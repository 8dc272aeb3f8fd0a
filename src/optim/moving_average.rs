//! Moving-average wrapper around gradient optimizers.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;

use super::state::{ensure_group_len, ensure_shape, MovingAverageState, TensorData};
use crate::{Error, Result};

/// Maintains an exponential moving average of the parameters updated by a
/// wrapped gradient optimizer.
///
/// Every [`Optimizer::step`] first delegates to the inner optimizer, then
/// folds the fresh parameter values into shadow copies:
/// `shadow ← smooth · shadow + (1 − smooth) · live`. For evaluation,
/// [`apply_average`](Self::apply_average) swaps the shadow values into the
/// live parameters and [`restore`](Self::restore) swaps the originals
/// back; the two must be called in pairs.
pub struct MovingAverageWrapper<O> {
    inner: O,
    vars: Vec<Var>,
    shadow: Vec<Tensor>,
    /// Live values stashed while the shadow parameters are applied.
    stashed: Option<Vec<Tensor>>,
    smooth: f64,
}

impl<O: Optimizer> MovingAverageWrapper<O> {
    /// Wrap an already-constructed optimizer. `vars` must be the same
    /// parameter handles the inner optimizer updates.
    pub fn wrap(inner: O, vars: Vec<Var>, smooth: f64) -> Result<Self> {
        if !(smooth > 0.0 && smooth < 1.0) {
            return Err(Error::Config(format!(
                "smooth must lie in (0, 1), got {smooth}"
            )));
        }
        let shadow = vars
            .iter()
            .map(|v| v.as_tensor().copy())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            inner,
            vars,
            shadow,
            stashed: None,
            smooth,
        })
    }

    pub fn smooth(&self) -> f64 {
        self.smooth
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn into_inner(self) -> O {
        self.inner
    }

    /// Swap the moving-average values into the live parameters, stashing
    /// the originals. Fails if an average is already applied.
    pub fn apply_average(&mut self) -> Result<()> {
        if self.stashed.is_some() {
            return Err(Error::State(
                "moving average already applied; call restore() first".to_string(),
            ));
        }
        let mut stashed = Vec::with_capacity(self.vars.len());
        for (var, shadow) in self.vars.iter().zip(&self.shadow) {
            stashed.push(var.as_tensor().copy()?);
            var.set(shadow)?;
        }
        self.stashed = Some(stashed);
        Ok(())
    }

    /// Swap the stashed live values back. Fails if no average is applied.
    pub fn restore(&mut self) -> Result<()> {
        let Some(stashed) = self.stashed.take() else {
            return Err(Error::State(
                "no moving average applied; call apply_average() first".to_string(),
            ));
        };
        for (var, live) in self.vars.iter().zip(&stashed) {
            var.set(live)?;
        }
        Ok(())
    }

    fn update_shadow(&mut self) -> candle_core::Result<()> {
        for (var, shadow) in self.vars.iter().zip(self.shadow.iter_mut()) {
            *shadow =
                ((&*shadow * self.smooth)? + (var.as_tensor() * (1.0 - self.smooth))?)?;
        }
        Ok(())
    }

    /// Snapshot the shadow parameters and smoothing factor. The inner
    /// optimizer's state is not covered.
    pub fn state_dict(&self) -> Result<MovingAverageState> {
        Ok(MovingAverageState {
            shadow: self
                .shadow
                .iter()
                .map(TensorData::from_tensor)
                .collect::<Result<Vec<_>>>()?,
            smooth: Some(self.smooth),
        })
    }

    /// Restore a snapshot taken by [`state_dict`](Self::state_dict).
    pub fn load_state_dict(&mut self, state: &MovingAverageState) -> Result<()> {
        ensure_group_len("shadow", self.shadow.len(), state.shadow.len())?;
        for (k, shadow) in self.shadow.iter().enumerate() {
            ensure_shape("shadow", k, shadow.dims(), &state.shadow[k].shape)?;
        }
        for (k, saved) in state.shadow.iter().enumerate() {
            self.shadow[k] = saved.to_tensor(self.shadow[k].device())?;
        }
        if let Some(smooth) = state.smooth {
            self.smooth = smooth;
        }
        Ok(())
    }
}

impl<O: Optimizer> Optimizer for MovingAverageWrapper<O> {
    type Config = (O::Config, f64);

    fn new(vars: Vec<Var>, config: Self::Config) -> candle_core::Result<Self> {
        let (inner_config, smooth) = config;
        let inner = O::new(vars.clone(), inner_config)?;
        let shadow = vars
            .iter()
            .map(|v| v.as_tensor().copy())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            inner,
            vars,
            shadow,
            stashed: None,
            smooth,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.inner.step(grads)?;
        self.update_shadow()
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }
}
