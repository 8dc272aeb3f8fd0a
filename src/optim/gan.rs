//! Generator/discriminator optimizer pairing for adversarial training.

use candle_core::backprop::GradStore;
use candle_nn::Optimizer;

use crate::Result;

/// Pairs the two optimizers of an adversarial setup so training code can
/// pass them around as one unit and step each side with its own gradient
/// store.
pub struct GanOptimizer<G, D> {
    generator: G,
    discriminator: D,
}

impl<G: Optimizer, D: Optimizer> GanOptimizer<G, D> {
    pub fn new(generator: G, discriminator: D) -> Self {
        Self {
            generator,
            discriminator,
        }
    }

    pub fn step_generator(&mut self, grads: &GradStore) -> Result<()> {
        self.generator.step(grads)?;
        Ok(())
    }

    pub fn step_discriminator(&mut self, grads: &GradStore) -> Result<()> {
        self.discriminator.step(grads)?;
        Ok(())
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }

    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    pub fn discriminator_mut(&mut self) -> &mut D {
        &mut self.discriminator
    }
}
