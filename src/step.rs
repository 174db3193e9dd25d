//! Per-parameter update-step generation.
//!
//! The step generator maps each feature row to two scalars: a log
//! learning rate and a direction. The emitted step is
//! `exp(log_lr * temperature) * direction * temperature`, clamped to a
//! symmetric bound. With the default temperature of `1e-5` the network
//! starts out proposing near-zero steps and has to learn to move.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::OptimizerConfig;
use crate::error::{LearnedOptimError, LearnedOptimResult};

/// Dense network emitting one bounded update step per parameter.
#[derive(Debug)]
pub struct StepGenerator {
    layers: Vec<Linear>,
    temperature: f64,
    clamp: f64,
}

impl StepGenerator {
    /// Builds the generator, registering its weights under `vb`.
    ///
    /// The final layer has two outputs (log learning rate, direction);
    /// intermediate layers keep the feature width with tanh activations.
    ///
    /// # Errors
    ///
    /// Propagates variable-creation errors.
    pub fn new(config: &OptimizerConfig, vb: VarBuilder) -> LearnedOptimResult<Self> {
        let mut layers = Vec::with_capacity(config.step_layers);
        for i in 0..config.step_layers {
            let out_dim = if i + 1 == config.step_layers {
                2
            } else {
                config.hidden_size
            };
            layers.push(linear(config.hidden_size, out_dim, vb.pp(format!("fc{i}")))?);
        }
        Ok(Self {
            layers,
            temperature: config.step_temperature,
            clamp: config.step_clamp,
        })
    }

    /// Emits one step per feature row.
    ///
    /// Input is `(n, hidden_size)`, output `(n, 1)`. The output stays
    /// attached to the graph of the generator weights so the outer loss
    /// can differentiate through it.
    ///
    /// # Errors
    ///
    /// Fails on tensor operation errors.
    pub fn forward(&self, features: &Tensor) -> LearnedOptimResult<Tensor> {
        let dims = features.dims();
        if dims.len() != 2 {
            return Err(LearnedOptimError::shape_mismatch(
                "(n, hidden)".to_string(),
                format!("{dims:?}"),
            ));
        }
        let mut x = features.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < self.layers.len() {
                x = x.tanh()?;
            }
        }
        let log_lr = x.narrow(1, 0, 1)?;
        let direction = x.narrow(1, 1, 1)?;
        let step = log_lr
            .affine(self.temperature, 0.0)?
            .exp()?
            .mul(&direction)?
            .affine(self.temperature, 0.0)?;
        Ok(step.clamp(-self.clamp, self.clamp)?)
    }
}
