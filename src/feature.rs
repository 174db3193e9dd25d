//! Per-parameter feature generation.
//!
//! Each scalar parameter of the target model becomes one row of a feature
//! matrix: its current gradient, its current value, and one exponential
//! moving average of the gradient per configured decay rate, pushed
//! through a small dense network. The momentum state is the only
//! recurrent piece of the optimizer and persists across iterations of one
//! inner-loop run; [`FeatureGenerator::reset`] clears it between runs.
//!
//! Dropout after every dense layer stays active in every run mode. The
//! stochastic features are what give the downstream mask its Monte-Carlo
//! sampling behavior, so disabling dropout at evaluation time would
//! change the optimizer, not just its variance.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::OptimizerConfig;
use crate::error::{LearnedOptimError, LearnedOptimResult};

/// Recurrent momentum state of one inner-loop run.
///
/// `Fresh` until the first gradient arrives; the first observation seeds
/// every decay rate with the raw gradient instead of zero, so early
/// features are not biased toward the origin.
#[derive(Debug, Clone, Default)]
enum MomentumState {
    #[default]
    Fresh,
    Warm {
        /// First-moment EMAs, shape `(n, rates)`.
        momentum: Tensor,
        /// Second-moment EMAs, shape `(n, rates)`.
        momentum_sq: Tensor,
    },
}

/// Output of one feature pass.
#[derive(Debug, Clone)]
pub struct FeatureOutput {
    /// Per-parameter features, shape `(n, hidden_size)`.
    pub features: Tensor,
    /// Square root of the second-moment EMAs, shape `(n, rates)`.
    ///
    /// Exposed for observability; the update rule itself does not consume
    /// it.
    pub v_sqrt: Tensor,
}

/// Dense network turning raw per-parameter observations into features.
#[derive(Debug)]
pub struct FeatureGenerator {
    layers: Vec<Linear>,
    /// Decay rates as a `(1, rates)` row for broadcasting.
    decay: Tensor,
    one_minus_decay: Tensor,
    drop_rate: f32,
    batch_std_norm: bool,
    state: MomentumState,
}

impl FeatureGenerator {
    /// Builds the generator, registering its weights under `vb`.
    ///
    /// # Errors
    ///
    /// Propagates variable-creation errors.
    pub fn new(config: &OptimizerConfig, vb: VarBuilder) -> LearnedOptimResult<Self> {
        let rates: Vec<f32> = config.decay_rates.iter().map(|&r| r as f32).collect();
        let n_rates = rates.len();
        let decay = Tensor::from_vec(rates.clone(), (1, n_rates), vb.device())?;
        let one_minus: Vec<f32> = rates.iter().map(|r| 1.0 - r).collect();
        let one_minus_decay = Tensor::from_vec(one_minus, (1, n_rates), vb.device())?;

        let mut layers = Vec::with_capacity(config.feature_layers);
        let mut in_dim = config.feature_input_size();
        for i in 0..config.feature_layers {
            layers.push(linear(in_dim, config.hidden_size, vb.pp(format!("fc{i}")))?);
            in_dim = config.hidden_size;
        }

        Ok(Self {
            layers,
            decay,
            one_minus_decay,
            drop_rate: config.drop_rate,
            batch_std_norm: config.batch_std_norm,
            state: MomentumState::Fresh,
        })
    }

    /// Clears the momentum state. Must be called between inner-loop runs
    /// so no state leaks from one target model into the next.
    pub fn reset(&mut self) {
        self.state = MomentumState::Fresh;
    }

    /// Current first-moment EMAs, if any observation has been made.
    #[must_use]
    pub fn momentum(&self) -> Option<&Tensor> {
        match &self.state {
            MomentumState::Fresh => None,
            MomentumState::Warm { momentum, .. } => Some(momentum),
        }
    }

    /// Computes features from the flat gradient and weight columns.
    ///
    /// Both inputs must be `(n, 1)`. The raw observations are detached
    /// before entering the network: the generator is trained through the
    /// steps it emits, not through the history of how the gradient came
    /// to be. `drop_override` substitutes the configured dropout
    /// probability for this call only.
    ///
    /// # Errors
    ///
    /// Fails on mismatched shapes or tensor operation errors.
    pub fn forward(
        &mut self,
        grad: &Tensor,
        weight: &Tensor,
        drop_override: Option<f32>,
    ) -> LearnedOptimResult<FeatureOutput> {
        if grad.dims() != weight.dims() || grad.dims().len() != 2 || grad.dims()[1] != 1 {
            return Err(LearnedOptimError::shape_mismatch(
                "matching (n, 1) gradient and weight".to_string(),
                format!("{:?} vs {:?}", grad.dims(), weight.dims()),
            ));
        }
        let grad = grad.detach();
        let weight = weight.detach();
        let n_rates = self.decay.dims()[1];

        let (momentum, momentum_sq) = match &self.state {
            MomentumState::Fresh => (grad.repeat((1, n_rates))?, grad.sqr()?.repeat((1, n_rates))?),
            MomentumState::Warm {
                momentum,
                momentum_sq,
            } => {
                let m = (self.decay.broadcast_mul(momentum)?
                    + self.one_minus_decay.broadcast_mul(&grad)?)?;
                let v = (self.decay.broadcast_mul(momentum_sq)?
                    + self.one_minus_decay.broadcast_mul(&grad.sqr()?)?)?;
                (m, v)
            }
        };
        self.state = MomentumState::Warm {
            momentum: momentum.clone(),
            momentum_sq: momentum_sq.clone(),
        };
        let v_sqrt = momentum_sq.sqrt()?;

        let (grad, weight) = if self.batch_std_norm {
            (
                Self::variance_normalize(&grad)?,
                Self::variance_normalize(&weight)?,
            )
        } else {
            (grad, weight)
        };

        let drop_rate = drop_override.unwrap_or(self.drop_rate);
        let mut x = Tensor::cat(&[&grad, &weight, &momentum], 1)?.detach();
        for layer in &self.layers {
            x = layer.forward(&x)?.relu()?;
            x = candle_nn::ops::dropout(&x, drop_rate)?;
        }

        Ok(FeatureOutput {
            features: x,
            v_sqrt,
        })
    }

    /// Divides a column by its batch variance (not standard deviation).
    /// A small floor keeps near-constant columns finite.
    fn variance_normalize(column: &Tensor) -> LearnedOptimResult<Tensor> {
        let mean = column.mean_keepdim(D::Minus2)?;
        let var = column
            .broadcast_sub(&mean)?
            .sqr()?
            .mean_keepdim(D::Minus2)?;
        let var = (var + 1e-12)?;
        Ok(column.broadcast_div(&var)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn generator(decay_rates: Vec<f64>, drop_rate: f32) -> FeatureGenerator {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = OptimizerConfig::builder()
            .hidden_size(8)
            .decay_rates(decay_rates)
            .drop_rate(drop_rate)
            .batch_std_norm(false)
            .build();
        FeatureGenerator::new(&config, vb).unwrap()
    }

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (values.len(), 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_first_observation_seeds_momentum_with_gradient() {
        let mut gen = generator(vec![0.5, 0.9], 0.0);
        let g = column(&[1.0, -2.0, 4.0]);
        let w = column(&[0.0, 0.0, 0.0]);
        gen.forward(&g, &w, None).unwrap();

        let m = gen.momentum().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(m, vec![vec![1.0, 1.0], vec![-2.0, -2.0], vec![4.0, 4.0]]);
    }

    #[test]
    fn test_momentum_recurrence() {
        let mut gen = generator(vec![0.5, 0.9], 0.0);
        let w = column(&[0.0, 0.0]);
        gen.forward(&column(&[1.0, 2.0]), &w, None).unwrap();
        gen.forward(&column(&[3.0, -1.0]), &w, None).unwrap();

        // m = r * m_prev + (1 - r) * g
        let m = gen.momentum().unwrap().to_vec2::<f32>().unwrap();
        assert!((m[0][0] - (0.5 * 1.0 + 0.5 * 3.0)).abs() < 1e-6);
        assert!((m[0][1] - (0.9 * 1.0 + 0.1 * 3.0)).abs() < 1e-6);
        assert!((m[1][0] - (0.5 * 2.0 + 0.5 * -1.0)).abs() < 1e-6);
        assert!((m[1][1] - (0.9 * 2.0 + 0.1 * -1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_reset_clears_momentum() {
        let mut gen = generator(vec![0.9], 0.0);
        let w = column(&[0.0]);
        gen.forward(&column(&[5.0]), &w, None).unwrap();
        gen.reset();
        assert!(gen.momentum().is_none());

        // After reset the next observation seeds from scratch again.
        gen.forward(&column(&[2.0]), &w, None).unwrap();
        let m = gen.momentum().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(m, vec![vec![2.0]]);
    }

    #[test]
    fn test_feature_shape() {
        let mut gen = generator(vec![0.5, 0.9, 0.99], 0.0);
        let g = column(&[0.1, 0.2, 0.3, 0.4]);
        let w = column(&[1.0, 1.0, 1.0, 1.0]);
        let out = gen.forward(&g, &w, None).unwrap();
        assert_eq!(out.features.dims(), [4, 8]);
        assert_eq!(out.v_sqrt.dims(), [4, 3]);
    }

    #[test]
    fn test_drop_override_disables_dropout() {
        let mut gen = generator(vec![0.9], 0.5);
        let g = column(&[0.3, -0.7, 1.1]);
        let w = column(&[0.1, 0.2, 0.3]);

        let first = gen.forward(&g, &w, Some(0.0)).unwrap();
        gen.reset();
        let second = gen.forward(&g, &w, Some(0.0)).unwrap();
        // With dropout overridden off the pass is deterministic.
        assert_eq!(
            first.features.to_vec2::<f32>().unwrap(),
            second.features.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rejects_mismatched_inputs() {
        let mut gen = generator(vec![0.9], 0.0);
        let g = column(&[1.0, 2.0]);
        let w = column(&[1.0]);
        assert!(gen.forward(&g, &w, None).is_err());
    }
}
