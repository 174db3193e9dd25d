//! Target-model abstraction and a reference MLP classifier.
//!
//! The inner loop never owns the model it is optimizing; it only needs
//! two capabilities, split across two traits:
//!
//! * [`TargetFactory`] creates fresh initial parameters and rebuilds a
//!   model around an existing parameter vector. Rebuilding is cheap by
//!   contract: the model borrows the flattener's tensors instead of
//!   copying them, so a model built from graph-attached parameters keeps
//!   the loss differentiable through the whole unroll window.
//! * [`TargetModel`] evaluates a scalar loss on one batch.
//!
//! [`MlpFactory`] provides the reference target: a two-layer MLP
//! classifier with parameters keyed `mat_0`, `bias_0`, `mat_1`, `bias_1`
//! and a negative log-likelihood loss.

use candle_core::{Device, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::error::{LearnedOptimError, LearnedOptimResult};
use crate::flatten::ParamsFlattener;

/// A model the learned optimizer can train.
pub trait TargetModel {
    /// Scalar loss on one batch.
    ///
    /// # Errors
    ///
    /// Propagates tensor operation errors.
    fn loss(&self, input: &Tensor, target: &Tensor) -> LearnedOptimResult<Tensor>;
}

/// Creates target models and their initial parameters.
pub trait TargetFactory {
    /// Concrete model type produced by [`TargetFactory::build`].
    type Model: TargetModel;

    /// Fresh, randomly initialized parameters on `device`.
    ///
    /// # Errors
    ///
    /// Propagates tensor creation errors.
    fn init(&self, device: &Device) -> LearnedOptimResult<ParamsFlattener>;

    /// Builds a model functioning on the given parameter vector.
    ///
    /// # Errors
    ///
    /// Fails when `params` does not carry the keys this factory expects.
    fn build(&self, params: &ParamsFlattener) -> LearnedOptimResult<Self::Model>;
}

/// Two-layer MLP classifier borrowing its weights from a flattener.
#[derive(Debug)]
pub struct MlpClassifier {
    mat_0: Tensor,
    bias_0: Tensor,
    mat_1: Tensor,
    bias_1: Tensor,
}

impl TargetModel for MlpClassifier {
    /// Mean negative log-likelihood of `target` class indices under the
    /// model. `input` is `(batch, input_size)`, `target` a `(batch,)`
    /// tensor of `u32` class ids.
    fn loss(&self, input: &Tensor, target: &Tensor) -> LearnedOptimResult<Tensor> {
        let hidden = input
            .matmul(&self.mat_0)?
            .broadcast_add(&self.bias_0)?
            .relu()?;
        let logits = hidden.matmul(&self.mat_1)?.broadcast_add(&self.bias_1)?;
        let log_probs = log_softmax(&logits, D::Minus1)?;
        Ok(candle_nn::loss::nll(&log_probs, target)?)
    }
}

/// Factory for [`MlpClassifier`] targets of a fixed geometry.
#[derive(Debug, Clone, Copy)]
pub struct MlpFactory {
    input_size: usize,
    hidden_size: usize,
    output_size: usize,
}

impl MlpFactory {
    /// Creates a factory for `input -> hidden -> output` classifiers.
    ///
    /// # Errors
    ///
    /// Fails when any dimension is zero.
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
    ) -> LearnedOptimResult<Self> {
        if input_size == 0 || hidden_size == 0 || output_size == 0 {
            return Err(LearnedOptimError::invalid_config(
                "MLP dimensions must be positive",
            ));
        }
        Ok(Self {
            input_size,
            hidden_size,
            output_size,
        })
    }

    /// Uniform init in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    fn init_layer(
        fan_in: usize,
        fan_out: usize,
        device: &Device,
    ) -> LearnedOptimResult<(Tensor, Tensor)> {
        let bound = 1.0 / (fan_in as f64).sqrt();
        let mat = Tensor::rand(-bound as f32, bound as f32, (fan_in, fan_out), device)?;
        let bias = Tensor::rand(-bound as f32, bound as f32, (fan_out,), device)?;
        Ok((mat, bias))
    }
}

impl TargetFactory for MlpFactory {
    type Model = MlpClassifier;

    fn init(&self, device: &Device) -> LearnedOptimResult<ParamsFlattener> {
        let (mat_0, bias_0) = Self::init_layer(self.input_size, self.hidden_size, device)?;
        let (mat_1, bias_1) = Self::init_layer(self.hidden_size, self.output_size, device)?;
        ParamsFlattener::from_named(vec![
            ("mat_0".to_string(), mat_0),
            ("bias_0".to_string(), bias_0),
            ("mat_1".to_string(), mat_1),
            ("bias_1".to_string(), bias_1),
        ])
    }

    fn build(&self, params: &ParamsFlattener) -> LearnedOptimResult<Self::Model> {
        Ok(MlpClassifier {
            mat_0: params.get("mat_0")?,
            bias_0: params.get("bias_0")?,
            mat_1: params.get("mat_1")?,
            bias_1: params.get("bias_1")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_factory_parameter_layout() {
        let device = Device::Cpu;
        let factory = MlpFactory::new(6, 4, 3).unwrap();
        let params = factory.init(&device).unwrap();
        assert_eq!(params.numel(), 6 * 4 + 4 + 4 * 3 + 3);
        assert_eq!(params.get("mat_0").unwrap().dims(), [6, 4]);
        assert_eq!(params.get("bias_1").unwrap().dims(), [3]);
    }

    #[test]
    fn test_loss_is_finite_scalar() {
        let device = Device::Cpu;
        let factory = MlpFactory::new(6, 4, 3).unwrap();
        let params = factory.init(&device).unwrap();
        let model = factory.build(&params).unwrap();

        let input = Tensor::randn(0f32, 1f32, (8, 6), &device).unwrap();
        let target = Tensor::from_vec(vec![0u32, 1, 2, 0, 1, 2, 0, 1], (8,), &device).unwrap();
        let loss = model.loss(&input, &target).unwrap();
        assert_eq!(loss.dims(), [] as [usize; 0]);
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_rejects_zero_dimension() {
        assert!(MlpFactory::new(0, 4, 3).is_err());
    }

    #[test]
    fn test_build_needs_expected_keys() {
        let device = Device::Cpu;
        let factory = MlpFactory::new(6, 4, 3).unwrap();
        let stray = ParamsFlattener::from_named(vec![(
            "mat_9".to_string(),
            Tensor::zeros((2, 2), DType::F32, &device).unwrap(),
        )])
        .unwrap();
        assert!(factory.build(&stray).is_err());
    }
}
