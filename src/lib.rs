//! # learned-optim-rs
//!
//! A meta-learned optimizer: small neural networks observe a target
//! model's gradients and weights, emit per-parameter update steps, and
//! sample a relaxed layerwise sparsity mask over them. The generators
//! themselves are trained by truncated backpropagation through an
//! unrolled inner training loop.
//!
//! ## How an iteration works
//!
//! 1. **Observe** - run the target model's training forward/backward at
//!    the current (detached) parameters to obtain per-parameter
//!    gradients.
//! 2. **Featurize** - [`feature::FeatureGenerator`] turns each scalar
//!    parameter's gradient, value and exponential momentum averages into
//!    a feature row. Dropout stays on in every mode (Monte-Carlo
//!    sampling diversity).
//! 3. **Step** - [`step::StepGenerator`] maps features to a bounded
//!    per-parameter update.
//! 4. **Mask** - [`mask::MaskGenerator`] emits one relaxed
//!    Beta-Bernoulli keep/drop value per output unit of each target
//!    layer; the expanded mask gates the step.
//! 5. **Evaluate** - a held-out loss of the updated parameters (plus the
//!    normalized mask KL) accumulates over the unroll window; at window
//!    boundaries the generators take one clipped outer step and the
//!    parameter trajectory is detached.
//!
//! ## Quick start
//!
//! ```no_run
//! use candle_core::Device;
//! use learned_optim_rs::prelude::*;
//!
//! # fn main() -> learned_optim_rs::error::LearnedOptimResult<()> {
//! let device = Device::Cpu;
//! let config = OptimizerConfig::builder()
//!     .hidden_size(32)
//!     .masking(true)
//!     .build();
//!
//! let mut optim = MetaOptimizer::new(config, &device)?;
//! let mut outer = ClippedAdamW::new(optim.all_vars(), 1e-3)?;
//! let mut data = DataBundle::synthetic(784, 10, 128, 60_000, 42, &device)?;
//! let factory = MlpFactory::new(784, 500, 10)?;
//!
//! let run = RunConfig {
//!     iterations: 100,
//!     unroll: 20,
//!     mode: RunMode::Train,
//! };
//! let results = optim.meta_optimize(Some(&mut outer), &mut data, &factory, &run)?;
//! println!("mean held-out loss: {:?}", results.mean_test_loss());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`] - generator and loop configuration, TOML serializable
//! - [`error`] - error types
//! - [`flatten`] - flat/structured parameter vector correspondence
//! - [`feature`] - per-parameter feature generation with momentum state
//! - [`step`] - bounded update-step generation
//! - [`mask`] - layerwise sparsity-mask generation
//! - [`relaxed`] - relaxed Beta-Bernoulli sampling primitive
//! - [`model`] - target-model traits and a reference MLP
//! - [`data`] - batch sources and a synthetic classification stream
//! - [`outer`] - outer optimization with value-clipped gradients
//! - [`optimizer`] - the inner-loop driver
//! - [`metrics`] - per-iteration records and run-level aggregation
//! - [`timing`] - mode-aware walltime accounting

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;

// Parameter bookkeeping
pub mod flatten;

// Generator networks
pub mod feature;
pub mod mask;
pub mod relaxed;
pub mod step;

// Targets and data
pub mod data;
pub mod model;

// The driver and its surroundings
pub mod metrics;
pub mod optimizer;
pub mod outer;
pub mod timing;

pub use config::{OptimizerConfig, OptimizerConfigBuilder};
pub use error::{LearnedOptimError, LearnedOptimResult};
pub use optimizer::{InspectHook, MetaOptimizer, NoopHook, RunConfig, RunMode};

/// Convenient single-import surface for the common workflow.
pub mod prelude {
    pub use crate::config::OptimizerConfig;
    pub use crate::data::{Batch, DataBundle, DataSource, SyntheticClassification};
    pub use crate::error::{LearnedOptimError, LearnedOptimResult};
    pub use crate::flatten::ParamsFlattener;
    pub use crate::metrics::{IterationRecord, ResultLog};
    pub use crate::model::{MlpFactory, TargetFactory, TargetModel};
    pub use crate::optimizer::{InspectHook, MetaOptimizer, NoopHook, RunConfig, RunMode};
    pub use crate::outer::{ClippedAdamW, OuterOptimizer};
}
