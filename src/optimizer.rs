//! The meta-optimizer: generator networks plus the unrolled inner loop.
//!
//! One [`MetaOptimizer`] owns the feature, step and mask generators and
//! drives the inner loop over a target model. In training mode the
//! held-out losses (plus the normalized mask KL) accumulate over an
//! unroll window; at each window boundary the accumulated loss is pushed
//! backward through the generator weights, gradients are value-clipped,
//! one outer step is taken, and the parameter trajectory is detached so
//! no graph grows past the window. Validation and test modes run the
//! same loop without outer updates and detach after every iteration.
//!
//! Walltime accounting is mode-aware: the training forward/backward and
//! the parameter update are always charged, the held-out evaluation only
//! while training the optimizer itself.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::config::OptimizerConfig;
use crate::data::DataBundle;
use crate::error::{LearnedOptimError, LearnedOptimResult};
use crate::feature::FeatureGenerator;
use crate::mask::MaskGenerator;
use crate::metrics::{IterationRecord, ResultLog};
use crate::model::{TargetFactory, TargetModel};
use crate::outer::OuterOptimizer;
use crate::step::StepGenerator;
use crate::timing::{Timer, Walltime};

/// What the inner loop is being run for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Train the generator networks via truncated backpropagation.
    Train,
    /// Evaluate without outer updates (model selection).
    Valid,
    /// Evaluate without outer updates (final reporting).
    Test,
}

impl RunMode {
    /// Whether outer updates happen in this mode.
    #[must_use]
    pub fn is_train(&self) -> bool {
        matches!(self, Self::Train)
    }
}

/// Shape of one inner-loop run.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    /// Number of inner iterations.
    pub iterations: usize,
    /// Truncation window length for backpropagation through time.
    pub unroll: usize,
    /// Run purpose.
    pub mode: RunMode,
}

impl RunConfig {
    fn validate(&self) -> LearnedOptimResult<()> {
        if self.iterations == 0 || self.unroll == 0 {
            return Err(LearnedOptimError::invalid_config(
                "iterations and unroll must be positive",
            ));
        }
        Ok(())
    }
}

/// Observer invoked at iteration boundaries of the inner loop.
///
/// Replaces ad-hoc debugger hooks: tests and tooling can watch a run
/// without threading state through the driver.
pub trait InspectHook {
    /// Called once per iteration with the freshly produced record.
    fn after_iteration(&mut self, _record: &IterationRecord) {}
}

/// Hook that observes nothing.
#[derive(Debug, Default)]
pub struct NoopHook;

impl InspectHook for NoopHook {}

/// Learned optimizer: three generator networks and the loop driving them.
pub struct MetaOptimizer {
    config: OptimizerConfig,
    device: Device,
    varmap: VarMap,
    feature_gen: FeatureGenerator,
    step_gen: StepGenerator,
    mask_gen: MaskGenerator,
    partial: Option<ResultLog>,
}

impl MetaOptimizer {
    /// Builds the generator networks on `device`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration or variable-creation errors.
    pub fn new(config: OptimizerConfig, device: &Device) -> LearnedOptimResult<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let feature_gen = FeatureGenerator::new(&config, vb.pp("feature_gen"))?;
        let step_gen = StepGenerator::new(&config, vb.pp("step_gen"))?;
        let mask_gen = MaskGenerator::new(&config, vb.pp("mask_gen"))?;
        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            feature_gen,
            step_gen,
            mask_gen,
            partial: None,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// All trainable generator variables, for wiring up an outer
    /// optimizer.
    #[must_use]
    pub fn all_vars(&self) -> Vec<candle_core::Var> {
        self.varmap.all_vars()
    }

    /// Results collected before the most recent failed run, if any.
    pub fn take_partial_results(&mut self) -> Option<ResultLog> {
        self.partial.take()
    }

    /// Runs the inner loop over one freshly initialized target model.
    ///
    /// `outer` is required in [`RunMode::Train`] and ignored otherwise.
    /// On failure the records collected so far stay available through
    /// [`Self::take_partial_results`].
    ///
    /// # Errors
    ///
    /// Fails on configuration conflicts or tensor operation errors.
    pub fn meta_optimize<F: TargetFactory>(
        &mut self,
        outer: Option<&mut dyn OuterOptimizer>,
        data: &mut DataBundle,
        factory: &F,
        run: &RunConfig,
    ) -> LearnedOptimResult<ResultLog> {
        self.meta_optimize_with_hook(outer, data, factory, run, &mut NoopHook)
    }

    /// Like [`Self::meta_optimize`], with an inspection hook called at
    /// every iteration boundary.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::meta_optimize`].
    pub fn meta_optimize_with_hook<F: TargetFactory>(
        &mut self,
        mut outer: Option<&mut dyn OuterOptimizer>,
        data: &mut DataBundle,
        factory: &F,
        run: &RunConfig,
        hook: &mut dyn InspectHook,
    ) -> LearnedOptimResult<ResultLog> {
        run.validate()?;
        if run.mode.is_train() && outer.is_none() {
            return Err(LearnedOptimError::invalid_config(
                "training mode requires an outer optimizer",
            ));
        }
        let mut log = ResultLog::new();
        match self.run_inner(&mut outer, data, factory, run, hook, &mut log) {
            Ok(()) => Ok(log),
            Err(e) => {
                self.partial = Some(log);
                Err(e)
            }
        }
    }

    fn run_inner<F: TargetFactory>(
        &mut self,
        outer: &mut Option<&mut dyn OuterOptimizer>,
        data: &mut DataBundle,
        factory: &F,
        run: &RunConfig,
        hook: &mut dyn InspectHook,
        log: &mut ResultLog,
    ) -> LearnedOptimResult<()> {
        // Fresh run: no recurrent or cached state may survive from a
        // previous target model.
        self.feature_gen.reset();
        self.mask_gen.reset();

        let mut params = factory.init(&self.device)?;
        let mut walltime = Walltime::new();
        let mut unroll_loss: Option<Tensor> = None;
        let test_full_size = data.test.full_size();

        info!(
            mode = ?run.mode,
            iterations = run.iterations,
            unroll = run.unroll,
            params = params.numel(),
            "starting inner loop"
        );

        for iter in 1..=run.iterations {
            // Training forward/backward and the generated update.
            let timer = Timer::start();
            let (vars, var_params) = params.to_vars()?;
            let model = factory.build(&var_params)?;
            let batch = data.train.load()?;
            let train_loss = model.loss(&batch.input, &batch.target)?;
            let grad_store = train_loss.backward()?;
            let grads = var_params.grads_from_store(&vars, &grad_store)?;

            let grad_flat = grads.flat().detach();
            let weight_flat = var_params.flat().detach();
            let feature = self.feature_gen.forward(&grad_flat, &weight_flat, None)?;
            let mut step = self.step_gen.forward(&feature.features)?;

            let mut sparsity = BTreeMap::new();
            let mut keep_prob_mean = None;
            let mut kld_term: Option<Tensor> = None;
            if self.config.masking {
                let shape_map = params.shape_map();
                let mask_out = self.mask_gen.forward(&feature.features, &shape_map)?;
                kld_term =
                    Some(mask_out.kl.affine(1.0 / test_full_size as f64, 0.0)?);
                keep_prob_mean = Some(mask_out.keep_prob.mean_all()?.to_scalar::<f32>()?);
                self.record_sparsity(&mask_out.masks, &mut sparsity)?;
                let layout = params.expand_mask(&mask_out.masks)?;
                step = step.mul(&layout)?;
            }
            params = params.add_flat(&step)?;
            walltime.charge(timer.elapsed());

            // Held-out evaluation of the updated parameters.
            let timer = Timer::start();
            let test_model = factory.build(&params)?;
            let test_batch = data.test.load()?;
            let raw_test = test_model.loss(&test_batch.input, &test_batch.target)?;
            let test_value = raw_test.to_scalar::<f32>()?;
            let nonfinite_test = !test_value.is_finite();
            let test_loss = if nonfinite_test {
                warn!(iteration = iter, "held-out loss is non-finite, zeroing");
                Tensor::zeros((), DType::F32, &self.device)?
            } else {
                raw_test
            };

            let test_kld = match &kld_term {
                Some(k) => k.to_scalar::<f32>()?,
                None => 0.0,
            };
            if run.mode.is_train() {
                let term = match kld_term {
                    Some(kld) => (test_loss.clone() + kld)?,
                    None => test_loss.clone(),
                };
                unroll_loss = Some(match unroll_loss.take() {
                    Some(acc) => (acc + term)?,
                    None => term,
                });
                if iter % run.unroll == 0 {
                    if let (Some(loss), Some(outer)) = (unroll_loss.take(), outer.as_mut()) {
                        outer.step_clipped(&loss, self.config.grad_clip)?;
                    }
                }
                walltime.charge(timer.elapsed());
            }

            // Truncate the parameter trajectory at window boundaries; in
            // evaluation modes no graph is kept at all.
            let timer = Timer::start();
            if !run.mode.is_train() || iter % run.unroll == 0 {
                params = params.detach();
                self.mask_gen.detach_lambdas();
            }
            walltime.charge(timer.elapsed());

            let record = IterationRecord {
                iteration: iter,
                train_loss: train_loss.to_scalar::<f32>()?,
                test_loss: if nonfinite_test { 0.0 } else { test_value },
                test_kld,
                walltime: walltime.total(),
                sparsity,
                keep_prob_mean,
                nonfinite_test,
            };
            debug!(
                iteration = iter,
                train_loss = record.train_loss,
                test_loss = record.test_loss,
                "inner iteration"
            );
            hook.after_iteration(&record);
            log.push(record);
        }

        info!(
            mean_test_loss = log.mean_test_loss(),
            nonfinite = log.nonfinite_count(),
            walltime_ms = walltime.total().as_millis_f64(),
            "inner loop finished"
        );
        Ok(())
    }

    /// Fraction of kept units per layer, normalized by the configured
    /// unit count (falling back to the mask length).
    fn record_sparsity(
        &self,
        masks: &[(String, Tensor)],
        sparsity: &mut BTreeMap<String, f32>,
    ) -> LearnedOptimResult<()> {
        let threshold = self.config.sparsity_threshold as f32;
        for (key, mask) in masks {
            let id = key.strip_prefix("layer_").unwrap_or(key);
            let values = mask.to_vec1::<f32>()?;
            let kept = values.iter().filter(|&&v| v > threshold).count();
            let units = self
                .config
                .layer_unit_counts
                .as_ref()
                .and_then(|counts| counts.get(id).copied())
                .unwrap_or(values.len());
            sparsity.insert(format!("sparse_{id}"), kept as f32 / units as f32);
        }
        Ok(())
    }
}
