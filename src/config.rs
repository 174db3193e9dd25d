//! Configuration for the learned optimizer.
//!
//! The configuration system is designed to be:
//! - **Serializable** - Load/save configurations from TOML files
//! - **Validated** - Invalid configurations are rejected when the
//!   meta-optimizer is constructed
//! - **Defaulted** - Sensible defaults (hidden size 32, five decay
//!   rates, masking enabled)
//!
//! # Example
//!
//! ```rust
//! use learned_optim_rs::config::OptimizerConfig;
//!
//! let config = OptimizerConfig::builder()
//!     .hidden_size(64)
//!     .decay_rates(vec![0.5, 0.9, 0.99])
//!     .masking(false)
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{LearnedOptimError, LearnedOptimResult};

/// Configuration for the generator networks and the inner loop.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `hidden_size` | 32 | Width of the per-parameter feature |
/// | `decay_rates` | 5 rates | EMA decay rates for momentum features |
/// | `drop_rate` | 0.5 | MC-dropout probability (active in every mode) |
/// | `step_clamp` | 0.01 | Symmetric bound on the emitted step |
/// | `masking` | true | Generate and apply the stochastic sparsity mask |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Width of the per-parameter feature representation.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Number of dense layers in the feature generator.
    #[serde(default = "default_n_layers")]
    pub feature_layers: usize,

    /// Number of dense layers in the step generator.
    #[serde(default = "default_n_layers")]
    pub step_layers: usize,

    /// Number of dense layers in each of the mask generator's two stacks.
    #[serde(default = "default_n_layers")]
    pub mask_layers: usize,

    /// Decay rates for the exponentially-weighted momentum features.
    ///
    /// One first- and one second-moment estimate is tracked per rate, so
    /// the feature input width is `2 + decay_rates.len()`.
    #[serde(default = "default_decay_rates")]
    pub decay_rates: Vec<f64>,

    /// Dropout probability applied after every feature-generator layer.
    ///
    /// Deliberately NOT disabled at evaluation time: the stochastic
    /// features give the downstream mask Monte-Carlo sampling diversity.
    #[serde(default = "default_drop_rate")]
    pub drop_rate: f32,

    /// Normalize gradient and weight by their batch variance before
    /// concatenation into the feature row.
    #[serde(default = "default_true")]
    pub batch_std_norm: bool,

    /// Temperature applied to both step-generator outputs.
    #[serde(default = "default_step_temperature")]
    pub step_temperature: f64,

    /// Symmetric clamp bound on the emitted per-parameter step.
    #[serde(default = "default_step_clamp")]
    pub step_clamp: f64,

    /// Whether to generate and apply the stochastic sparsity mask.
    #[serde(default = "default_true")]
    pub masking: bool,

    /// Prior keep probability the sampler's KL term is measured against.
    #[serde(default = "default_prior_keep")]
    pub prior_keep: f64,

    /// Temperature of the relaxed Bernoulli mask sample.
    #[serde(default = "default_mask_temperature")]
    pub mask_temperature: f64,

    /// Scale applied to the identity-blend coefficient (lambda).
    #[serde(default = "default_lambda_scale")]
    pub lambda_scale: f64,

    /// Scale applied to the global/local relative-importance coefficients.
    #[serde(default = "default_gamma_scale")]
    pub gamma_scale: f64,

    /// Value bound for clipping generator gradients at truncation steps.
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,

    /// Mask entries above this threshold count as kept when computing
    /// per-layer sparsity ratios.
    #[serde(default = "default_sparsity_threshold")]
    pub sparsity_threshold: f64,

    /// Optional per-layer unit counts used to normalize sparsity ratios.
    ///
    /// Keyed by layer id (e.g. `"0"`). When absent, the actual number of
    /// output units of each layer is used.
    #[serde(default)]
    pub layer_unit_counts: Option<HashMap<String, usize>>,
}

// Default value functions for serde
fn default_hidden_size() -> usize {
    32
}
fn default_n_layers() -> usize {
    1
}
fn default_decay_rates() -> Vec<f64> {
    vec![0.5, 0.9, 0.99, 0.999, 0.9999]
}
fn default_drop_rate() -> f32 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_step_temperature() -> f64 {
    1e-5
}
fn default_step_clamp() -> f64 {
    1e-2
}
fn default_prior_keep() -> f64 {
    0.1
}
fn default_mask_temperature() -> f64 {
    0.1
}
fn default_lambda_scale() -> f64 {
    1.0
}
fn default_gamma_scale() -> f64 {
    1e-3
}
fn default_grad_clip() -> f64 {
    0.01
}
fn default_sparsity_threshold() -> f64 {
    1e-6
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            feature_layers: default_n_layers(),
            step_layers: default_n_layers(),
            mask_layers: default_n_layers(),
            decay_rates: default_decay_rates(),
            drop_rate: default_drop_rate(),
            batch_std_norm: default_true(),
            step_temperature: default_step_temperature(),
            step_clamp: default_step_clamp(),
            masking: default_true(),
            prior_keep: default_prior_keep(),
            mask_temperature: default_mask_temperature(),
            lambda_scale: default_lambda_scale(),
            gamma_scale: default_gamma_scale(),
            grad_clip: default_grad_clip(),
            sparsity_threshold: default_sparsity_threshold(),
            layer_unit_counts: None,
        }
    }
}

impl OptimizerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> OptimizerConfigBuilder {
        OptimizerConfigBuilder::default()
    }

    /// Validates the configuration, failing fast on conflicting or
    /// degenerate settings.
    ///
    /// # Errors
    ///
    /// Returns [`LearnedOptimError::InvalidConfig`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> LearnedOptimResult<()> {
        if self.hidden_size == 0 {
            return Err(LearnedOptimError::invalid_config("hidden_size must be > 0"));
        }
        if self.feature_layers == 0 || self.step_layers == 0 || self.mask_layers == 0 {
            return Err(LearnedOptimError::invalid_config(
                "every generator needs at least one layer",
            ));
        }
        if self.decay_rates.is_empty() {
            return Err(LearnedOptimError::invalid_config(
                "at least one decay rate is required",
            ));
        }
        if self.decay_rates.iter().any(|&r| !(0.0..1.0).contains(&r)) {
            return Err(LearnedOptimError::invalid_config(
                "decay rates must lie in [0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(LearnedOptimError::invalid_config(
                "drop_rate must lie in [0, 1)",
            ));
        }
        if self.step_clamp <= 0.0 || self.step_temperature <= 0.0 {
            return Err(LearnedOptimError::invalid_config(
                "step_clamp and step_temperature must be positive",
            ));
        }
        if self.masking {
            if !(0.0..1.0).contains(&self.prior_keep) || self.prior_keep == 0.0 {
                return Err(LearnedOptimError::invalid_config(
                    "prior_keep must lie in (0, 1)",
                ));
            }
            if self.mask_temperature <= 0.0 {
                return Err(LearnedOptimError::invalid_config(
                    "mask_temperature must be positive",
                ));
            }
        } else if self.layer_unit_counts.is_some() {
            return Err(LearnedOptimError::invalid_config(
                "layer_unit_counts is only meaningful when masking is enabled",
            ));
        }
        if self.grad_clip <= 0.0 {
            return Err(LearnedOptimError::invalid_config(
                "grad_clip must be positive",
            ));
        }
        Ok(())
    }

    /// Width of the feature generator's input row: gradient, weight, and
    /// one momentum per decay rate.
    #[must_use]
    pub fn feature_input_size(&self) -> usize {
        2 + self.decay_rates.len()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> LearnedOptimResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            LearnedOptimError::invalid_config(format!("failed to parse config file: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> LearnedOptimResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            LearnedOptimError::invalid_config(format!("failed to serialize config: {e}"))
        })?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

/// Builder for `OptimizerConfig`.
#[derive(Debug, Default)]
pub struct OptimizerConfigBuilder {
    hidden_size: Option<usize>,
    feature_layers: Option<usize>,
    step_layers: Option<usize>,
    mask_layers: Option<usize>,
    decay_rates: Option<Vec<f64>>,
    drop_rate: Option<f32>,
    batch_std_norm: Option<bool>,
    step_temperature: Option<f64>,
    step_clamp: Option<f64>,
    masking: Option<bool>,
    prior_keep: Option<f64>,
    mask_temperature: Option<f64>,
    grad_clip: Option<f64>,
    layer_unit_counts: Option<HashMap<String, usize>>,
}

impl OptimizerConfigBuilder {
    /// Sets the feature width.
    #[must_use]
    pub fn hidden_size(mut self, size: usize) -> Self {
        self.hidden_size = Some(size);
        self
    }

    /// Sets the feature-generator depth.
    #[must_use]
    pub fn feature_layers(mut self, layers: usize) -> Self {
        self.feature_layers = Some(layers);
        self
    }

    /// Sets the step-generator depth.
    #[must_use]
    pub fn step_layers(mut self, layers: usize) -> Self {
        self.step_layers = Some(layers);
        self
    }

    /// Sets the mask-generator stack depth.
    #[must_use]
    pub fn mask_layers(mut self, layers: usize) -> Self {
        self.mask_layers = Some(layers);
        self
    }

    /// Sets the momentum decay rates.
    #[must_use]
    pub fn decay_rates(mut self, rates: Vec<f64>) -> Self {
        self.decay_rates = Some(rates);
        self
    }

    /// Sets the MC-dropout probability.
    #[must_use]
    pub fn drop_rate(mut self, rate: f32) -> Self {
        self.drop_rate = Some(rate);
        self
    }

    /// Enables/disables batch-variance normalization of gradient and weight.
    #[must_use]
    pub fn batch_std_norm(mut self, enabled: bool) -> Self {
        self.batch_std_norm = Some(enabled);
        self
    }

    /// Sets the step temperature.
    #[must_use]
    pub fn step_temperature(mut self, temp: f64) -> Self {
        self.step_temperature = Some(temp);
        self
    }

    /// Sets the symmetric step clamp bound.
    #[must_use]
    pub fn step_clamp(mut self, clamp: f64) -> Self {
        self.step_clamp = Some(clamp);
        self
    }

    /// Enables/disables the stochastic sparsity mask.
    #[must_use]
    pub fn masking(mut self, enabled: bool) -> Self {
        self.masking = Some(enabled);
        self
    }

    /// Sets the prior keep probability for the KL term.
    #[must_use]
    pub fn prior_keep(mut self, p: f64) -> Self {
        self.prior_keep = Some(p);
        self
    }

    /// Sets the relaxed-Bernoulli temperature.
    #[must_use]
    pub fn mask_temperature(mut self, temp: f64) -> Self {
        self.mask_temperature = Some(temp);
        self
    }

    /// Sets the generator gradient clip bound.
    #[must_use]
    pub fn grad_clip(mut self, clip: f64) -> Self {
        self.grad_clip = Some(clip);
        self
    }

    /// Overrides the per-layer unit counts used for sparsity ratios.
    #[must_use]
    pub fn layer_unit_counts(mut self, counts: Option<HashMap<String, usize>>) -> Self {
        self.layer_unit_counts = counts;
        self
    }

    /// Builds the configuration with defaults for unset values.
    #[must_use]
    pub fn build(self) -> OptimizerConfig {
        OptimizerConfig {
            hidden_size: self.hidden_size.unwrap_or_else(default_hidden_size),
            feature_layers: self.feature_layers.unwrap_or_else(default_n_layers),
            step_layers: self.step_layers.unwrap_or_else(default_n_layers),
            mask_layers: self.mask_layers.unwrap_or_else(default_n_layers),
            decay_rates: self.decay_rates.unwrap_or_else(default_decay_rates),
            drop_rate: self.drop_rate.unwrap_or_else(default_drop_rate),
            batch_std_norm: self.batch_std_norm.unwrap_or_else(default_true),
            step_temperature: self
                .step_temperature
                .unwrap_or_else(default_step_temperature),
            step_clamp: self.step_clamp.unwrap_or_else(default_step_clamp),
            masking: self.masking.unwrap_or_else(default_true),
            prior_keep: self.prior_keep.unwrap_or_else(default_prior_keep),
            mask_temperature: self
                .mask_temperature
                .unwrap_or_else(default_mask_temperature),
            lambda_scale: default_lambda_scale(),
            gamma_scale: default_gamma_scale(),
            grad_clip: self.grad_clip.unwrap_or_else(default_grad_clip),
            sparsity_threshold: default_sparsity_threshold(),
            layer_unit_counts: self.layer_unit_counts,
        }
    }
}
