//! Relaxed Beta-Bernoulli sampling primitive.
//!
//! The mask generator emits two real-valued outputs per output unit; this
//! module turns them into a differentiable stochastic keep/drop signal:
//!
//! 1. The outputs are mapped to positive concentrations `(a, b)` via a
//!    numerically stable softplus.
//! 2. A keep probability is drawn through the Kumaraswamy
//!    reparameterization `pi = (1 - u^(1/b))^(1/a)`, a sampling-friendly
//!    stand-in for a Beta draw.
//! 3. The mask is a binary-Concrete relaxation of a Bernoulli(`pi`) draw
//!    at a configurable temperature, so it lives in `(0, 1)` and stays
//!    differentiable.
//! 4. The KL term is the Bernoulli KL of `pi` against a prior keep
//!    probability, summed over units.
//!
//! Everything downstream treats this as a black box: two logits in, a
//! mask, its expected-value surrogate, and a KL penalty out.

use candle_core::Tensor;

use crate::error::{LearnedOptimError, LearnedOptimResult};

/// Numerical floor keeping logs and reciprocals finite.
const EPS: f64 = 1e-6;

/// One drawn mask with its surrogate and KL penalty.
#[derive(Debug, Clone)]
pub struct MaskSample {
    /// Relaxed keep/drop values in `(0, 1)`, one per unit, shape `(n,)`.
    pub mask: Tensor,
    /// Sampled keep probabilities (the mask's expected-value surrogate).
    pub keep_prob: Tensor,
    /// Scalar KL divergence against the prior, summed over units.
    pub kl: Tensor,
}

/// Sampler for relaxed Beta-Bernoulli masks.
#[derive(Debug, Clone)]
pub struct RelaxedBetaBernoulli {
    prior_keep: f64,
    temperature: f64,
}

/// Softplus computed as `relu(x) + ln(1 + exp(-|x|))` to stay finite for
/// large magnitudes.
fn softplus(x: &Tensor) -> LearnedOptimResult<Tensor> {
    let linear = x.relu()?;
    let decay = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((linear + decay)?)
}

impl RelaxedBetaBernoulli {
    /// Creates a sampler with the given prior keep probability and
    /// Concrete-relaxation temperature.
    ///
    /// # Errors
    ///
    /// Fails when `prior_keep` is outside `(0, 1)` or `temperature` is
    /// not positive.
    pub fn new(prior_keep: f64, temperature: f64) -> LearnedOptimResult<Self> {
        if !(EPS..1.0 - EPS).contains(&prior_keep) {
            return Err(LearnedOptimError::invalid_config(
                "prior keep probability must lie strictly inside (0, 1)",
            ));
        }
        if temperature <= 0.0 {
            return Err(LearnedOptimError::invalid_config(
                "relaxation temperature must be positive",
            ));
        }
        Ok(Self {
            prior_keep,
            temperature,
        })
    }

    /// Draws a relaxed mask from per-unit `(alpha, beta)` logits.
    ///
    /// # Arguments
    ///
    /// * `logits` - shape `(n, 2)`: column 0 parameterizes alpha,
    ///   column 1 beta.
    ///
    /// # Errors
    ///
    /// Fails when `logits` is not `(n, 2)` or a tensor operation fails.
    pub fn sample(&self, logits: &Tensor) -> LearnedOptimResult<MaskSample> {
        let dims = logits.dims();
        if dims.len() != 2 || dims[1] != 2 {
            return Err(LearnedOptimError::shape_mismatch(
                "(n, 2)".to_string(),
                format!("{dims:?}"),
            ));
        }
        let n = dims[0];
        let device = logits.device();

        let alpha = (softplus(&logits.narrow(1, 0, 1)?.squeeze(1)?)? + EPS)?;
        let beta = (softplus(&logits.narrow(1, 1, 1)?.squeeze(1)?)? + EPS)?;

        // Kumaraswamy draw of the keep probability.
        let u = Tensor::rand(EPS as f32, (1.0 - EPS) as f32, (n,), device)?;
        let u_pow = (u.log()?.mul(&beta.recip()?)?).exp()?;
        let inner = u_pow.affine(-1.0, 1.0)?.clamp(EPS, 1.0 - EPS)?;
        let keep_prob = (inner.log()?.mul(&alpha.recip()?)?)
            .exp()?
            .clamp(EPS, 1.0 - EPS)?;

        // Binary Concrete relaxation of Bernoulli(keep_prob).
        let logit_pi = (keep_prob.log()? - keep_prob.affine(-1.0, 1.0)?.log()?)?;
        let noise = Tensor::rand(EPS as f32, (1.0 - EPS) as f32, (n,), device)?;
        let logistic = (noise.log()? - noise.affine(-1.0, 1.0)?.log()?)?;
        let mask = candle_nn::ops::sigmoid(&((logit_pi + logistic)?.affine(
            1.0 / self.temperature,
            0.0,
        )?))?;

        // Bernoulli KL against the prior, summed over units.
        let one_minus = keep_prob.affine(-1.0, 1.0)?;
        let kl_keep = keep_prob.mul(&(keep_prob.log()? - self.prior_keep.ln())?)?;
        let kl_drop = one_minus.mul(&(one_minus.log()? - (1.0 - self.prior_keep).ln())?)?;
        let kl = (kl_keep + kl_drop)?.sum_all()?;

        Ok(MaskSample {
            mask,
            keep_prob,
            kl,
        })
    }
}
