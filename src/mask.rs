//! Layerwise sparsity-mask generation.
//!
//! The mask generator consumes the per-parameter feature matrix and emits
//! one relaxed keep/drop value per output unit of each target layer. Its
//! structure respects two symmetries of the parameter set:
//!
//! * **Permutation invariance** within a unit: all scalars feeding one
//!   output unit (the weight column plus its bias) are averaged into a
//!   single set feature, so their ordering cannot matter.
//! * **Permutation equivariance** across units: unit features are mixed
//!   through a blend matrix `lambda * I + gamma_g * ones + blockdiag(gamma_l)`
//!   whose three coefficients are themselves produced by an averaging
//!   stack, so relabeling units relabels masks.
//!
//! The blended features pass through an output stack to per-unit
//! `(alpha, beta)` logits and finally through the relaxed Beta-Bernoulli
//! sampler. Identity, all-ones and zero-padding blocks of the blend
//! matrix are memoized per layout since they are constant for a given
//! target architecture.

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::OptimizerConfig;
use crate::error::{LearnedOptimError, LearnedOptimResult};
use crate::flatten::ShapeMap;
use crate::relaxed::RelaxedBetaBernoulli;

/// Masks and auxiliary outputs of one generation pass.
#[derive(Debug, Clone)]
pub struct MaskOutput {
    /// Per-layer unit masks, keyed `layer_<id>`, each `(units,)`.
    pub masks: Vec<(String, Tensor)>,
    /// Sampled keep probabilities over all units, `(total_units,)`.
    pub keep_prob: Tensor,
    /// Scalar KL penalty of the mask sample (unnormalized).
    pub kl: Tensor,
}

/// Constant pieces of the blend matrix, memoized per unit layout.
#[derive(Debug)]
struct BlendCache {
    unit_sizes: Vec<usize>,
    eye: Tensor,
    ones: Tensor,
    zero_pads: Vec<(Option<Tensor>, Option<Tensor>)>,
}

/// One layer group resolved from the shape map.
struct UnitGroup {
    id: String,
    units: usize,
    /// Member views reshaped to `(lead, units, hidden)`.
    views: Vec<Tensor>,
}

/// Network generating relaxed layerwise sparsity masks.
#[derive(Debug)]
pub struct MaskGenerator {
    avg_layers: Vec<Linear>,
    out_layers: Vec<Linear>,
    sampler: RelaxedBetaBernoulli,
    lambda_scale: f64,
    gamma_scale: f64,
    lambda: Option<Tensor>,
    gamma_global: Option<Tensor>,
    gamma_local: Option<Vec<Tensor>>,
    cache: Option<BlendCache>,
}

/// Left/right zero paddings needed to place each square block on the
/// diagonal of the full matrix.
fn make_zero_pads(
    sizes: &[usize],
    device: &Device,
) -> LearnedOptimResult<Vec<(Option<Tensor>, Option<Tensor>)>> {
    let total: usize = sizes.iter().sum();
    let mut pads = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for (i, &size) in sizes.iter().enumerate() {
        let left = if i == 0 {
            None
        } else {
            Some(Tensor::zeros((size, offset), DType::F32, device)?)
        };
        offset += size;
        let right = if i + 1 == sizes.len() {
            None
        } else {
            Some(Tensor::zeros((size, total - offset), DType::F32, device)?)
        };
        pads.push((left, right));
    }
    Ok(pads)
}

fn assemble_block_diag(
    blocks: &[Tensor],
    pads: &[(Option<Tensor>, Option<Tensor>)],
) -> LearnedOptimResult<Tensor> {
    let mut rows = Vec::with_capacity(blocks.len());
    for (block, (left, right)) in blocks.iter().zip(pads) {
        let mut parts: Vec<&Tensor> = Vec::with_capacity(3);
        if let Some(left) = left {
            parts.push(left);
        }
        parts.push(block);
        if let Some(right) = right {
            parts.push(right);
        }
        rows.push(Tensor::cat(&parts, 1)?);
    }
    let refs: Vec<&Tensor> = rows.iter().collect();
    Ok(Tensor::cat(&refs, 0)?)
}

/// Aligns square matrices along the diagonal, zero-filling the rest.
///
/// # Errors
///
/// Fails when `blocks` is empty or a block is not square.
pub fn build_block_diag(blocks: &[Tensor]) -> LearnedOptimResult<Tensor> {
    if blocks.is_empty() {
        return Err(LearnedOptimError::invalid_config(
            "block-diagonal assembly needs at least one block",
        ));
    }
    let mut sizes = Vec::with_capacity(blocks.len());
    for block in blocks {
        let dims = block.dims();
        if dims.len() != 2 || dims[0] != dims[1] {
            return Err(LearnedOptimError::shape_mismatch(
                "square matrix".to_string(),
                format!("{dims:?}"),
            ));
        }
        sizes.push(dims[0]);
    }
    let pads = make_zero_pads(&sizes, blocks[0].device())?;
    assemble_block_diag(blocks, &pads)
}

impl MaskGenerator {
    /// Builds the generator, registering both stacks under `vb`.
    ///
    /// The averaging stack ends in 3 outputs (lambda, global gamma, local
    /// gamma), the output stack in 2 (alpha and beta logits).
    ///
    /// # Errors
    ///
    /// Propagates variable-creation and sampler-construction errors.
    pub fn new(config: &OptimizerConfig, vb: VarBuilder) -> LearnedOptimResult<Self> {
        let hidden = config.hidden_size;
        let mut avg_layers = Vec::with_capacity(config.mask_layers);
        let mut out_layers = Vec::with_capacity(config.mask_layers);
        for i in 0..config.mask_layers {
            let last = i + 1 == config.mask_layers;
            avg_layers.push(linear(
                hidden,
                if last { 3 } else { hidden },
                vb.pp(format!("avg{i}")),
            )?);
            out_layers.push(linear(
                hidden,
                if last { 2 } else { hidden },
                vb.pp(format!("out{i}")),
            )?);
        }
        Ok(Self {
            avg_layers,
            out_layers,
            sampler: RelaxedBetaBernoulli::new(config.prior_keep, config.mask_temperature)?,
            lambda_scale: config.lambda_scale,
            gamma_scale: config.gamma_scale,
            lambda: None,
            gamma_global: None,
            gamma_local: None,
            cache: None,
        })
    }

    /// Clears blend coefficients and the layout cache between runs.
    pub fn reset(&mut self) {
        self.lambda = None;
        self.gamma_global = None;
        self.gamma_local = None;
        self.cache = None;
    }

    /// Detaches the stored blend coefficients from the graph.
    ///
    /// Called at truncation boundaries so no gradient path survives the
    /// window through the coefficient history.
    pub fn detach_lambdas(&mut self) {
        if let Some(l) = &self.lambda {
            self.lambda = Some(l.detach());
        }
        if let Some(g) = &self.gamma_global {
            self.gamma_global = Some(g.detach());
        }
        if let Some(ls) = &self.gamma_local {
            self.gamma_local = Some(ls.iter().map(Tensor::detach).collect());
        }
    }

    /// Most recent identity-blend coefficient, for observability.
    #[must_use]
    pub fn lambda(&self) -> Option<&Tensor> {
        self.lambda.as_ref()
    }

    /// Generates masks from the feature matrix.
    ///
    /// `features` is `(n, hidden)` with one row per scalar parameter, in
    /// the flat order described by `shape_map`.
    ///
    /// # Errors
    ///
    /// Fails when `features` does not cover the shape map exactly, when a
    /// parameter has rank > 2, or when members of one layer disagree on
    /// the unit count.
    pub fn forward(
        &mut self,
        features: &Tensor,
        shape_map: &ShapeMap,
    ) -> LearnedOptimResult<MaskOutput> {
        let dims = features.dims();
        if dims.len() != 2 {
            return Err(LearnedOptimError::shape_mismatch(
                "(n, hidden)".to_string(),
                format!("{dims:?}"),
            ));
        }
        let hidden = dims[1];
        let groups = self.group_set_views(features, shape_map, hidden)?;

        // Permutation-invariant set averaging per unit.
        let mut group_means = Vec::with_capacity(groups.len());
        for group in &groups {
            let refs: Vec<&Tensor> = group.views.iter().collect();
            let stacked = Tensor::cat(&refs, 0)?;
            group_means.push(stacked.mean(0)?);
        }
        let refs: Vec<&Tensor> = group_means.iter().collect();
        let x_set = Tensor::cat(&refs, 0)?.tanh()?;
        let total_units = x_set.dims()[0];

        let unit_sizes: Vec<usize> = groups.iter().map(|g| g.units).collect();
        self.refresh_cache(&unit_sizes, features.device())?;
        let cache = self.cache.as_ref().ok_or_else(|| {
            LearnedOptimError::training("blend cache missing after refresh")
        })?;

        // Averaging stack -> blend coefficients.
        let mut y = x_set.clone();
        for (i, layer) in self.avg_layers.iter().enumerate() {
            y = layer.forward(&y)?;
            if i + 1 < self.avg_layers.len() {
                y = y.tanh()?;
            }
        }

        let lambda = y
            .narrow(1, 0, 1)?
            .mean_all()?
            .affine(self.lambda_scale, 0.0)?;
        let gamma_global = y
            .narrow(1, 1, 1)?
            .mean_all()?
            .affine(self.gamma_scale, 0.0)?;
        let local_col = y.narrow(1, 2, 1)?;
        let mut gamma_local = Vec::with_capacity(groups.len());
        let mut local_blocks = Vec::with_capacity(groups.len());
        let mut unit_offset = 0;
        for &units in &unit_sizes {
            let coeff = local_col
                .narrow(0, unit_offset, units)?
                .mean_all()?
                .affine(self.gamma_scale, 0.0)?;
            local_blocks.push(coeff.broadcast_as((units, units))?.contiguous()?);
            gamma_local.push(coeff);
            unit_offset += units;
        }
        let blend = ((cache.eye.broadcast_mul(&lambda)?
            + cache.ones.broadcast_mul(&gamma_global)?)?
            + assemble_block_diag(&local_blocks, &cache.zero_pads)?)?;
        self.lambda = Some(lambda);
        self.gamma_global = Some(gamma_global);
        self.gamma_local = Some(gamma_local);

        // Equivariant mixing, then the output stack.
        let mixed = x_set.t()?.contiguous()?.matmul(&blend)?;
        let mut z = mixed.t()?.contiguous()?;
        for (i, layer) in self.out_layers.iter().enumerate() {
            z = layer.forward(&z)?;
            if i + 1 < self.out_layers.len() {
                z = z.tanh()?;
            }
        }

        let sample = self.sampler.sample(&z)?;
        let mut masks = Vec::with_capacity(groups.len());
        let mut unit_offset = 0;
        for group in &groups {
            masks.push((
                format!("layer_{}", group.id),
                sample.mask.narrow(0, unit_offset, group.units)?,
            ));
            unit_offset += group.units;
        }
        debug_assert_eq!(unit_offset, total_units);

        Ok(MaskOutput {
            masks,
            keep_prob: sample.keep_prob,
            kl: sample.kl,
        })
    }

    /// Splits the feature matrix into per-layer set views.
    fn group_set_views(
        &self,
        features: &Tensor,
        shape_map: &ShapeMap,
        hidden: usize,
    ) -> LearnedOptimResult<Vec<UnitGroup>> {
        let total: usize = shape_map
            .iter()
            .map(|(_, s)| s.iter().product::<usize>())
            .sum();
        if features.dims()[0] != total {
            return Err(LearnedOptimError::shape_mismatch(
                format!("({total}, {hidden})"),
                format!("{:?}", features.dims()),
            ));
        }

        let mut groups: Vec<UnitGroup> = Vec::new();
        let mut offset = 0;
        for (name, shape) in shape_map {
            let id = name
                .rsplit_once('_')
                .filter(|(prefix, id)| !prefix.is_empty() && !id.is_empty())
                .map(|(_, id)| id.to_string())
                .ok_or_else(|| LearnedOptimError::BadParamKey { key: name.clone() })?;
            let (lead, units) = match shape.as_slice() {
                [out] => (1, *out),
                [input, out] => (*input, *out),
                other => {
                    return Err(LearnedOptimError::shape_mismatch(
                        "rank 1 or 2 parameter".to_string(),
                        format!("{other:?}"),
                    ))
                }
            };
            let len = lead * units;
            let view = features.narrow(0, offset, len)?.reshape((lead, units, hidden))?;
            offset += len;

            match groups.iter_mut().find(|g| g.id == id) {
                Some(group) => {
                    if group.units != units {
                        return Err(LearnedOptimError::shape_mismatch(
                            format!("{} units in layer {}", group.units, group.id),
                            format!("{units} units for key {name:?}"),
                        ));
                    }
                    group.views.push(view);
                }
                None => groups.push(UnitGroup {
                    id,
                    units,
                    views: vec![view],
                }),
            }
        }
        Ok(groups)
    }

    /// Rebuilds the constant blend pieces when the unit layout changed.
    fn refresh_cache(&mut self, unit_sizes: &[usize], device: &Device) -> LearnedOptimResult<()> {
        if self
            .cache
            .as_ref()
            .is_some_and(|c| c.unit_sizes == unit_sizes)
        {
            return Ok(());
        }
        let total: usize = unit_sizes.iter().sum();
        self.cache = Some(BlendCache {
            unit_sizes: unit_sizes.to_vec(),
            eye: Tensor::eye(total, DType::F32, device)?,
            ones: Tensor::ones((total, total), DType::F32, device)?,
            zero_pads: make_zero_pads(unit_sizes, device)?,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn generator(mask_layers: usize) -> MaskGenerator {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = OptimizerConfig::builder()
            .hidden_size(8)
            .mask_layers(mask_layers)
            .build();
        MaskGenerator::new(&config, vb).unwrap()
    }

    fn two_layer_shape_map() -> ShapeMap {
        vec![
            ("mat_0".to_string(), vec![4, 3]),
            ("bias_0".to_string(), vec![3]),
            ("mat_1".to_string(), vec![3, 2]),
            ("bias_1".to_string(), vec![2]),
        ]
    }

    #[test]
    fn test_block_diag_layout() {
        let device = Device::Cpu;
        let blocks = vec![
            Tensor::full(1.0f32, (2, 2), &device).unwrap(),
            Tensor::full(2.0f32, (3, 3), &device).unwrap(),
            Tensor::full(3.0f32, (1, 1), &device).unwrap(),
        ];
        let diag = build_block_diag(&blocks).unwrap();
        assert_eq!(diag.dims(), [6, 6]);
        let values = diag.to_vec2::<f32>().unwrap();
        for (i, row) in values.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                let expected = match (i, j) {
                    (0..=1, 0..=1) => 1.0,
                    (2..=4, 2..=4) => 2.0,
                    (5, 5) => 3.0,
                    _ => 0.0,
                };
                assert_eq!(v, expected, "at ({i}, {j})");
            }
        }
    }

    #[test]
    fn test_block_diag_rejects_non_square() {
        let device = Device::Cpu;
        let bad = vec![Tensor::zeros((2, 3), DType::F32, &device).unwrap()];
        assert!(build_block_diag(&bad).is_err());
    }

    #[test]
    fn test_mask_per_layer_unit_counts() {
        let device = Device::Cpu;
        let mut gen = generator(1);
        let shape_map = two_layer_shape_map();
        // 12 + 3 + 6 + 2 scalar parameters.
        let features = Tensor::randn(0f32, 1f32, (23, 8), &device).unwrap();

        let out = gen.forward(&features, &shape_map).unwrap();
        assert_eq!(out.masks.len(), 2);
        assert_eq!(out.masks[0].0, "layer_0");
        assert_eq!(out.masks[0].1.dims(), [3]);
        assert_eq!(out.masks[1].0, "layer_1");
        assert_eq!(out.masks[1].1.dims(), [2]);
        assert_eq!(out.keep_prob.dims(), [5]);

        for (_, mask) in &out.masks {
            for v in mask.to_vec1::<f32>().unwrap() {
                assert!((0.0..=1.0).contains(&v));
            }
        }
        assert!(out.kl.to_scalar::<f32>().unwrap().is_finite());
        assert!(gen.lambda().is_some());
    }

    #[test]
    fn test_deeper_stacks() {
        let device = Device::Cpu;
        let mut gen = generator(2);
        let features = Tensor::randn(0f32, 1f32, (23, 8), &device).unwrap();
        let out = gen.forward(&features, &two_layer_shape_map()).unwrap();
        assert_eq!(out.keep_prob.dims(), [5]);
    }

    #[test]
    fn test_rejects_feature_row_mismatch() {
        let device = Device::Cpu;
        let mut gen = generator(1);
        let features = Tensor::randn(0f32, 1f32, (22, 8), &device).unwrap();
        assert!(gen.forward(&features, &two_layer_shape_map()).is_err());
    }

    #[test]
    fn test_detach_lambdas_after_forward() {
        let device = Device::Cpu;
        let mut gen = generator(1);
        gen.detach_lambdas();
        let features = Tensor::randn(0f32, 1f32, (23, 8), &device).unwrap();
        gen.forward(&features, &two_layer_shape_map()).unwrap();
        gen.detach_lambdas();
        assert!(gen.lambda().is_some());
        gen.reset();
        assert!(gen.lambda().is_none());
    }
}
