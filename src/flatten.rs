//! Bidirectional mapping between a flat parameter vector and its
//! structured (named, shaped) view.
//!
//! The inner loop works on a single `(N, 1)` column vector so the
//! generator networks can treat every scalar parameter as one row, while
//! the target model and the mask generator need the original per-layer
//! tensors. [`ParamsFlattener`] owns that correspondence: the flat view
//! and the structured view always represent the same numbers, and
//! conversions between them are lossless and shape-checked. Losing this
//! invariant silently corrupts parameter updates, so every reconstruction
//! validates element counts.
//!
//! Parameter keys follow the `<kind>_<layer-id>` scheme (`mat_0`,
//! `bias_0`, `mat_1`, …); the suffix after the last underscore is the
//! layer id, and all keys sharing it form one layer group for mask
//! generation.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

use crate::error::{LearnedOptimError, LearnedOptimResult};

/// Ordered mapping from parameter key to its original shape.
pub type ShapeMap = Vec<(String, Vec<usize>)>;

/// One named entry of the structured view.
#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    shape: Vec<usize>,
    offset: usize,
    len: usize,
}

/// A group of parameters sharing one layer id.
#[derive(Debug, Clone)]
pub struct LayerGroup {
    /// Layer identifier (suffix of the parameter keys, e.g. `"0"`).
    pub id: String,
    /// Number of output units of this layer.
    pub units: usize,
    /// Indices of the member entries, in structured order.
    pub entries: Vec<usize>,
}

/// Named-shaped collection of tensors with a flat `(N, 1)` view.
///
/// Replaced functionally at every update (never mutated in place) so the
/// autodiff graph stays intact across the unroll window.
#[derive(Debug, Clone)]
pub struct ParamsFlattener {
    specs: Vec<ParamSpec>,
    flat: Tensor,
}

/// Extracts the layer id from a parameter key.
fn layer_id(name: &str) -> LearnedOptimResult<&str> {
    match name.rsplit_once('_') {
        Some((prefix, id)) if !prefix.is_empty() && !id.is_empty() => Ok(id),
        _ => Err(LearnedOptimError::BadParamKey {
            key: name.to_string(),
        }),
    }
}

impl ParamsFlattener {
    /// Builds the flattener from ordered named tensors.
    ///
    /// # Errors
    ///
    /// Fails on an empty collection, a duplicate or malformed key, or a
    /// tensor operation error.
    pub fn from_named(entries: Vec<(String, Tensor)>) -> LearnedOptimResult<Self> {
        if entries.is_empty() {
            return Err(LearnedOptimError::invalid_config(
                "structured parameter vector must not be empty",
            ));
        }
        let mut specs = Vec::with_capacity(entries.len());
        let mut columns = Vec::with_capacity(entries.len());
        let mut offset = 0;
        for (name, tensor) in entries {
            layer_id(&name)?;
            if specs.iter().any(|s: &ParamSpec| s.name == name) {
                return Err(LearnedOptimError::invalid_config(format!(
                    "duplicate parameter key {name:?}"
                )));
            }
            let shape = tensor.dims().to_vec();
            let len = tensor.elem_count();
            columns.push(tensor.flatten_all()?.unsqueeze(1)?);
            specs.push(ParamSpec {
                name,
                shape,
                offset,
                len,
            });
            offset += len;
        }
        let refs: Vec<&Tensor> = columns.iter().collect();
        let flat = Tensor::cat(&refs, 0)?;
        Ok(Self { specs, flat })
    }

    /// Rebuilds a flattener around an existing flat vector.
    ///
    /// # Errors
    ///
    /// Fails when the vector's element count does not match the shape map.
    pub fn from_flat(flat: &Tensor, shape_map: &ShapeMap) -> LearnedOptimResult<Self> {
        let total: usize = shape_map
            .iter()
            .map(|(_, s)| s.iter().product::<usize>())
            .sum();
        if flat.dims() != [total, 1] {
            return Err(LearnedOptimError::shape_mismatch(
                format!("({total}, 1)"),
                format!("{:?}", flat.dims()),
            ));
        }
        let mut specs = Vec::with_capacity(shape_map.len());
        let mut offset = 0;
        for (name, shape) in shape_map {
            layer_id(name)?;
            let len = shape.iter().product();
            specs.push(ParamSpec {
                name: name.clone(),
                shape: shape.clone(),
                offset,
                len,
            });
            offset += len;
        }
        Ok(Self {
            specs,
            flat: flat.clone(),
        })
    }

    /// The flat `(N, 1)` view.
    #[must_use]
    pub fn flat(&self) -> &Tensor {
        &self.flat
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.specs.iter().map(|s| s.len).sum()
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.flat.device()
    }

    /// Ordered keys and shapes of the structured view.
    #[must_use]
    pub fn shape_map(&self) -> ShapeMap {
        self.specs
            .iter()
            .map(|s| (s.name.clone(), s.shape.clone()))
            .collect()
    }

    /// Returns the named entry in its original shape.
    ///
    /// The returned tensor is a view into the flat vector, so it stays
    /// attached to whatever graph the flat vector belongs to.
    ///
    /// # Errors
    ///
    /// Fails when `name` is not a known key.
    pub fn get(&self, name: &str) -> LearnedOptimResult<Tensor> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| LearnedOptimError::training(format!("unknown parameter key {name:?}")))?;
        let slice = self.flat.narrow(0, spec.offset, spec.len)?;
        Ok(slice.reshape(spec.shape.clone())?)
    }

    /// All entries in structured order with their original shapes.
    ///
    /// # Errors
    ///
    /// Propagates tensor reshape errors.
    pub fn tensors(&self) -> LearnedOptimResult<Vec<(String, Tensor)>> {
        self.specs
            .iter()
            .map(|s| Ok((s.name.clone(), self.get(&s.name)?)))
            .collect()
    }

    /// Adds a flat step, producing a new parameter vector.
    ///
    /// # Errors
    ///
    /// Fails when the step's shape does not match the flat view.
    pub fn add_flat(&self, step: &Tensor) -> LearnedOptimResult<Self> {
        if step.dims() != self.flat.dims() {
            return Err(LearnedOptimError::shape_mismatch(
                format!("{:?}", self.flat.dims()),
                format!("{:?}", step.dims()),
            ));
        }
        Ok(Self {
            specs: self.specs.clone(),
            flat: (&self.flat + step)?,
        })
    }

    /// Detaches the flat vector from the computation graph.
    ///
    /// Used at truncation boundaries: numeric values are preserved, the
    /// gradient history is dropped.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self {
            specs: self.specs.clone(),
            flat: self.flat.detach(),
        }
    }

    /// Promotes every entry to a [`Var`] for gradient computation.
    ///
    /// Returns the variables (in structured order) and a flattener whose
    /// flat view is built from them, so a backward pass through anything
    /// derived from that view populates gradients for the variables.
    /// Entries are detached first: the gradient of the training loss is
    /// taken at the current values, independent of how they were produced.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn to_vars(&self) -> LearnedOptimResult<(Vec<Var>, Self)> {
        let mut vars = Vec::with_capacity(self.specs.len());
        let mut named = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let value = self.get(&spec.name)?.detach();
            let var = Var::from_tensor(&value)?;
            named.push((spec.name.clone(), var.as_tensor().clone()));
            vars.push(var);
        }
        let rebuilt = Self::from_named(named)?;
        Ok((vars, rebuilt))
    }

    /// Reconstructs the structured gradient after a backward pass.
    ///
    /// `vars` must be the variables returned by [`Self::to_vars`], in the
    /// same order. A parameter that did not participate in the loss gets
    /// a zero gradient.
    ///
    /// # Errors
    ///
    /// Fails when `vars` does not line up with the structured view.
    pub fn grads_from_store(
        &self,
        vars: &[Var],
        store: &GradStore,
    ) -> LearnedOptimResult<Self> {
        if vars.len() != self.specs.len() {
            return Err(LearnedOptimError::shape_mismatch(
                format!("{} variables", self.specs.len()),
                format!("{} variables", vars.len()),
            ));
        }
        let mut named = Vec::with_capacity(vars.len());
        for (spec, var) in self.specs.iter().zip(vars) {
            let grad = match store.get(var) {
                Some(g) => g.clone(),
                None => Tensor::zeros(spec.shape.clone(), DType::F32, self.flat.device())?,
            };
            if grad.dims() != spec.shape.as_slice() {
                return Err(LearnedOptimError::shape_mismatch(
                    format!("{:?}", spec.shape),
                    format!("{:?}", grad.dims()),
                ));
            }
            named.push((spec.name.clone(), grad));
        }
        Self::from_named(named)
    }

    /// Groups entries by layer id, preserving first-occurrence order.
    ///
    /// Every member of a group must agree on the layer's output-unit
    /// count: the last axis of a weight matrix, the only axis of a bias.
    ///
    /// # Errors
    ///
    /// Fails on tensors of rank > 2 or on disagreeing unit counts; both
    /// signal a configuration defect, not a recoverable condition.
    pub fn layer_groups(&self) -> LearnedOptimResult<Vec<LayerGroup>> {
        let mut groups: Vec<LayerGroup> = Vec::new();
        for (idx, spec) in self.specs.iter().enumerate() {
            let id = layer_id(&spec.name)?;
            let units = match spec.shape.as_slice() {
                [out] => *out,
                [_, out] => *out,
                other => {
                    return Err(LearnedOptimError::shape_mismatch(
                        "rank 1 or 2 parameter".to_string(),
                        format!("{other:?}"),
                    ))
                }
            };
            match groups.iter_mut().find(|g| g.id == id) {
                Some(group) => {
                    if group.units != units {
                        return Err(LearnedOptimError::shape_mismatch(
                            format!("{} units in layer {}", group.units, group.id),
                            format!("{units} units for key {:?}", spec.name),
                        ));
                    }
                    group.entries.push(idx);
                }
                None => groups.push(LayerGroup {
                    id: id.to_string(),
                    units,
                    entries: vec![idx],
                }),
            }
        }
        Ok(groups)
    }

    /// Expands per-layer, per-output-unit masks to the full flat layout.
    ///
    /// `masks` maps `layer_<id>` to a `(units,)` tensor. A 2-D weight
    /// broadcasts the mask along its input axis (a dropped unit drops the
    /// whole column); a bias applies it directly.
    ///
    /// # Errors
    ///
    /// Fails when a layer's mask is missing or has the wrong unit count.
    pub fn expand_mask(&self, masks: &[(String, Tensor)]) -> LearnedOptimResult<Tensor> {
        let mut columns = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let id = layer_id(&spec.name)?;
            let key = format!("layer_{id}");
            let mask = masks
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, m)| m)
                .ok_or_else(|| {
                    LearnedOptimError::training(format!("no mask for layer {id:?}"))
                })?;
            let expanded = match spec.shape.as_slice() {
                [out] => {
                    if mask.dims() != [*out] {
                        return Err(LearnedOptimError::shape_mismatch(
                            format!("({out},)"),
                            format!("{:?}", mask.dims()),
                        ));
                    }
                    mask.reshape((*out, 1))?
                }
                [input, out] => {
                    if mask.dims() != [*out] {
                        return Err(LearnedOptimError::shape_mismatch(
                            format!("({out},)"),
                            format!("{:?}", mask.dims()),
                        ));
                    }
                    mask.unsqueeze(0)?
                        .broadcast_as((*input, *out))?
                        .contiguous()?
                        .reshape((spec.len, 1))?
                }
                other => {
                    return Err(LearnedOptimError::shape_mismatch(
                        "rank 1 or 2 parameter".to_string(),
                        format!("{other:?}"),
                    ))
                }
            };
            columns.push(expanded);
        }
        let refs: Vec<&Tensor> = columns.iter().collect();
        Ok(Tensor::cat(&refs, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample_params(device: &Device) -> ParamsFlattener {
        let mat_0 = Tensor::from_vec(
            (0..12).map(|v| v as f32).collect::<Vec<_>>(),
            (4, 3),
            device,
        )
        .unwrap();
        let bias_0 = Tensor::from_vec(vec![0.5f32, -0.5, 1.5], (3,), device).unwrap();
        let mat_1 = Tensor::from_vec(
            (0..6).map(|v| v as f32 * 0.1).collect::<Vec<_>>(),
            (3, 2),
            device,
        )
        .unwrap();
        let bias_1 = Tensor::from_vec(vec![0.0f32, 2.0], (2,), device).unwrap();
        ParamsFlattener::from_named(vec![
            ("mat_0".to_string(), mat_0),
            ("bias_0".to_string(), bias_0),
            ("mat_1".to_string(), mat_1),
            ("bias_1".to_string(), bias_1),
        ])
        .unwrap()
    }

    #[test]
    fn test_flatten_unflatten_round_trip() {
        let device = Device::Cpu;
        let params = sample_params(&device);
        assert_eq!(params.numel(), 12 + 3 + 6 + 2);
        assert_eq!(params.flat().dims(), [23, 1]);

        // Bit-for-bit reconstruction through the flat view.
        let rebuilt = ParamsFlattener::from_flat(params.flat(), &params.shape_map()).unwrap();
        let mat_0 = rebuilt.get("mat_0").unwrap();
        assert_eq!(mat_0.dims(), [4, 3]);
        assert_eq!(
            mat_0.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            (0..12).map(|v| v as f32).collect::<Vec<_>>()
        );
        let bias_1 = rebuilt.get("bias_1").unwrap();
        assert_eq!(bias_1.to_vec1::<f32>().unwrap(), vec![0.0, 2.0]);
    }

    #[test]
    fn test_from_flat_rejects_wrong_size() {
        let device = Device::Cpu;
        let params = sample_params(&device);
        let wrong = Tensor::zeros((22, 1), DType::F32, &device).unwrap();
        assert!(ParamsFlattener::from_flat(&wrong, &params.shape_map()).is_err());
    }

    #[test]
    fn test_add_flat() {
        let device = Device::Cpu;
        let params = sample_params(&device);
        let step = Tensor::ones((23, 1), DType::F32, &device).unwrap();
        let updated = params.add_flat(&step).unwrap();
        let bias_0 = updated.get("bias_0").unwrap();
        assert_eq!(bias_0.to_vec1::<f32>().unwrap(), vec![1.5, 0.5, 2.5]);
    }

    #[test]
    fn test_layer_groups() {
        let device = Device::Cpu;
        let params = sample_params(&device);
        let groups = params.layer_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, "0");
        assert_eq!(groups[0].units, 3);
        assert_eq!(groups[0].entries, vec![0, 1]);
        assert_eq!(groups[1].id, "1");
        assert_eq!(groups[1].units, 2);
    }

    #[test]
    fn test_rejects_malformed_key() {
        let device = Device::Cpu;
        let t = Tensor::zeros((2,), DType::F32, &device).unwrap();
        let result = ParamsFlattener::from_named(vec![("weights".to_string(), t)]);
        assert!(matches!(
            result,
            Err(LearnedOptimError::BadParamKey { .. })
        ));
    }

    #[test]
    fn test_expand_mask_broadcasts_along_input_axis() {
        let device = Device::Cpu;
        let params = sample_params(&device);
        let mask_0 = Tensor::from_vec(vec![1.0f32, 0.0, 1.0], (3,), &device).unwrap();
        let mask_1 = Tensor::from_vec(vec![0.0f32, 1.0], (2,), &device).unwrap();
        let expanded = params
            .expand_mask(&[
                ("layer_0".to_string(), mask_0),
                ("layer_1".to_string(), mask_1),
            ])
            .unwrap();
        assert_eq!(expanded.dims(), [23, 1]);
        let values = expanded.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // mat_0 rows all repeat the layer-0 unit mask.
        assert_eq!(&values[0..3], &[1.0, 0.0, 1.0]);
        assert_eq!(&values[3..6], &[1.0, 0.0, 1.0]);
        // bias_0 gets the unit mask directly.
        assert_eq!(&values[12..15], &[1.0, 0.0, 1.0]);
        // mat_1 columns follow the layer-1 mask.
        assert_eq!(&values[15..17], &[0.0, 1.0]);
        // bias_1.
        assert_eq!(&values[21..23], &[0.0, 1.0]);
    }

    #[test]
    fn test_detach_preserves_values() {
        let device = Device::Cpu;
        let params = sample_params(&device);
        let detached = params.detach();
        assert_eq!(
            detached.flat().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            params.flat().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
