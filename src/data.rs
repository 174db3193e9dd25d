//! Batch sources feeding the inner loop.
//!
//! The loop pulls one training batch and one held-out batch per
//! iteration through the [`DataSource`] trait; `full_size` reports the
//! total number of examples behind a source, which normalizes the mask
//! KL term. [`SyntheticClassification`] is a self-contained, seeded
//! source for tests and examples: Gaussian-ish blobs around fixed class
//! centers, so any sensible classifier can make progress on it.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{LearnedOptimError, LearnedOptimResult};

/// One batch of inputs and integer class targets.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs, `(batch, input_size)`.
    pub input: Tensor,
    /// Class ids as `u32`, `(batch,)`.
    pub target: Tensor,
}

/// A stream of batches with a known total example count.
pub trait DataSource {
    /// Produces the next batch.
    ///
    /// # Errors
    ///
    /// Propagates tensor creation errors.
    fn load(&mut self) -> LearnedOptimResult<Batch>;

    /// Total number of examples behind this source.
    fn full_size(&self) -> usize;
}

/// Paired training and held-out sources for one inner-loop run.
pub struct DataBundle {
    /// Source for the training forward/backward.
    pub train: Box<dyn DataSource>,
    /// Source for the held-out evaluation after each update.
    pub test: Box<dyn DataSource>,
}

impl DataBundle {
    /// Builds a synthetic bundle sharing class centers between the
    /// training and held-out splits, with independent sampling streams.
    ///
    /// # Errors
    ///
    /// Propagates construction errors of the underlying sources.
    pub fn synthetic(
        input_size: usize,
        n_classes: usize,
        batch_size: usize,
        full_size: usize,
        seed: u64,
        device: &Device,
    ) -> LearnedOptimResult<Self> {
        let train = SyntheticClassification::new(
            input_size, n_classes, batch_size, full_size, seed, device,
        )?;
        // Same centers (derived from the seed), different noise stream.
        let mut test = SyntheticClassification::new(
            input_size, n_classes, batch_size, full_size, seed, device,
        )?;
        test.reseed(seed.wrapping_add(1));
        Ok(Self {
            train: Box::new(train),
            test: Box::new(test),
        })
    }
}

/// Seeded synthetic classification stream.
///
/// Class centers are drawn once from the seed; each batch picks random
/// classes and perturbs their centers with bounded noise.
pub struct SyntheticClassification {
    input_size: usize,
    n_classes: usize,
    batch_size: usize,
    full_size: usize,
    noise: f32,
    centers: Vec<Vec<f32>>,
    rng: StdRng,
    device: Device,
}

impl SyntheticClassification {
    /// Creates a source with centers derived from `seed`.
    ///
    /// # Errors
    ///
    /// Fails on degenerate sizes.
    pub fn new(
        input_size: usize,
        n_classes: usize,
        batch_size: usize,
        full_size: usize,
        seed: u64,
        device: &Device,
    ) -> LearnedOptimResult<Self> {
        if input_size == 0 || n_classes == 0 || batch_size == 0 || full_size == 0 {
            return Err(LearnedOptimError::invalid_config(
                "synthetic data dimensions must be positive",
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let centers = (0..n_classes)
            .map(|_| (0..input_size).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        Ok(Self {
            input_size,
            n_classes,
            batch_size,
            full_size,
            noise: 0.3,
            centers,
            rng,
            device: device.clone(),
        })
    }

    /// Replaces the sampling stream without touching the class centers.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }
}

impl DataSource for SyntheticClassification {
    fn load(&mut self) -> LearnedOptimResult<Batch> {
        let mut inputs = Vec::with_capacity(self.batch_size * self.input_size);
        let mut targets = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let class = self.rng.gen_range(0..self.n_classes);
            targets.push(class as u32);
            for &c in &self.centers[class] {
                inputs.push(c + self.rng.gen_range(-self.noise..self.noise));
            }
        }
        Ok(Batch {
            input: Tensor::from_vec(inputs, (self.batch_size, self.input_size), &self.device)?,
            target: Tensor::from_vec(targets, (self.batch_size,), &self.device)?,
        })
    }

    fn full_size(&self) -> usize {
        self.full_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_shapes() {
        let device = Device::Cpu;
        let mut source = SyntheticClassification::new(6, 3, 8, 100, 42, &device).unwrap();
        let batch = source.load().unwrap();
        assert_eq!(batch.input.dims(), [8, 6]);
        assert_eq!(batch.target.dims(), [8]);
        assert_eq!(source.full_size(), 100);
        for t in batch.target.to_vec1::<u32>().unwrap() {
            assert!(t < 3);
        }
    }

    #[test]
    fn test_seed_determinism() {
        let device = Device::Cpu;
        let mut a = SyntheticClassification::new(4, 2, 5, 50, 7, &device).unwrap();
        let mut b = SyntheticClassification::new(4, 2, 5, 50, 7, &device).unwrap();
        let batch_a = a.load().unwrap();
        let batch_b = b.load().unwrap();
        assert_eq!(
            batch_a.input.to_vec2::<f32>().unwrap(),
            batch_b.input.to_vec2::<f32>().unwrap()
        );
        assert_eq!(
            batch_a.target.to_vec1::<u32>().unwrap(),
            batch_b.target.to_vec1::<u32>().unwrap()
        );
    }

    #[test]
    fn test_bundle_shares_centers() {
        let device = Device::Cpu;
        let mut bundle = DataBundle::synthetic(4, 2, 64, 200, 9, &device).unwrap();
        let train = bundle.train.load().unwrap();
        let test = bundle.test.load().unwrap();
        // Different noise streams produce different batches over shared
        // centers.
        assert_ne!(
            train.input.to_vec2::<f32>().unwrap(),
            test.input.to_vec2::<f32>().unwrap()
        );
        assert_eq!(bundle.test.full_size(), 200);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let device = Device::Cpu;
        assert!(SyntheticClassification::new(0, 3, 8, 100, 1, &device).is_err());
    }
}
