//! In-memory datasets and minibatch iteration.
//!
//! Two sources are supported: a seeded synthetic generator that draws one
//! cluster per class inside the valid value range, and a JSON file holding
//! flattened train and eval splits:
//!
//! ```json
//! {
//!   "num_classes": 3,
//!   "sample_shape": [2, 2],
//!   "train": { "inputs": [[0.1, 0.2, 0.3, 0.4]], "labels": [2] },
//!   "eval":  { "inputs": [[0.5, 0.5, 0.5, 0.5]], "labels": [0] }
//! }
//! ```

use std::fs;
use std::path::Path;

use aegis_core::{check_batch_alignment, AegisError, Batch, Result, ValueRange};
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::debug;

use crate::config::DatasetConfig;

/// Labelled samples of a fixed shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Shape `[N, ...sample_shape]`.
    inputs: ArrayD<f32>,
    labels: Vec<usize>,
    num_classes: usize,
}

impl Dataset {
    pub fn new(inputs: ArrayD<f32>, labels: Vec<usize>, num_classes: usize) -> Result<Self> {
        check_batch_alignment(&inputs, &labels)?;
        if let Some((idx, y)) = labels.iter().enumerate().find(|&(_, &y)| y >= num_classes) {
            return Err(AegisError::Dataset(format!(
                "label {y} at position {idx} is outside the {num_classes} dataset classes"
            )));
        }
        Ok(Self {
            inputs,
            labels,
            num_classes,
        })
    }

    /// Draw `n` samples around one random center per class.
    ///
    /// Centers lie in the middle half of `range`; each sample is its center
    /// plus uniform noise of half-width `spread * range.width()`, clipped to
    /// `range`. Labels cycle through the classes.
    pub fn synthetic<R: Rng>(
        centers: &Array2<f32>,
        sample_shape: &[usize],
        n: usize,
        spread: f32,
        range: ValueRange,
        rng: &mut R,
    ) -> Result<Self> {
        let num_classes = centers.nrows();
        let features = centers.ncols();
        if num_classes == 0 || features != sample_shape.iter().product::<usize>() {
            return Err(AegisError::Dataset(format!(
                "{num_classes} centers of {features} features do not fit \
                 sample shape {sample_shape:?}"
            )));
        }
        let noise = spread * range.width();
        let labels: Vec<usize> = (0..n).map(|i| i % num_classes).collect();
        let flat = Array2::from_shape_fn((n, features), |(i, j)| {
            range.clamp(centers[[labels[i], j]] + rng.random_range(-noise..=noise))
        });

        let mut shape = vec![n];
        shape.extend_from_slice(sample_shape);
        let inputs = flat
            .into_shape_with_order(IxDyn(&shape))
            .map_err(|e| AegisError::Dataset(format!("cannot reshape synthetic samples: {e}")))?;
        Self::new(inputs, labels, num_classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.inputs.shape()[1..]
    }

    pub fn inputs(&self) -> &ArrayD<f32> {
        &self.inputs
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Gather the samples at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(&idx) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(AegisError::Dataset(format!(
                "index {idx} out of bounds for dataset of {} samples",
                self.len()
            )));
        }
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        Batch::new(self.inputs.select(Axis(0), indices), labels)
    }

    /// Contiguous samples `start..end`, with `end` clamped to the dataset size.
    pub fn slice(&self, start: usize, end: usize) -> Result<Batch> {
        let end = end.min(self.len());
        if start > end {
            return Err(AegisError::Dataset(format!(
                "slice start {start} is past the end {end}"
            )));
        }
        let inputs = self.inputs.slice_axis(Axis(0), (start..end).into()).to_owned();
        Batch::new(inputs, self.labels[start..end].to_vec())
    }

    /// Ensure every value lies inside `range`.
    pub fn check_range(&self, range: &ValueRange) -> Result<()> {
        match self.inputs.iter().enumerate().find(|&(_, &v)| !range.contains(v)) {
            Some((pos, v)) => Err(AegisError::Dataset(format!(
                "value {v} at flat index {pos} is outside [{}, {}]",
                range.lower, range.upper
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct DatasetFile {
    num_classes: usize,
    sample_shape: Vec<usize>,
    train: SplitFile,
    eval: SplitFile,
}

#[derive(Deserialize)]
struct SplitFile {
    inputs: Vec<Vec<f32>>,
    labels: Vec<usize>,
}

impl SplitFile {
    fn into_dataset(
        self,
        name: &str,
        sample_shape: &[usize],
        num_classes: usize,
    ) -> Result<Dataset> {
        let features: usize = sample_shape.iter().product();
        let ragged = self.inputs.iter().enumerate().find(|(_, r)| r.len() != features);
        if let Some((idx, row)) = ragged {
            return Err(AegisError::Dataset(format!(
                "{name} sample {idx} has {} values, expected {features}",
                row.len()
            )));
        }
        let n = self.inputs.len();
        let flat: Vec<f32> = self.inputs.into_iter().flatten().collect();
        let mut shape = vec![n];
        shape.extend_from_slice(sample_shape);
        let inputs = ArrayD::from_shape_vec(IxDyn(&shape), flat)
            .map_err(|e| AegisError::Dataset(format!("{name} split: {e}")))?;
        Dataset::new(inputs, self.labels, num_classes)
    }
}

/// Build the `(train, eval)` datasets a config describes.
pub fn load_datasets(
    config: &DatasetConfig,
    range: ValueRange,
    seed: u64,
) -> Result<(Dataset, Dataset)> {
    match &config.path {
        Some(path) => load_json(path, range),
        None => {
            let mut rng = StdRng::seed_from_u64(seed);
            let features: usize = config.sample_shape.iter().product();
            let (lo, hi) = (
                range.lower + 0.25 * range.width(),
                range.lower + 0.75 * range.width(),
            );
            let centers = Array2::from_shape_fn((config.num_classes, features), |_| {
                rng.random_range(lo..=hi)
            });
            let train = Dataset::synthetic(
                &centers,
                &config.sample_shape,
                config.train_size,
                config.spread,
                range,
                &mut rng,
            )?;
            let eval = Dataset::synthetic(
                &centers,
                &config.sample_shape,
                config.eval_size,
                config.spread,
                range,
                &mut rng,
            )?;
            debug!(
                "Generated synthetic dataset: {} train, {} eval, {} classes",
                train.len(),
                eval.len(),
                config.num_classes
            );
            Ok((train, eval))
        }
    }
}

fn load_json(path: &Path, range: ValueRange) -> Result<(Dataset, Dataset)> {
    let text = fs::read_to_string(path)?;
    let file: DatasetFile = serde_json::from_str(&text)
        .map_err(|e| AegisError::Dataset(format!("{}: {e}", path.display())))?;
    if file.sample_shape.is_empty() || file.sample_shape.contains(&0) {
        return Err(AegisError::Dataset(format!(
            "sample_shape {:?} has no features",
            file.sample_shape
        )));
    }
    let train = file.train.into_dataset("train", &file.sample_shape, file.num_classes)?;
    let eval = file.eval.into_dataset("eval", &file.sample_shape, file.num_classes)?;
    train.check_range(&range)?;
    eval.check_range(&range)?;
    debug!(
        "Loaded dataset {}: {} train, {} eval",
        path.display(),
        train.len(),
        eval.len()
    );
    Ok((train, eval))
}

/// Shuffled minibatch iterator over a [`Dataset`].
#[derive(Debug, Clone)]
pub struct DataSubset {
    data: Dataset,
    order: Vec<usize>,
    batch_start: usize,
    rng: StdRng,
}

impl DataSubset {
    pub fn new(data: Dataset, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..data.len()).collect();
        order.shuffle(&mut rng);
        Self {
            data,
            order,
            batch_start: 0,
            rng,
        }
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }

    /// Next minibatch in shuffled order.
    ///
    /// With `multiple_passes`, when fewer than `batch_size` samples remain
    /// in the current pass the order is reshuffled and a new pass starts,
    /// so every batch is full. Without it, the final batch of the pass may
    /// be short and any later call fails.
    pub fn next_batch(&mut self, batch_size: usize, multiple_passes: bool) -> Result<Batch> {
        let n = self.data.len();
        if batch_size == 0 {
            return Err(AegisError::Dataset("batch size must be positive".to_string()));
        }
        if batch_size > n {
            return Err(AegisError::Dataset(format!(
                "batch size {batch_size} exceeds the {n} available samples"
            )));
        }

        let remaining = n - self.batch_start;
        let actual = if multiple_passes {
            if remaining < batch_size {
                self.order.shuffle(&mut self.rng);
                self.batch_start = 0;
            }
            batch_size
        } else {
            if remaining == 0 {
                return Err(AegisError::Dataset(
                    "pass through the dataset is complete".to_string(),
                ));
            }
            batch_size.min(remaining)
        };

        let end = self.batch_start + actual;
        let batch = self.data.select(&self.order[self.batch_start..end])?;
        self.batch_start = end;
        Ok(batch)
    }

    /// Start a fresh pass without reshuffling.
    pub fn rewind(&mut self) {
        self.batch_start = 0;
    }
}
