//! Core types and error taxonomy for aegis adversarial training.
//!
//! This crate holds the vocabulary shared by the attack and the training
//! loop: the valid input range, the loss signal that drives an attack, a
//! positionally aligned `(inputs, labels)` batch, and the error type every
//! other crate propagates.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

/// Closed interval of valid input values: [lower, upper].
///
/// Images are typically normalized to [0, 1] or kept as raw [0, 255] pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub lower: f32,
    pub upper: f32,
}

impl ValueRange {
    /// Create a range, rejecting empty, inverted or non-finite intervals.
    pub fn new(lower: f32, upper: f32) -> Result<Self> {
        if !lower.is_finite() || !upper.is_finite() {
            return Err(AegisError::InvalidConfig(format!(
                "value range must be finite, got [{lower}, {upper}]"
            )));
        }
        if lower >= upper {
            return Err(AegisError::InvalidConfig(format!(
                "value range lower bound {lower} must be below upper bound {upper}"
            )));
        }
        Ok(Self { lower, upper })
    }

    /// Normalized pixel range [0, 1].
    #[inline]
    pub const fn unit() -> Self {
        Self {
            lower: 0.0,
            upper: 1.0,
        }
    }

    /// Raw 8-bit pixel range [0, 255].
    #[inline]
    pub const fn pixel() -> Self {
        Self {
            lower: 0.0,
            upper: 255.0,
        }
    }

    /// Check if this range contains a value.
    #[inline]
    pub fn contains(&self, value: f32) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Width of the range.
    #[inline]
    pub fn width(&self) -> f32 {
        self.upper - self.lower
    }

    /// Clamp a value into the range.
    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.lower, self.upper)
    }

    /// Re-validate a range that may have been built field by field (e.g. deserialized).
    pub fn validate(&self) -> Result<()> {
        Self::new(self.lower, self.upper).map(|_| ())
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::unit()
    }
}

impl From<RangeInclusive<f32>> for ValueRange {
    fn from(range: RangeInclusive<f32>) -> Self {
        debug_assert!(
            range.start() < range.end(),
            "Invalid range: {} >= {}",
            range.start(),
            range.end()
        );
        Self {
            lower: *range.start(),
            upper: *range.end(),
        }
    }
}

/// Confidence margin κ of the Carlini-Wagner loss.
pub const CW_CONFIDENCE: f32 = 50.0;

/// Which scalar the attack ascends.
///
/// - `Xent`: softmax cross-entropy against the true label.
/// - `Cw`: `-relu(z_true - max_{j != true} z_j + κ)`, a margin loss that
///   saturates once the best wrong class wins by κ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossFunc {
    #[default]
    Xent,
    Cw,
}

impl LossFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossFunc::Xent => "xent",
            LossFunc::Cw => "cw",
        }
    }
}

impl fmt::Display for LossFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossFunc {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "xent" => Ok(LossFunc::Xent),
            "cw" => Ok(LossFunc::Cw),
            other => Err(AegisError::InvalidConfig(format!(
                "unknown loss function '{other}', expected 'xent' or 'cw'"
            ))),
        }
    }
}

/// A minibatch of samples with positionally aligned class labels.
///
/// `inputs` has shape `[N, ...sample_shape]` and `labels.len() == N`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: ArrayD<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn new(inputs: ArrayD<f32>, labels: Vec<usize>) -> Result<Self> {
        check_batch_alignment(&inputs, &labels)?;
        Ok(Self { inputs, labels })
    }

    /// Number of samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shape of a single sample (input shape without the batch axis).
    #[inline]
    pub fn sample_shape(&self) -> &[usize] {
        &self.inputs.shape()[1..]
    }
}

/// Verify that `inputs` has a batch axis whose length matches `labels`.
pub fn check_batch_alignment(inputs: &ArrayD<f32>, labels: &[usize]) -> Result<()> {
    if inputs.ndim() == 0 {
        return Err(AegisError::shape_mismatch(
            vec![labels.len()],
            inputs.shape().to_vec(),
        ));
    }
    let n = inputs.shape()[0];
    if n != labels.len() {
        return Err(AegisError::shape_mismatch(vec![n], vec![labels.len()]));
    }
    Ok(())
}

/// Error types for aegis operations.
#[derive(Debug, Error)]
pub enum AegisError {
    /// Input, label and oracle shapes disagree.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Hyperparameters rejected at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Well-shaped data that violates a precondition (out-of-range values, unknown labels).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The gradient oracle reported or produced an unusable result.
    #[error("Oracle failure: {0}")]
    OracleFailure(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AegisError {
    /// Create a ShapeMismatch error, panicking if shapes are identical (bug indicator).
    #[track_caller]
    pub fn shape_mismatch(expected: Vec<usize>, got: Vec<usize>) -> Self {
        if expected == got {
            let loc = std::panic::Location::caller();
            panic!(
                "BUG at {}:{}:{}: ShapeMismatch created with identical shapes: {:?}",
                loc.file(),
                loc.line(),
                loc.column(),
                expected
            );
        }
        AegisError::ShapeMismatch { expected, got }
    }
}

pub type Result<T> = std::result::Result<T, AegisError>;
