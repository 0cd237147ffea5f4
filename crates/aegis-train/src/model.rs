//! Softmax-regression classifier.
//!
//! `logits = W · flatten(x) + b`. Input gradients are closed-form, so the
//! classifier serves directly as the attack's [`GradientOracle`], and its
//! parameter gradients drive the training step.

use aegis_attack::{logit_loss, GradientOracle};
use aegis_core::{check_batch_alignment, AegisError, LossFunc, Result};
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Linear classifier over flattened samples.
///
/// Deserialization goes through [`LinearClassifier::from_parts`], so stored
/// parameters with inconsistent shapes are rejected on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ClassifierParts")]
pub struct LinearClassifier {
    sample_shape: Vec<usize>,
    /// Shape `[num_classes, num_features]`.
    weights: Array2<f32>,
    /// Shape `[num_classes]`.
    bias: Array1<f32>,
}

#[derive(Deserialize)]
struct ClassifierParts {
    sample_shape: Vec<usize>,
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl TryFrom<ClassifierParts> for LinearClassifier {
    type Error = AegisError;

    fn try_from(parts: ClassifierParts) -> Result<Self> {
        Self::from_parts(&parts.sample_shape, parts.weights, parts.bias)
    }
}

/// Gradients of the training objective with respect to the parameters.
#[derive(Debug, Clone)]
pub struct ParamGradients {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    /// Objective value: mean cross-entropy plus weight decay.
    pub loss: f32,
}

impl LinearClassifier {
    /// All-zero parameters.
    pub fn zeros(sample_shape: &[usize], num_classes: usize) -> Result<Self> {
        let features = check_dims(sample_shape, num_classes)?;
        Ok(Self {
            sample_shape: sample_shape.to_vec(),
            weights: Array2::zeros((num_classes, features)),
            bias: Array1::zeros(num_classes),
        })
    }

    /// Uniform weights in `±1/sqrt(features)`, zero bias.
    pub fn random<R: Rng>(
        sample_shape: &[usize],
        num_classes: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let features = check_dims(sample_shape, num_classes)?;
        let scale = 1.0 / (features as f32).sqrt();
        Ok(Self {
            sample_shape: sample_shape.to_vec(),
            weights: Array2::from_shape_fn((num_classes, features), |_| {
                rng.random_range(-scale..=scale)
            }),
            bias: Array1::zeros(num_classes),
        })
    }

    /// Build from explicit parameters.
    pub fn from_parts(
        sample_shape: &[usize],
        weights: Array2<f32>,
        bias: Array1<f32>,
    ) -> Result<Self> {
        let features = check_dims(sample_shape, weights.nrows())?;
        if weights.ncols() != features {
            return Err(AegisError::shape_mismatch(
                vec![weights.nrows(), features],
                weights.shape().to_vec(),
            ));
        }
        if bias.len() != weights.nrows() {
            return Err(AegisError::shape_mismatch(vec![weights.nrows()], vec![bias.len()]));
        }
        Ok(Self {
            sample_shape: sample_shape.to_vec(),
            weights,
            bias,
        })
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Mutable access to `(weights, bias)` for optimizer updates.
    pub fn params_mut(&mut self) -> (&mut Array2<f32>, &mut Array1<f32>) {
        (&mut self.weights, &mut self.bias)
    }

    pub fn num_features(&self) -> usize {
        self.weights.ncols()
    }

    /// `sum(W²) / 2`; biases are not decayed.
    pub fn weight_decay_loss(&self) -> f32 {
        0.5 * self.weights.iter().map(|w| w * w).sum::<f32>()
    }

    /// Gradients of `mean_xent + weight_decay * weight_decay_loss`.
    pub fn parameter_gradients(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        weight_decay: f32,
    ) -> Result<ParamGradients> {
        let x = self.flatten(inputs)?;
        self.check_labels(labels)?;
        let n = labels.len();
        if n == 0 {
            return Err(AegisError::InvalidInput(
                "cannot compute parameter gradients for an empty batch".to_string(),
            ));
        }

        let logits = self.affine(&x);
        let mut dlogits = Array2::<f32>::zeros(logits.raw_dim());
        let mut total = 0.0;
        for ((row, &y), mut out) in logits.rows().into_iter().zip(labels).zip(dlogits.rows_mut()) {
            let (loss, grad) = logit_loss(row, y, LossFunc::Xent);
            total += loss;
            out.assign(&grad);
        }
        dlogits /= n as f32;

        let weights = dlogits.t().dot(&x) + &(&self.weights * weight_decay);
        let bias = dlogits.sum_axis(Axis(0));
        let loss = total / n as f32 + weight_decay * self.weight_decay_loss();

        Ok(ParamGradients {
            weights,
            bias,
            loss,
        })
    }

    fn affine(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weights.t()) + &self.bias
    }

    /// Reshape `[N, ...sample_shape]` into `[N, features]`.
    fn flatten(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        if inputs.ndim() == 0 || &inputs.shape()[1..] != self.sample_shape.as_slice() {
            let n = inputs.shape().first().copied().unwrap_or(0);
            let mut expected = vec![n];
            expected.extend_from_slice(&self.sample_shape);
            return Err(AegisError::shape_mismatch(expected, inputs.shape().to_vec()));
        }
        let n = inputs.shape()[0];
        let flat = inputs
            .to_shape((n, self.num_features()))
            .map_err(|e| AegisError::OracleFailure(format!("cannot flatten inputs: {e}")))?;
        Ok(flat.to_owned())
    }

    fn check_labels(&self, labels: &[usize]) -> Result<()> {
        let classes = self.num_classes();
        match labels.iter().find(|&&y| y >= classes) {
            Some(y) => Err(AegisError::InvalidInput(format!(
                "label {y} is outside the {classes} classifier classes"
            ))),
            None => Ok(()),
        }
    }
}

fn check_dims(sample_shape: &[usize], num_classes: usize) -> Result<usize> {
    if num_classes < 2 {
        return Err(AegisError::InvalidConfig(format!(
            "a classifier needs at least 2 classes, got {num_classes}"
        )));
    }
    let features: usize = sample_shape.iter().product();
    if sample_shape.is_empty() || features == 0 {
        return Err(AegisError::InvalidConfig(format!(
            "sample shape {sample_shape:?} has no features"
        )));
    }
    Ok(features)
}

impl GradientOracle for LinearClassifier {
    fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    fn num_classes(&self) -> usize {
        self.weights.nrows()
    }

    fn logits(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        Ok(self.affine(&self.flatten(inputs)?))
    }

    fn loss(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<Array1<f32>> {
        check_batch_alignment(inputs, labels)?;
        self.check_labels(labels)?;
        let logits = self.logits(inputs)?;
        Ok(logits
            .rows()
            .into_iter()
            .zip(labels)
            .map(|(row, &y)| logit_loss(row, y, loss_func).0)
            .collect())
    }

    fn loss_gradient(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<ArrayD<f32>> {
        check_batch_alignment(inputs, labels)?;
        self.check_labels(labels)?;
        let logits = self.logits(inputs)?;
        let mut dlogits = Array2::<f32>::zeros(logits.raw_dim());
        for ((row, &y), mut out) in logits.rows().into_iter().zip(labels).zip(dlogits.rows_mut()) {
            out.assign(&logit_loss(row, y, loss_func).1);
        }
        dlogits
            .dot(&self.weights)
            .into_shape_with_order(IxDyn(inputs.shape()))
            .map_err(|e| AegisError::OracleFailure(format!("cannot reshape gradient: {e}")))
    }
}
