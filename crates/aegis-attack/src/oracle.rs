//! The gradient oracle boundary.
//!
//! Everything the attack knows about a classifier goes through this trait.
//! Execution contexts, computation graphs and parameter storage live behind
//! it; the attack only asks for logits, per-sample losses and input
//! gradients.

use aegis_core::{check_batch_alignment, LossFunc, Result, CW_CONFIDENCE};
use ndarray::{Array1, Array2, ArrayD, ArrayView1};

/// A differentiable classifier that can report losses and input gradients.
///
/// Implementations must be read-only with respect to their parameters: the
/// attack may query an oracle many times per batch and assumes the answers
/// depend only on the arguments. Oracles that are queried from several
/// threads at once must make their read path reentrant themselves.
pub trait GradientOracle {
    /// Shape of a single sample, without the batch axis.
    fn sample_shape(&self) -> &[usize];

    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Logits of shape `[N, num_classes]` for an input batch `[N, ...sample_shape]`.
    fn logits(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>>;

    /// Per-sample loss of shape `[N]` under the selected loss signal.
    fn loss(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<Array1<f32>>;

    /// Gradient of the summed per-sample loss with respect to `inputs`.
    ///
    /// The returned tensor has the same shape as `inputs`. Because each
    /// sample's loss depends only on that sample, row `i` is the gradient of
    /// sample `i`'s own loss.
    fn loss_gradient(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<ArrayD<f32>>;

    /// Predicted class per sample.
    fn predictions(&self, inputs: &ArrayD<f32>) -> Result<Vec<usize>> {
        let logits = self.logits(inputs)?;
        Ok(logits.rows().into_iter().map(argmax).collect())
    }

    /// Number of samples whose prediction equals their label.
    fn num_correct(&self, inputs: &ArrayD<f32>, labels: &[usize]) -> Result<usize> {
        check_batch_alignment(inputs, labels)?;
        let predictions = self.predictions(inputs)?;
        Ok(predictions
            .iter()
            .zip(labels)
            .filter(|(p, y)| p == y)
            .count())
    }

    /// Fraction of correctly classified samples (0 for an empty batch).
    fn accuracy(&self, inputs: &ArrayD<f32>, labels: &[usize]) -> Result<f32> {
        if labels.is_empty() {
            return Ok(0.0);
        }
        let correct = self.num_correct(inputs, labels)?;
        Ok(correct as f32 / labels.len() as f32)
    }

    /// Mean per-sample loss (0 for an empty batch).
    fn mean_loss(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<f32> {
        let losses = self.loss(inputs, labels, loss_func)?;
        Ok(losses.mean().unwrap_or(0.0))
    }
}

impl<T: GradientOracle + ?Sized> GradientOracle for &T {
    fn sample_shape(&self) -> &[usize] {
        (**self).sample_shape()
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn logits(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        (**self).logits(inputs)
    }

    fn loss(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<Array1<f32>> {
        (**self).loss(inputs, labels, loss_func)
    }

    fn loss_gradient(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<ArrayD<f32>> {
        (**self).loss_gradient(inputs, labels, loss_func)
    }
}

/// Index of the largest logit. Ties resolve to the lowest index.
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (idx, &value) in row.iter().enumerate() {
        if value > best_value {
            best = idx;
            best_value = value;
        }
    }
    best
}

/// Loss of one logit row and its gradient with respect to the logits.
///
/// Oracles built on a differentiable model chain the returned logit
/// gradient back through the model to obtain the input gradient.
///
/// - `Xent`: `logsumexp(z) - z_y`, gradient `softmax(z) - onehot(y)`.
/// - `Cw`: `-relu(z_y - z_j* + κ)` with `j*` the best wrong class; the
///   gradient is `-1` at `y` and `+1` at `j*` while the margin term is
///   active, zero once it saturates. With fewer than two classes there is
///   no wrong class and the loss is zero.
///
/// # Panics
/// Panics if `label >= logits.len()` (callers validate labels against
/// [`GradientOracle::num_classes`] first), except for `Cw` with fewer than
/// two logits.
pub fn logit_loss(
    logits: ArrayView1<f32>,
    label: usize,
    loss_func: LossFunc,
) -> (f32, Array1<f32>) {
    let n = logits.len();
    let mut grad = Array1::<f32>::zeros(n);
    match loss_func {
        LossFunc::Xent => {
            let max = logits.fold(f32::NEG_INFINITY, |m, &z| m.max(z));
            let exps = logits.mapv(|z| (z - max).exp());
            let sum: f32 = exps.sum();
            let log_sum_exp = max + sum.ln();
            for (g, e) in grad.iter_mut().zip(exps.iter()) {
                *g = e / sum;
            }
            grad[label] -= 1.0;
            (log_sum_exp - logits[label], grad)
        }
        LossFunc::Cw => {
            let wrong = logits
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != label)
                .fold(None, |best: Option<(usize, f32)>, (idx, &z)| match best {
                    Some((_, bz)) if bz >= z => best,
                    _ => Some((idx, z)),
                });
            let Some((wrong_idx, wrong_logit)) = wrong else {
                return (0.0, grad);
            };
            let margin = logits[label] - wrong_logit + CW_CONFIDENCE;
            if margin > 0.0 {
                grad[label] = -1.0;
                grad[wrong_idx] = 1.0;
                (-margin, grad)
            } else {
                (0.0, grad)
            }
        }
    }
}
