//! Parameter optimizers for the training step.
//!
//! Adam is the default; momentum SGD is kept for runs that want the
//! classic Madry et al. setup.

use aegis_core::{AegisError, Result};
use ndarray::{Array, ArrayBase, DataMut, Dimension, Ix1, Ix2, Zip};
use serde::{Deserialize, Serialize};

use crate::model::{LinearClassifier, ParamGradients};

/// Which update rule to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam (adaptive moment estimation).
    #[default]
    Adam,
    /// SGD with momentum: `acc = μ·acc + g; θ -= lr·acc`.
    Momentum,
}

/// Adam optimizer hyperparameters.
///
/// Defaults match the usual framework values: β₁=0.9, β₂=0.999, ε=1e-8.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    /// Exponential decay rate for first moment (β₁)
    pub beta1: f32,
    /// Exponential decay rate for second moment (β₂)
    pub beta2: f32,
    /// Small constant for numerical stability (ε)
    pub epsilon: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Moment buffers for one parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Moments<D: Dimension> {
    /// First moment (Adam) or velocity accumulator (momentum).
    m: Array<f32, D>,
    /// Second moment (Adam only).
    v: Array<f32, D>,
}

impl<D: Dimension> Moments<D> {
    fn zeros(dim: D) -> Self {
        Self {
            m: Array::zeros(dim.clone()),
            v: Array::zeros(dim),
        }
    }
}

/// Optimizer state carried across steps and stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    kind: OptimizerKind,
    momentum: f32,
    adam: AdamParams,
    /// Number of updates applied so far.
    t: usize,
    weights: Moments<Ix2>,
    bias: Moments<Ix1>,
}

impl OptimizerState {
    /// Fresh state sized for `model`.
    pub fn new(kind: OptimizerKind, momentum: f32, model: &LinearClassifier) -> Result<Self> {
        if !(0.0..1.0).contains(&momentum) {
            return Err(AegisError::InvalidConfig(format!(
                "momentum must be in [0, 1), got {momentum}"
            )));
        }
        Ok(Self {
            kind,
            momentum,
            adam: AdamParams::default(),
            t: 0,
            weights: Moments::zeros(model.weights().raw_dim()),
            bias: Moments::zeros(model.bias().raw_dim()),
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.t
    }

    /// Check that the buffers fit `model` (e.g. after restoring a checkpoint).
    pub fn matches(&self, model: &LinearClassifier) -> bool {
        self.weights.m.shape() == model.weights().shape()
            && self.bias.m.shape() == model.bias().shape()
    }

    /// Apply one update to `model` in the descent direction of `grads`.
    pub fn step(
        &mut self,
        model: &mut LinearClassifier,
        grads: &ParamGradients,
        learning_rate: f32,
    ) -> Result<()> {
        if !self.matches(model) {
            return Err(AegisError::InvalidInput(format!(
                "optimizer state {:?}/{:?} does not fit model parameters {:?}/{:?}",
                self.weights.m.shape(),
                self.bias.m.shape(),
                model.weights().shape(),
                model.bias().shape()
            )));
        }
        if grads.weights.shape() != model.weights().shape() {
            return Err(AegisError::shape_mismatch(
                model.weights().shape().to_vec(),
                grads.weights.shape().to_vec(),
            ));
        }
        if grads.bias.shape() != model.bias().shape() {
            return Err(AegisError::shape_mismatch(
                model.bias().shape().to_vec(),
                grads.bias.shape().to_vec(),
            ));
        }

        self.t += 1;
        let (t, lr, mu) = (self.t, learning_rate, self.momentum);
        let (weights, bias) = model.params_mut();
        match self.kind {
            OptimizerKind::Adam => {
                adam_update(weights, &grads.weights, &mut self.weights, &self.adam, t, lr);
                adam_update(bias, &grads.bias, &mut self.bias, &self.adam, t, lr);
            }
            OptimizerKind::Momentum => {
                momentum_update(weights, &grads.weights, &mut self.weights, mu, lr);
                momentum_update(bias, &grads.bias, &mut self.bias, mu, lr);
            }
        }
        Ok(())
    }
}

/// Adam update rule:
/// - m = β₁ * m + (1 - β₁) * grad
/// - v = β₂ * v + (1 - β₂) * grad²
/// - m_hat = m / (1 - β₁^t), v_hat = v / (1 - β₂^t)
/// - θ = θ - lr * m_hat / (√v_hat + ε)
fn adam_update<S, D>(
    param: &mut ArrayBase<S, D>,
    grad: &Array<f32, D>,
    moments: &mut Moments<D>,
    params: &AdamParams,
    t: usize,
    learning_rate: f32,
) where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    let t_f = t.max(1) as f32;
    let bias_correction1 = 1.0 - params.beta1.powf(t_f);
    let bias_correction2 = 1.0 - params.beta2.powf(t_f);

    Zip::from(param)
        .and(grad)
        .and(&mut moments.m)
        .and(&mut moments.v)
        .for_each(|p, &g, m, v| {
            *m = params.beta1 * *m + (1.0 - params.beta1) * g;
            *v = params.beta2 * *v + (1.0 - params.beta2) * g * g;
            let m_hat = *m / bias_correction1;
            let v_hat = *v / bias_correction2;
            *p -= learning_rate * m_hat / (v_hat.sqrt() + params.epsilon);
        });
}

fn momentum_update<S, D>(
    param: &mut ArrayBase<S, D>,
    grad: &Array<f32, D>,
    moments: &mut Moments<D>,
    momentum: f32,
    learning_rate: f32,
) where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    Zip::from(param)
        .and(grad)
        .and(&mut moments.m)
        .for_each(|p, &g, acc| {
            *acc = momentum * *acc + g;
            *p -= learning_rate * *acc;
        });
}
