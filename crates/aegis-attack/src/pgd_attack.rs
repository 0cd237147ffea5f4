//! L∞ PGD (Projected Gradient Descent) attack for adversarial training.
//!
//! Given clean inputs and their true labels, the attack searches the L∞ ball
//! of radius ε around each sample for a point that maximizes the oracle's
//! loss. It is untargeted: the ascent pushes away from the true class rather
//! than toward a chosen wrong class.
//!
//! ## Algorithm
//!
//! 1. **Initialization**: `x_adv = x`, or with `random_start`
//!    `x_adv = clip_range(x + U(-ε, ε))`
//! 2. **Gradient Step**: `x_adv += step_size * sign(∇ₓ loss(x_adv, y))`
//! 3. **Projection**: clip `x_adv - x` to `[-ε, ε]`, then clip `x_adv` to the
//!    valid input range
//! 4. **Repeat** exactly `num_steps` times (no early exit)
//!
//! Clean inputs must already lie inside the valid range. Under that
//! precondition the range clip only ever moves an iterate toward its clean
//! sample, so the ε budget holds up to floating-point rounding of `x + δ`
//! (see [`budget_tolerance`]).
//!
//! ## References
//!
//! - Madry et al. (2018). "Towards Deep Learning Models Resistant to
//!   Adversarial Attacks"
//! - Carlini & Wagner (2017). "Towards Evaluating the Robustness of Neural
//!   Networks"

use aegis_core::{check_batch_alignment, AegisError, Batch, LossFunc, Result, ValueRange};
use ndarray::{ArrayD, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::GradientOracle;

/// Configuration for the L∞ PGD attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgdConfig {
    /// Maximum per-element perturbation (L∞ radius).
    pub epsilon: f32,
    /// Number of gradient steps.
    pub num_steps: usize,
    /// Per-step ascent magnitude.
    pub step_size: f32,
    /// Start from a uniformly random point in the ε-ball instead of the clean input.
    pub random_start: bool,
    /// Loss signal whose input gradient drives the ascent.
    pub loss_func: LossFunc,
    /// Valid input range enforced after every step.
    #[serde(default)]
    pub value_range: ValueRange,
}

impl Default for PgdConfig {
    fn default() -> Self {
        Self::madry_mnist()
    }
}

impl PgdConfig {
    /// MNIST adversary from Madry et al.: ε=0.3, 40 steps of 0.01 on [0, 1].
    pub fn madry_mnist() -> Self {
        Self {
            epsilon: 0.3,
            num_steps: 40,
            step_size: 0.01,
            random_start: true,
            loss_func: LossFunc::Xent,
            value_range: ValueRange::unit(),
        }
    }

    /// CIFAR-10 adversary from Madry et al.: ε=8, 7 steps of 2 on raw [0, 255] pixels.
    pub fn madry_cifar() -> Self {
        Self {
            epsilon: 8.0,
            num_steps: 7,
            step_size: 2.0,
            random_start: true,
            loss_func: LossFunc::Xent,
            value_range: ValueRange::pixel(),
        }
    }

    /// Single full-budget step from the clean input (FGSM).
    pub fn fgsm(epsilon: f32) -> Self {
        Self {
            epsilon,
            num_steps: 1,
            step_size: epsilon,
            random_start: false,
            loss_func: LossFunc::Xent,
            value_range: ValueRange::unit(),
        }
    }

    /// Reject configurations that would silently produce degenerate output.
    pub fn validate(&self) -> Result<()> {
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(AegisError::InvalidConfig(format!(
                "epsilon must be a finite value >= 0, got {}",
                self.epsilon
            )));
        }
        if !self.step_size.is_finite() || self.step_size <= 0.0 {
            return Err(AegisError::InvalidConfig(format!(
                "step_size must be a finite value > 0, got {}",
                self.step_size
            )));
        }
        self.value_range.validate()
    }
}

/// Result of a PGD attack on one batch.
#[derive(Debug, Clone)]
pub struct PgdResult {
    /// Adversarial batch, same shape as the clean inputs.
    pub adversarial: ArrayD<f32>,
    /// Number of oracle gradient queries issued (always `num_steps`).
    pub gradient_evaluations: usize,
    /// Achieved L∞ distance from the clean inputs.
    pub max_perturbation: f32,
}

/// Slack allowed on the ε budget for floating-point rounding of `x + δ`.
pub fn budget_tolerance(range: &ValueRange) -> f32 {
    1e-5 * range.width().max(1.0)
}

/// Largest absolute element-wise difference between two same-shape tensors.
pub fn linf_distance(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    Zip::from(a)
        .and(b)
        .fold(0.0_f32, |acc, &x, &y| acc.max((x - y).abs()))
}

/// Sign with `sign(0) = 0`, so flat coordinates are left where they are.
#[inline]
fn sign(g: f32) -> f32 {
    if g > 0.0 {
        1.0
    } else if g < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// L∞ PGD attacker.
///
/// Holds only immutable hyperparameters; the oracle and the random source
/// are supplied per call, so one attacker can serve several oracles or
/// threads with independent random streams.
#[derive(Debug, Clone)]
pub struct LinfPgdAttack {
    config: PgdConfig,
}

impl LinfPgdAttack {
    /// Create an attacker, failing with `InvalidConfig` on bad hyperparameters.
    pub fn new(config: PgdConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PgdConfig {
        &self.config
    }

    /// Produce adversarial versions of `inputs`.
    ///
    /// `inputs` is never modified. Randomness is drawn only from `rng`, and
    /// only when `random_start` is set.
    pub fn perturb<O, R>(
        &self,
        oracle: &O,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        rng: &mut R,
    ) -> Result<ArrayD<f32>>
    where
        O: GradientOracle + ?Sized,
        R: Rng,
    {
        Ok(self.attack(oracle, inputs, labels, rng)?.adversarial)
    }

    /// Perturb a [`Batch`], keeping its labels.
    pub fn perturb_batch<O, R>(&self, oracle: &O, batch: &Batch, rng: &mut R) -> Result<Batch>
    where
        O: GradientOracle + ?Sized,
        R: Rng,
    {
        let adversarial = self.perturb(oracle, &batch.inputs, &batch.labels, rng)?;
        Ok(Batch {
            inputs: adversarial,
            labels: batch.labels.clone(),
        })
    }

    /// Run the attack and report query count and achieved distance.
    pub fn attack<O, R>(
        &self,
        oracle: &O,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        rng: &mut R,
    ) -> Result<PgdResult>
    where
        O: GradientOracle + ?Sized,
        R: Rng,
    {
        self.check_inputs(oracle, inputs, labels)?;

        let cfg = &self.config;
        let eps = cfg.epsilon;
        let range = cfg.value_range;

        let mut x_adv = if cfg.random_start {
            self.sample_start(inputs, rng)
        } else {
            inputs.clone()
        };

        for step in 0..cfg.num_steps {
            let gradient = oracle.loss_gradient(&x_adv, labels, cfg.loss_func)?;
            check_gradient(&gradient, inputs)?;

            Zip::from(&mut x_adv)
                .and(&gradient)
                .and(inputs)
                .for_each(|xa, &g, &x0| {
                    let stepped = *xa + cfg.step_size * sign(g);
                    let delta = (stepped - x0).clamp(-eps, eps);
                    *xa = range.clamp(x0 + delta);
                });

            trace!(
                "PGD step {}/{}: L∞ distance {}",
                step + 1,
                cfg.num_steps,
                linf_distance(&x_adv, inputs)
            );
        }

        let max_perturbation = linf_distance(&x_adv, inputs);
        debug!(
            "PGD ({}) perturbed {} samples in {} steps: ε={}, achieved L∞ {}",
            cfg.loss_func,
            labels.len(),
            cfg.num_steps,
            eps,
            max_perturbation
        );

        Ok(PgdResult {
            adversarial: x_adv,
            gradient_evaluations: cfg.num_steps,
            max_perturbation,
        })
    }

    /// Uniform random point in the ε-ball around `inputs`, clipped to the valid range.
    fn sample_start<R: Rng>(&self, inputs: &ArrayD<f32>, rng: &mut R) -> ArrayD<f32> {
        let eps = self.config.epsilon;
        let range = self.config.value_range;
        // Scale a unit draw so budgets near f32::MAX keep a finite sampling range.
        inputs.mapv(|x| range.clamp(x + rng.random_range(-1.0_f32..=1.0) * eps))
    }

    /// Validate shapes, labels and value range before any oracle query.
    fn check_inputs<O: GradientOracle + ?Sized>(
        &self,
        oracle: &O,
        inputs: &ArrayD<f32>,
        labels: &[usize],
    ) -> Result<()> {
        check_batch_alignment(inputs, labels)?;

        let sample_shape = &inputs.shape()[1..];
        if sample_shape != oracle.sample_shape() {
            let mut expected = vec![labels.len()];
            expected.extend_from_slice(oracle.sample_shape());
            return Err(AegisError::shape_mismatch(expected, inputs.shape().to_vec()));
        }

        let num_classes = oracle.num_classes();
        if let Some((idx, &label)) = labels
            .iter()
            .enumerate()
            .find(|&(_, &y)| y >= num_classes)
        {
            return Err(AegisError::InvalidInput(format!(
                "label {label} at position {idx} is outside the {num_classes} oracle classes"
            )));
        }

        let range = self.config.value_range;
        if let Some(value) = inputs.iter().find(|&&v| !range.contains(v)) {
            return Err(AegisError::InvalidInput(format!(
                "input value {} lies outside the valid range [{}, {}]",
                value, range.lower, range.upper
            )));
        }

        Ok(())
    }
}

fn check_gradient(gradient: &ArrayD<f32>, inputs: &ArrayD<f32>) -> Result<()> {
    if gradient.shape() != inputs.shape() {
        return Err(AegisError::OracleFailure(format!(
            "gradient shape {:?} does not match input shape {:?}",
            gradient.shape(),
            inputs.shape()
        )));
    }
    if gradient.iter().any(|g| !g.is_finite()) {
        return Err(AegisError::OracleFailure(
            "gradient contains non-finite values".to_string(),
        ));
    }
    Ok(())
}
