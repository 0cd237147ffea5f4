//! Natural vs adversarial evaluation.

use std::fmt;

use aegis_attack::{GradientOracle, LinfPgdAttack};
use aegis_core::{AegisError, LossFunc, Result};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::Dataset;

/// Accuracy and mean cross-entropy on clean and attacked inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub num_examples: usize,
    pub nat_accuracy: f32,
    pub adv_accuracy: f32,
    pub avg_nat_loss: f32,
    pub avg_adv_loss: f32,
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "natural: {:.2}%  adversarial: {:.2}%  avg nat loss: {:.4}  avg adv loss: {:.4}",
            100.0 * self.nat_accuracy,
            100.0 * self.adv_accuracy,
            self.avg_nat_loss,
            self.avg_adv_loss
        )
    }
}

#[derive(Default)]
struct BatchTotals {
    nat_correct: usize,
    adv_correct: usize,
    nat_loss: f64,
    adv_loss: f64,
}

/// Evaluate `oracle` on the first `num_examples` samples of `dataset`.
///
/// Batches run in parallel. Batch `i` attacks with an RNG seeded
/// `seed + i`, so the report does not depend on thread scheduling.
pub fn evaluate<O>(
    oracle: &O,
    attack: &LinfPgdAttack,
    dataset: &Dataset,
    num_examples: usize,
    batch_size: usize,
    seed: u64,
) -> Result<EvalReport>
where
    O: GradientOracle + Sync + ?Sized,
{
    if num_examples == 0 || batch_size == 0 {
        return Err(AegisError::InvalidConfig(
            "num_eval_examples and eval_batch_size must be positive".to_string(),
        ));
    }
    if num_examples > dataset.len() {
        return Err(AegisError::Dataset(format!(
            "cannot evaluate {num_examples} examples from a dataset of {}",
            dataset.len()
        )));
    }

    let num_batches = num_examples.div_ceil(batch_size);
    let per_batch: Vec<BatchTotals> = (0..num_batches)
        .into_par_iter()
        .map(|i| {
            let start = i * batch_size;
            let end = (start + batch_size).min(num_examples);
            let batch = dataset.slice(start, end)?;
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            let adversarial = attack.perturb(oracle, &batch.inputs, &batch.labels, &mut rng)?;

            Ok(BatchTotals {
                nat_correct: oracle.num_correct(&batch.inputs, &batch.labels)?,
                adv_correct: oracle.num_correct(&adversarial, &batch.labels)?,
                nat_loss: sum_loss(oracle, &batch.inputs, &batch.labels)?,
                adv_loss: sum_loss(oracle, &adversarial, &batch.labels)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let totals = per_batch.into_iter().fold(BatchTotals::default(), |acc, b| BatchTotals {
        nat_correct: acc.nat_correct + b.nat_correct,
        adv_correct: acc.adv_correct + b.adv_correct,
        nat_loss: acc.nat_loss + b.nat_loss,
        adv_loss: acc.adv_loss + b.adv_loss,
    });

    let n = num_examples as f64;
    let report = EvalReport {
        num_examples,
        nat_accuracy: (totals.nat_correct as f64 / n) as f32,
        adv_accuracy: (totals.adv_correct as f64 / n) as f32,
        avg_nat_loss: (totals.nat_loss / n) as f32,
        avg_adv_loss: (totals.adv_loss / n) as f32,
    };
    debug!("Evaluated {} batches: {}", num_batches, report);
    Ok(report)
}

fn sum_loss<O: GradientOracle + ?Sized>(
    oracle: &O,
    inputs: &ArrayD<f32>,
    labels: &[usize],
) -> Result<f64> {
    let losses = oracle.loss(inputs, labels, LossFunc::Xent)?;
    Ok(losses.iter().map(|&l| l as f64).sum())
}
