//! Adversarial example generation for adversarial training.
//!
//! The attack sees the classifier only through [`GradientOracle`]: a
//! capability that returns per-sample losses and the gradient of the
//! selected loss with respect to the input batch. [`LinfPgdAttack`] runs
//! projected sign-gradient ascent inside an L∞ ball around each sample,
//! keeping every iterate within the valid input range.

pub mod oracle;
pub mod pgd_attack;

pub use oracle::{argmax, logit_loss, GradientOracle};
pub use pgd_attack::{budget_tolerance, linf_distance, LinfPgdAttack, PgdConfig, PgdResult};

pub use aegis_core::{AegisError, Batch, LossFunc, Result, ValueRange};

#[cfg(test)]
mod tests;
