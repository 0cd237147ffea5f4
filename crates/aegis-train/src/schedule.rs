//! Piecewise-constant learning rate.

use aegis_core::{AegisError, Result};

/// Learning rate that is constant between step boundaries.
///
/// Built from `[[step, lr], ...]` pairs: the first pair's step is ignored,
/// the remaining steps are boundaries. Step `t` uses `values[i]` where `i`
/// is the number of boundaries strictly below `t`, so a boundary step
/// still uses the preceding rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseConstant {
    boundaries: Vec<usize>,
    values: Vec<f32>,
}

impl PiecewiseConstant {
    pub fn from_schedule(schedule: &[(usize, f32)]) -> Result<Self> {
        if schedule.is_empty() {
            return Err(AegisError::InvalidConfig(
                "step_size_schedule must contain at least one entry".to_string(),
            ));
        }
        if let Some(&(step, lr)) = schedule.iter().find(|(_, lr)| !lr.is_finite() || *lr <= 0.0) {
            return Err(AegisError::InvalidConfig(format!(
                "learning rate at step {step} must be finite and positive, got {lr}"
            )));
        }

        let boundaries: Vec<usize> = schedule.iter().skip(1).map(|&(step, _)| step).collect();
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(AegisError::InvalidConfig(format!(
                "step_size_schedule boundaries must be strictly increasing, got {boundaries:?}"
            )));
        }

        Ok(Self {
            boundaries,
            values: schedule.iter().map(|&(_, lr)| lr).collect(),
        })
    }

    /// Learning rate at global step `step`.
    pub fn learning_rate(&self, step: usize) -> f32 {
        let i = self.boundaries.partition_point(|&b| b < step);
        self.values[i]
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }
}
