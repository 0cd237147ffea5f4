//! Training configuration.
//!
//! A run is described by a single JSON file. Keys follow the classic
//! adversarial-training `config.json` layout so existing configs carry over:
//!
//! ```json
//! {
//!   "model_dir": "models/adv_trained",
//!   "random_seed": 451760341,
//!   "max_num_training_steps": 2000,
//!   "num_output_steps": 100,
//!   "num_checkpoint_steps": 500,
//!   "step_size_schedule": [[0, 0.001], [1000, 0.0001]],
//!   "weight_decay": 0.0002,
//!   "momentum": 0.9,
//!   "training_batch_size": 50,
//!   "eval_batch_size": 100,
//!   "num_eval_examples": 1000,
//!   "epsilon": 0.3,
//!   "num_steps": 40,
//!   "step_size": 0.01,
//!   "random_start": true,
//!   "loss_func": "xent"
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use aegis_attack::PgdConfig;
use aegis_core::{AegisError, LossFunc, Result, ValueRange};
use serde::{Deserialize, Serialize};

use crate::optimizer::OptimizerKind;
use crate::schedule::PiecewiseConstant;

/// Where training and evaluation samples come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// JSON dataset file. When absent a synthetic dataset is generated.
    pub path: Option<PathBuf>,
    pub num_classes: usize,
    pub sample_shape: Vec<usize>,
    pub train_size: usize,
    pub eval_size: usize,
    /// Half-width of each synthetic class cluster, as a fraction of the value range.
    pub spread: f32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: None,
            num_classes: 10,
            sample_shape: vec![1, 8, 8],
            train_size: 5000,
            eval_size: 1000,
            spread: 0.2,
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.path.is_some() {
            return Ok(());
        }
        if self.num_classes < 2 {
            return Err(AegisError::InvalidConfig(format!(
                "dataset.num_classes must be at least 2, got {}",
                self.num_classes
            )));
        }
        if self.sample_shape.is_empty() || self.sample_shape.contains(&0) {
            return Err(AegisError::InvalidConfig(format!(
                "dataset.sample_shape {:?} has no features",
                self.sample_shape
            )));
        }
        if self.train_size == 0 || self.eval_size == 0 {
            return Err(AegisError::InvalidConfig(
                "dataset.train_size and dataset.eval_size must be positive".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.spread) {
            return Err(AegisError::InvalidConfig(format!(
                "dataset.spread must be in [0, 0.5], got {}",
                self.spread
            )));
        }
        Ok(())
    }
}

/// Full description of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model_dir: PathBuf,
    /// Directory holding a checkpoint to warm-start the classifier from.
    #[serde(default)]
    pub pretrained_model_dir: Option<PathBuf>,
    pub random_seed: u64,

    pub max_num_training_steps: usize,
    pub num_output_steps: usize,
    pub num_checkpoint_steps: usize,
    /// `[[step, learning_rate], ...]`, see [`PiecewiseConstant`].
    pub step_size_schedule: Vec<(usize, f32)>,
    pub weight_decay: f32,
    pub momentum: f32,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    pub training_batch_size: usize,

    pub eval_batch_size: usize,
    pub num_eval_examples: usize,
    #[serde(default)]
    pub eval_on_checkpoint: bool,
    /// Train on PGD examples instead of clean ones.
    #[serde(default = "default_true")]
    pub adversarial_training: bool,

    pub epsilon: f32,
    pub num_steps: usize,
    pub step_size: f32,
    pub random_start: bool,
    pub loss_func: LossFunc,
    #[serde(default)]
    pub value_range: ValueRange,

    #[serde(default)]
    pub dataset: DatasetConfig,
}

fn default_true() -> bool {
    true
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models/adv_trained"),
            pretrained_model_dir: None,
            random_seed: 451_760_341,
            max_num_training_steps: 2000,
            num_output_steps: 100,
            num_checkpoint_steps: 500,
            step_size_schedule: vec![(0, 1e-3), (1000, 1e-4)],
            weight_decay: 2e-4,
            momentum: 0.9,
            optimizer: OptimizerKind::Adam,
            training_batch_size: 50,
            eval_batch_size: 100,
            num_eval_examples: 1000,
            eval_on_checkpoint: false,
            adversarial_training: true,
            epsilon: 0.3,
            num_steps: 40,
            step_size: 0.01,
            random_start: true,
            loss_func: LossFunc::Xent,
            value_range: ValueRange::unit(),
            dataset: DatasetConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| AegisError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("num_output_steps", self.num_output_steps),
            ("num_checkpoint_steps", self.num_checkpoint_steps),
            ("training_batch_size", self.training_batch_size),
            ("eval_batch_size", self.eval_batch_size),
        ] {
            if value == 0 {
                return Err(AegisError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(AegisError::InvalidConfig(format!(
                "weight_decay must be finite and non-negative, got {}",
                self.weight_decay
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(AegisError::InvalidConfig(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        self.schedule()?;
        self.attack_config().validate()?;
        self.dataset.validate()?;
        if self.dataset.path.is_none() {
            if self.training_batch_size > self.dataset.train_size {
                return Err(AegisError::InvalidConfig(format!(
                    "training_batch_size {} exceeds dataset.train_size {}",
                    self.training_batch_size, self.dataset.train_size
                )));
            }
            if self.num_eval_examples > self.dataset.eval_size {
                return Err(AegisError::InvalidConfig(format!(
                    "num_eval_examples {} exceeds dataset.eval_size {}",
                    self.num_eval_examples, self.dataset.eval_size
                )));
            }
        }
        Ok(())
    }

    /// Attack hyperparameters used both for training and evaluation.
    pub fn attack_config(&self) -> PgdConfig {
        PgdConfig {
            epsilon: self.epsilon,
            num_steps: self.num_steps,
            step_size: self.step_size,
            random_start: self.random_start,
            loss_func: self.loss_func,
            value_range: self.value_range,
        }
    }

    pub fn schedule(&self) -> Result<PiecewiseConstant> {
        PiecewiseConstant::from_schedule(&self.step_size_schedule)
    }
}
