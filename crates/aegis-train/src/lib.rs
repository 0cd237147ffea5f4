//! Adversarial training around the L∞ PGD attack.
//!
//! The loop alternates between generating worst-case examples with
//! [`aegis_attack::LinfPgdAttack`] and taking optimizer steps on them,
//! checkpointing along the way and logging natural/adversarial accuracy.
//!
//! - [`config`]: JSON training configuration
//! - [`model`]: softmax-regression classifier that doubles as a gradient oracle
//! - [`data`]: in-memory datasets and shuffled minibatch iteration
//! - [`optimizer`]: Adam and momentum SGD
//! - [`schedule`]: piecewise-constant learning rate
//! - [`checkpoint`]: atomic JSON checkpoints with retention
//! - [`eval`]: natural vs adversarial evaluation
//! - [`trainer`]: the training loop

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod eval;
pub mod model;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{DatasetConfig, TrainConfig};
pub use data::{load_datasets, DataSubset, Dataset};
pub use eval::{evaluate, EvalReport};
pub use model::{LinearClassifier, ParamGradients};
pub use optimizer::{AdamParams, OptimizerKind, OptimizerState};
pub use schedule::PiecewiseConstant;
pub use trainer::{evaluate_checkpoint, TrainReport, Trainer};

pub use aegis_core::{AegisError, Result};
