//! The adversarial training loop.

use std::path::{Path, PathBuf};
use std::time::Instant;

use aegis_attack::{GradientOracle, LinfPgdAttack};
use aegis_core::{AegisError, Batch, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::TrainConfig;
use crate::data::{load_datasets, DataSubset, Dataset};
use crate::eval::{evaluate, EvalReport};
use crate::model::LinearClassifier;
use crate::optimizer::OptimizerState;
use crate::schedule::PiecewiseConstant;

/// Summary of a finished [`Trainer::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    /// Global step the run started from (non-zero after a resume).
    pub start_step: usize,
    pub final_step: usize,
    /// Training-batch accuracies at the last output step.
    pub last_nat_accuracy: Option<f32>,
    pub last_adv_accuracy: Option<f32>,
    /// Evaluation from the last checkpoint, when `eval_on_checkpoint` is set.
    pub last_eval: Option<EvalReport>,
    /// Most recent checkpoint written during the run.
    pub last_checkpoint: Option<PathBuf>,
}

/// Owns the classifier, optimizer, data and checkpoint store for one run.
pub struct Trainer {
    config: TrainConfig,
    model: LinearClassifier,
    optimizer: OptimizerState,
    schedule: PiecewiseConstant,
    attack: LinfPgdAttack,
    train: DataSubset,
    eval_data: Dataset,
    store: CheckpointStore,
    global_step: usize,
    attack_rng: StdRng,
}

impl Trainer {
    /// Prepare a run: build the data, create `model_dir` with a copy of the
    /// config, and initialize the classifier (from `pretrained_model_dir`
    /// when set).
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.random_seed;
        let schedule = config.schedule()?;
        let attack = LinfPgdAttack::new(config.attack_config())?;

        let (train_data, eval_data) = load_datasets(&config.dataset, config.value_range, seed)?;
        if config.training_batch_size > train_data.len() {
            return Err(AegisError::InvalidConfig(format!(
                "training_batch_size {} exceeds the {} training samples",
                config.training_batch_size,
                train_data.len()
            )));
        }
        if config.num_eval_examples > eval_data.len() {
            return Err(AegisError::InvalidConfig(format!(
                "num_eval_examples {} exceeds the {} eval samples",
                config.num_eval_examples,
                eval_data.len()
            )));
        }
        let sample_shape = train_data.sample_shape().to_vec();
        let num_classes = train_data.num_classes();

        let store =
            CheckpointStore::create(&config.model_dir, CheckpointStore::DEFAULT_MAX_TO_KEEP)?;
        config.save(config.model_dir.join("config.json"))?;

        let model = match &config.pretrained_model_dir {
            Some(dir) => {
                let checkpoint = load_latest(dir)?;
                checkpoint.validate(&sample_shape, num_classes)?;
                info!(
                    "Warm-starting from {} (step {})",
                    dir.display(),
                    checkpoint.global_step
                );
                checkpoint.model
            }
            None => {
                let mut init_rng = StdRng::seed_from_u64(seed);
                LinearClassifier::random(&sample_shape, num_classes, &mut init_rng)?
            }
        };
        let optimizer = OptimizerState::new(config.optimizer, config.momentum, &model)?;

        Ok(Self {
            train: DataSubset::new(train_data, seed.wrapping_add(1)),
            attack_rng: StdRng::seed_from_u64(seed.wrapping_add(2)),
            config,
            model,
            optimizer,
            schedule,
            attack,
            eval_data,
            store,
            global_step: 0,
        })
    }

    /// Restore the newest checkpoint in `model_dir`, if any.
    ///
    /// Returns the restored global step.
    pub fn resume(&mut self) -> Result<Option<usize>> {
        let Some(checkpoint) = self.store.latest()? else {
            return Ok(None);
        };
        checkpoint.validate(self.model.sample_shape(), self.model.num_classes())?;

        self.optimizer = match checkpoint.optimizer {
            Some(state) if state.kind() == self.config.optimizer => state,
            _ => OptimizerState::new(
                self.config.optimizer,
                self.config.momentum,
                &checkpoint.model,
            )?,
        };
        self.model = checkpoint.model;
        self.global_step = checkpoint.global_step;
        // Keep the attack stream distinct from the one the first leg used.
        self.attack_rng = StdRng::seed_from_u64(
            self.config
                .random_seed
                .wrapping_add(2)
                .wrapping_add(self.global_step as u64),
        );
        info!("Resumed from step {}", self.global_step);
        Ok(Some(self.global_step))
    }

    pub fn model(&self) -> &LinearClassifier {
        &self.model
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Train until `max_num_training_steps`.
    ///
    /// Per step: draw a batch, attack it when `adversarial_training` is set,
    /// log every `num_output_steps`, take one optimizer step, then
    /// checkpoint (and optionally evaluate) every `num_checkpoint_steps`.
    /// A final checkpoint is written if the last step was not one.
    pub fn run(&mut self) -> Result<TrainReport> {
        let cfg = self.config.clone();
        let mut report = TrainReport {
            start_step: self.global_step,
            final_step: self.global_step,
            last_nat_accuracy: None,
            last_adv_accuracy: None,
            last_eval: None,
            last_checkpoint: None,
        };
        info!(
            "Training steps {}..={} (batch {}, adversarial: {})",
            self.global_step + 1,
            cfg.max_num_training_steps,
            cfg.training_batch_size,
            cfg.adversarial_training
        );

        let mut training_time = 0.0_f64;
        for ii in self.global_step + 1..=cfg.max_num_training_steps {
            let nat_batch = self.train.next_batch(cfg.training_batch_size, true)?;

            let start = Instant::now();
            let adv_batch = if cfg.adversarial_training {
                self.attack
                    .perturb_batch(&self.model, &nat_batch, &mut self.attack_rng)?
            } else {
                nat_batch.clone()
            };
            training_time += start.elapsed().as_secs_f64();

            if ii % cfg.num_output_steps == 0 {
                let nat_acc = self.model.accuracy(&nat_batch.inputs, &nat_batch.labels)?;
                let adv_acc = self.model.accuracy(&adv_batch.inputs, &adv_batch.labels)?;
                info!("Step {}:    ({})", ii, chrono::Local::now());
                info!("    training nat accuracy {:.4}%", nat_acc * 100.0);
                info!("    training adv accuracy {:.4}%", adv_acc * 100.0);
                if training_time > 0.0 {
                    info!(
                        "    {:.1} examples per second",
                        (cfg.num_output_steps * cfg.training_batch_size) as f64 / training_time
                    );
                }
                training_time = 0.0;
                report.last_nat_accuracy = Some(nat_acc);
                report.last_adv_accuracy = Some(adv_acc);
            }

            let start = Instant::now();
            self.train_step(&adv_batch)?;
            training_time += start.elapsed().as_secs_f64();

            if ii % cfg.num_checkpoint_steps == 0 {
                report.last_checkpoint = Some(self.save_checkpoint()?);
                if cfg.eval_on_checkpoint {
                    let eval = self.evaluate()?;
                    info!("Eval at step {}: {}", ii, eval);
                    report.last_eval = Some(eval);
                }
            }
        }

        let off_boundary = self.global_step % cfg.num_checkpoint_steps != 0;
        if self.global_step > report.start_step && off_boundary {
            report.last_checkpoint = Some(self.save_checkpoint()?);
        }
        report.final_step = self.global_step;
        Ok(report)
    }

    /// One optimizer step on `batch`, at the learning rate for the
    /// current global step.
    fn train_step(&mut self, batch: &Batch) -> Result<()> {
        let lr = self.schedule.learning_rate(self.global_step);
        let grads = self
            .model
            .parameter_gradients(&batch.inputs, &batch.labels, self.config.weight_decay)?;
        if !grads.loss.is_finite() {
            return Err(AegisError::OracleFailure(format!(
                "training loss became non-finite at step {}",
                self.global_step + 1
            )));
        }
        self.optimizer.step(&mut self.model, &grads, lr)?;
        self.global_step += 1;
        debug!("step {}: lr {} loss {:.6}", self.global_step, lr, grads.loss);
        Ok(())
    }

    fn save_checkpoint(&self) -> Result<PathBuf> {
        let checkpoint = Checkpoint::new(
            self.global_step,
            self.model.clone(),
            Some(self.optimizer.clone()),
        );
        self.store.save(&checkpoint)
    }

    /// Natural and adversarial accuracy on the eval split.
    pub fn evaluate(&self) -> Result<EvalReport> {
        evaluate(
            &self.model,
            &self.attack,
            &self.eval_data,
            self.config.num_eval_examples,
            self.config.eval_batch_size,
            self.config.random_seed,
        )
    }
}

/// Evaluate a stored classifier on the eval split `config` describes.
///
/// Uses `checkpoint` when given, otherwise the newest checkpoint in
/// `model_dir`. Returns the checkpoint's global step with the report.
pub fn evaluate_checkpoint(
    config: &TrainConfig,
    checkpoint: Option<&Path>,
) -> Result<(usize, EvalReport)> {
    config.validate()?;
    let checkpoint = match checkpoint {
        Some(path) => Checkpoint::load(path)?,
        None => load_latest(&config.model_dir)?,
    };
    let (_, eval_data) = load_datasets(&config.dataset, config.value_range, config.random_seed)?;
    checkpoint.validate(eval_data.sample_shape(), eval_data.num_classes())?;

    let attack = LinfPgdAttack::new(config.attack_config())?;
    let report = evaluate(
        &checkpoint.model,
        &attack,
        &eval_data,
        config.num_eval_examples,
        config.eval_batch_size,
        config.random_seed,
    )?;
    Ok((checkpoint.global_step, report))
}

fn load_latest(dir: &Path) -> Result<Checkpoint> {
    CheckpointStore::open(dir, CheckpointStore::DEFAULT_MAX_TO_KEEP)?
        .latest()?
        .ok_or_else(|| AegisError::Checkpoint(format!("no checkpoint found in {}", dir.display())))
}
