//! Training checkpoints.
//!
//! Each checkpoint is one pretty-printed JSON file, `checkpoint-<step>.json`,
//! written with a temp-file-then-rename so a crash mid-save never leaves a
//! truncated checkpoint behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aegis_attack::GradientOracle;
use aegis_core::{AegisError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::LinearClassifier;
use crate::optimizer::OptimizerState;

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".json";

/// Snapshot of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version for compatibility.
    pub version: u32,
    /// Number of optimizer steps taken when the snapshot was written.
    pub global_step: usize,
    pub saved_at: DateTime<Utc>,
    pub model: LinearClassifier,
    /// Absent for checkpoints exported for evaluation only.
    pub optimizer: Option<OptimizerState>,
}

impl Checkpoint {
    /// Current checkpoint format version.
    pub const VERSION: u32 = 1;

    pub fn new(
        global_step: usize,
        model: LinearClassifier,
        optimizer: Option<OptimizerState>,
    ) -> Self {
        Self {
            version: Self::VERSION,
            global_step,
            saved_at: Utc::now(),
            model,
            optimizer,
        }
    }

    /// Save checkpoint to file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        // Same directory, so the rename stays on one filesystem.
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load checkpoint from file, removing any stale temp file from an
    /// interrupted save.
    pub fn load(path: &Path) -> Result<Self> {
        let temp_path = path.with_extension("json.tmp");
        if temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }

        let json = fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&json).map_err(|e| {
            AegisError::Checkpoint(format!("failed to parse {}: {e}", path.display()))
        })?;

        if checkpoint.version != Self::VERSION {
            return Err(AegisError::Checkpoint(format!(
                "version mismatch in {}: expected {}, found {}",
                path.display(),
                Self::VERSION,
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }

    /// Check that the stored classifier fits the current data.
    pub fn validate(&self, sample_shape: &[usize], num_classes: usize) -> Result<()> {
        if self.model.sample_shape() != sample_shape {
            return Err(AegisError::Checkpoint(format!(
                "sample shape mismatch: checkpoint has {:?}, data has {sample_shape:?}",
                self.model.sample_shape()
            )));
        }
        if self.model.num_classes() != num_classes {
            return Err(AegisError::Checkpoint(format!(
                "class count mismatch: checkpoint has {}, data has {num_classes}",
                self.model.num_classes()
            )));
        }
        if let Some(optimizer) = &self.optimizer {
            if !optimizer.matches(&self.model) {
                return Err(AegisError::Checkpoint(
                    "optimizer state does not fit the stored classifier".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Directory of numbered checkpoints with bounded retention.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointStore {
    /// Default number of checkpoints retained.
    pub const DEFAULT_MAX_TO_KEEP: usize = 2;

    /// Open `dir`, creating it if needed.
    pub fn create(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Self::open(dir, max_to_keep)
    }

    /// Open an existing directory.
    pub fn open(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        if max_to_keep == 0 {
            return Err(AegisError::InvalidConfig(
                "max_to_keep must be at least 1".to_string(),
            ));
        }
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(AegisError::Checkpoint(format!(
                "checkpoint directory {} does not exist",
                dir.display()
            )));
        }
        Ok(Self { dir, max_to_keep })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{step}{SUFFIX}"))
    }

    /// Write `checkpoint` and prune all but the newest `max_to_keep`.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.path_for(checkpoint.global_step);
        checkpoint.save(&path)?;
        info!("Saved checkpoint {}", path.display());

        let existing = self.list()?;
        let excess = existing.len().saturating_sub(self.max_to_keep);
        for (step, old) in existing.into_iter().take(excess) {
            match fs::remove_file(&old) {
                Ok(()) => debug!("Pruned checkpoint at step {}", step),
                Err(e) => warn!("Failed to prune checkpoint at step {}: {}", step, e),
            }
        }
        Ok(path)
    }

    /// `(step, path)` of every checkpoint, oldest first.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let step = name
                .to_str()
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|n| n.strip_suffix(SUFFIX))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(step) = step {
                found.push((step, entry.path()));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    /// Checkpoint with the highest step, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        match self.list()?.pop() {
            Some((_, path)) => Checkpoint::load(&path).map(Some),
            None => Ok(None),
        }
    }
}
