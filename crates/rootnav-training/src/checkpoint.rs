//! Checkpointing of the full training state.
//!
//! This module provides:
//! - A single-file checkpoint holding model, optimizer and scheduler state
//! - Atomic writes (temporary file, fsync, rename)
//! - Best-model tracking on validation mean IoU
//! - Byte encoding of Burn records

use crate::lr_schedule::SchedulerState;
use crate::trainer::TrainingState;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder};
use burn::tensor::backend::Backend;
use rootnav_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Version written into every checkpoint
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Best metric before any validation has run. Any real mean IoU beats it.
pub const INITIAL_BEST_METRIC: f64 = -100.0;

/// Default file name of the best checkpoint
pub const BEST_CHECKPOINT_NAME: &str = "best_model.ckpt";

type BytesRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Checkpoint containing model and training state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    /// Completed optimizer steps
    pub iteration: usize,
    /// Validation mean IoU of this checkpoint
    pub best_metric: f64,
    /// Burn model record
    pub model_state: Vec<u8>,
    /// Burn optimizer record
    pub optimizer_state: Vec<u8>,
    pub scheduler_state: SchedulerState,
    pub timestamp: String,
}

impl Checkpoint {
    /// Create a new checkpoint
    pub fn new(
        state: &TrainingState,
        model_state: Vec<u8>,
        optimizer_state: Vec<u8>,
        scheduler_state: SchedulerState,
    ) -> Self {
        use chrono::Utc;

        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            iteration: state.iteration,
            best_metric: state.best_metric,
            model_state,
            optimizer_state,
            scheduler_state,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Writes the checkpoint next to `path` and renames it into place, so a
    /// crash never leaves a truncated file at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = bincode::serialize(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {e}")))?;

        let tmp_path = temporary_path(path);
        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp_path, path)) {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                warn!("Failed to remove {}: {cleanup}", tmp_path.display());
            }
            return Err(e.into());
        }

        info!("Checkpoint saved to {:?}", path);
        Ok(())
    }

    /// Reads and validates a checkpoint.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            Error::Checkpoint(format!("Failed to read {}: {e}", path.display()))
        })?;

        let checkpoint: Checkpoint = bincode::deserialize(&bytes).map_err(|e| {
            Error::Checkpoint(format!("Failed to decode {}: {e}", path.display()))
        })?;

        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(Error::Checkpoint(format!(
                "{} has format version {}, expected {CHECKPOINT_FORMAT_VERSION}",
                path.display(),
                checkpoint.format_version
            )));
        }
        if checkpoint.model_state.is_empty() {
            return Err(Error::Checkpoint(format!("{} has no model state", path.display())));
        }
        if checkpoint.optimizer_state.is_empty() {
            return Err(Error::Checkpoint(format!("{} has no optimizer state", path.display())));
        }

        info!("Checkpoint loaded from {:?}", path);
        Ok(checkpoint)
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Encodes a Burn record (model or optimizer) to bytes.
pub fn encode_record<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    <BytesRecorder as Recorder<B>>::record(&BytesRecorder::new(), record, ())
        .map_err(|e| Error::Serialization(format!("Failed to encode record: {e:?}")))
}

/// Decodes a Burn record produced by [`encode_record`].
pub fn decode_record<B: Backend, R: Record<B>>(bytes: Vec<u8>, device: &B::Device) -> Result<R> {
    <BytesRecorder as Recorder<B>>::load(&BytesRecorder::new(), bytes, device)
        .map_err(|e| Error::Checkpoint(format!("Failed to decode record: {e:?}")))
}

/// Keeps the best checkpoint of a run
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    file_name: String,
    best_metric: f64,
}

impl CheckpointManager {
    /// Create a new checkpoint manager
    pub fn new(checkpoint_dir: PathBuf) -> Self {
        Self {
            checkpoint_dir,
            file_name: BEST_CHECKPOINT_NAME.to_string(),
            best_metric: INITIAL_BEST_METRIC,
        }
    }

    /// Configure the file name of the best checkpoint
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Path the best checkpoint is written to
    pub fn best_path(&self) -> PathBuf {
        self.checkpoint_dir.join(&self.file_name)
    }

    pub fn best_metric(&self) -> f64 {
        self.best_metric
    }

    /// Restores the best metric of a resumed run.
    pub fn set_best_metric(&mut self, best_metric: f64) {
        self.best_metric = best_metric;
    }

    /// Whether a validation score should replace the best checkpoint.
    /// Ties count as improvements.
    pub fn is_improvement(&self, score: f64) -> bool {
        score >= self.best_metric
    }

    /// Writes `checkpoint` as the new best. The recorded best metric only
    /// changes once the write has succeeded.
    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.best_path();
        checkpoint.save(&path)?;
        self.best_metric = checkpoint.best_metric;

        info!(
            "Best model checkpoint saved (iteration {}, mean IoU {:.4})",
            checkpoint.iteration, checkpoint.best_metric
        );
        Ok(path)
    }

    /// Loads a resume checkpoint. A missing file is not an error and yields
    /// `None`; a file that exists but cannot be used is.
    pub fn load(path: &Path) -> Result<Option<Checkpoint>> {
        if !path.exists() {
            info!("No checkpoint found at {:?}", path);
            return Ok(None);
        }

        Checkpoint::load(path).map(Some)
    }

    /// Load the best checkpoint written by this manager
    pub fn load_best(&self) -> Result<Checkpoint> {
        Checkpoint::load(&self.best_path())
    }

    /// Get checkpoint directory path
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}
