//! Configuration structures for RootNav training runs.
//!
//! Configurations are written in TOML. Required keys that are missing make
//! parsing fail; [`RootNavConfig::validate`] rejects values that parse but
//! cannot drive a run.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Seed used when the configuration does not specify one.
pub const DEFAULT_SEED: u64 = 1337;

/// Datasets the loader knows how to read.
pub const SUPPORTED_DATASETS: &[&str] = &["rootnav"];

fn default_seed() -> u64 {
    DEFAULT_SEED
}

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootNavConfig {
    /// Random seed for shuffling, augmentation and parameter init
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Training hyperparameters
    pub training: TrainingParams,
    /// Data configuration
    pub data: DataConfig,
    /// Reference model shape
    #[serde(default)]
    pub model: ModelParams,
}

impl RootNavConfig {
    /// Checks values that parse correctly but cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        let training = &self.training;

        if training.batch_size == 0 {
            return Err(Error::Config("training.batch_size must be greater than 0".into()));
        }
        if training.train_iters == 0 {
            return Err(Error::Config("training.train_iters must be greater than 0".into()));
        }
        if training.print_interval == 0 {
            return Err(Error::Config("training.print_interval must be greater than 0".into()));
        }
        if training.val_interval == 0 {
            return Err(Error::Config("training.val_interval must be greater than 0".into()));
        }
        if training.optimizer.lr <= 0.0 || !training.optimizer.lr.is_finite() {
            return Err(Error::Config(format!(
                "training.optimizer.lr must be positive, got {}",
                training.optimizer.lr
            )));
        }

        let hflip = training.hflip();
        if !(0.0..=1.0).contains(&hflip) {
            return Err(Error::Config(format!(
                "training.augmentations.hflip must be within [0, 1], got {hflip}"
            )));
        }

        if !SUPPORTED_DATASETS.contains(&self.data.dataset.as_str()) {
            return Err(Error::Config(format!(
                "Unknown dataset '{}' (supported: {})",
                self.data.dataset,
                SUPPORTED_DATASETS.join(", ")
            )));
        }

        if self.model.stacks == 0 || self.model.features == 0 {
            return Err(Error::Config("model.stacks and model.features must be greater than 0".into()));
        }

        Ok(())
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Batch size for both training and validation streams
    pub batch_size: usize,
    /// Number of threads decoding samples
    pub n_workers: usize,
    /// Total number of optimizer steps
    pub train_iters: usize,
    /// Iterations between progress lines
    pub print_interval: usize,
    /// Iterations between validation passes
    pub val_interval: usize,
    /// Checkpoint to resume from
    #[serde(default)]
    pub resume: Option<PathBuf>,
    /// Optimizer selection and parameters
    pub optimizer: OptimizerConfig,
    /// Learning rate schedule, constant when absent
    #[serde(default)]
    pub lr_schedule: Option<LrScheduleConfig>,
    /// Training-time augmentation
    #[serde(default)]
    pub augmentations: Option<AugmentationConfig>,
}

impl TrainingParams {
    /// Horizontal flip probability, zero when augmentation is not configured.
    pub fn hflip(&self) -> f64 {
        self.augmentations.as_ref().map_or(0.0, |aug| aug.hflip)
    }
}

/// Optimizer type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    /// SGD with optional momentum
    Sgd,
    /// Adam optimizer
    Adam,
    /// AdamW optimizer
    AdamW,
}

impl std::fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerType::Sgd => write!(f, "sgd"),
            OptimizerType::Adam => write!(f, "adam"),
            OptimizerType::AdamW => write!(f, "adamw"),
        }
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub name: OptimizerType,
    /// Base learning rate
    pub lr: f64,
    /// Weight decay (L2 penalty)
    #[serde(default)]
    pub weight_decay: Option<f64>,
    /// Momentum, SGD only
    #[serde(default)]
    pub momentum: Option<f64>,
    /// First moment decay, Adam variants only
    #[serde(default)]
    pub beta1: Option<f64>,
    /// Second moment decay, Adam variants only
    #[serde(default)]
    pub beta2: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: OptimizerType::Adam,
            lr: 1e-4,
            weight_decay: None,
            momentum: None,
            beta1: None,
            beta2: None,
        }
    }
}

/// Learning rate schedule type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleType {
    /// Constant learning rate
    Constant,
    /// Multiply by `gamma` every `step_size` iterations
    Step,
    /// Multiply by `gamma` at each milestone
    MultiStep,
    /// Multiply by `gamma` every iteration
    Exponential,
    /// Cosine decay to `eta_min` over `t_max` iterations
    CosineAnnealing,
    /// Polynomial decay to zero over `max_iter` iterations
    Poly,
}

/// Learning rate schedule.
///
/// Parameters not used by the selected schedule are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrScheduleConfig {
    /// Schedule type
    pub name: LrScheduleType,
    #[serde(default)]
    pub step_size: Option<usize>,
    #[serde(default)]
    pub milestones: Option<Vec<usize>>,
    #[serde(default)]
    pub gamma: Option<f64>,
    #[serde(default)]
    pub t_max: Option<usize>,
    #[serde(default)]
    pub eta_min: Option<f64>,
    #[serde(default)]
    pub max_iter: Option<usize>,
    #[serde(default)]
    pub power: Option<f64>,
    /// Iterations of linear warmup before the schedule takes over
    #[serde(default)]
    pub warmup_iters: usize,
    /// Learning rate multiplier at the first warmup iteration
    #[serde(default)]
    pub warmup_factor: Option<f64>,
}

impl Default for LrScheduleConfig {
    fn default() -> Self {
        Self {
            name: LrScheduleType::Constant,
            step_size: None,
            milestones: None,
            gamma: None,
            t_max: None,
            eta_min: None,
            max_iter: None,
            power: None,
            warmup_iters: 0,
            warmup_factor: None,
        }
    }
}

/// Augmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AugmentationConfig {
    /// Probability of flipping a sample horizontally
    #[serde(default)]
    pub hflip: f64,
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset name
    pub dataset: String,
    /// Dataset root containing `train/` and `valid/`
    pub path: PathBuf,
}

/// Shape of the reference hourglass model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Number of stacked hourglass units
    #[serde(default = "default_stacks")]
    pub stacks: usize,
    /// Feature channels inside each unit
    #[serde(default = "default_features")]
    pub features: usize,
}

fn default_stacks() -> usize {
    2
}

fn default_features() -> usize {
    32
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            stacks: default_stacks(),
            features: default_features(),
        }
    }
}
