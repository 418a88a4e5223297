//! Training infrastructure for RootNav segmentation models.
//!
//! This crate provides:
//! - A stacked hourglass reference model
//! - The composite segmentation and heatmap loss
//! - Learning rate scheduling and optimizer construction
//! - Validation, checkpointing and the iteration-driven training loop

pub mod checkpoint;
pub mod loss;
pub mod lr_schedule;
pub mod model;
pub mod optimizer;
pub mod trainer;
pub mod validation;

pub use checkpoint::{
    Checkpoint, CheckpointManager, BEST_CHECKPOINT_NAME, CHECKPOINT_FORMAT_VERSION,
    INITIAL_BEST_METRIC,
};
pub use loss::{LossComposer, LossValue};
pub use lr_schedule::{LearningRateScheduler, SchedulerState, SchedulerType, Warmup};
pub use model::{RootHourglass, RootHourglassConfig, StackedSegmentationModel};
pub use optimizer::{OptimizerChoice, WithOptimizer};
pub use trainer::{
    Phase, TrainerConfig, TrainingLoop, TrainingState, TrainingSummary, ValidationRecord,
};
pub use validation::{ValidationPass, ValidationReport};

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::{Checkpoint, CheckpointManager};
    pub use super::loss::LossComposer;
    pub use super::lr_schedule::LearningRateScheduler;
    pub use super::model::{RootHourglass, RootHourglassConfig, StackedSegmentationModel};
    pub use super::optimizer::{OptimizerChoice, WithOptimizer};
    pub use super::trainer::{TrainerConfig, TrainingLoop, TrainingSummary};
}
