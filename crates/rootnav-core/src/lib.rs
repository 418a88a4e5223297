//! Core types and utilities for RootNav model training.
//!
//! This crate provides the error type, configuration, class definitions,
//! segmentation metrics and CLI helpers shared across the workspace.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use backend::*;
pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{AverageMeter, RunningScore, Scores};
    pub use crate::types::*;
    pub use burn::prelude::*;
}
