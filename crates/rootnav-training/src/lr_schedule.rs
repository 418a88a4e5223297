//! Learning rate scheduling strategies.
//!
//! Schedulers advance once per training iteration. Their full state is
//! serializable so a resumed run continues on the same curve.
//!
//! This module provides:
//! - Step and multi-step decay
//! - Exponential decay
//! - Cosine annealing
//! - Polynomial decay
//! - Linear warmup on top of any of the above

use rootnav_core::{Error, LrScheduleConfig, LrScheduleType, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Learning rate scheduler type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum SchedulerType {
    /// Constant learning rate (no scheduling)
    #[default]
    Constant,

    /// Multiply LR by gamma every step_size iterations
    StepLR { step_size: usize, gamma: f64 },

    /// Multiply LR by gamma at each milestone iteration
    MultiStepLR { milestones: Vec<usize>, gamma: f64 },

    /// Multiply LR by gamma every iteration
    ExponentialLR { gamma: f64 },

    /// Cosine decay from the base LR to eta_min over t_max iterations
    CosineAnnealingLR { t_max: usize, eta_min: f64 },

    /// `base_lr * (1 - step / max_iter) ^ power`, zero past max_iter
    PolyLR { max_iter: usize, power: f64 },
}

impl SchedulerType {
    /// Builds a schedule from configuration, rejecting missing parameters.
    pub fn from_config(config: &LrScheduleConfig) -> Result<Self> {
        let missing = |param: &str| {
            Error::Config(format!(
                "training.lr_schedule.{param} is required for {:?}",
                config.name
            ))
        };

        let schedule = match config.name {
            LrScheduleType::Constant => SchedulerType::Constant,
            LrScheduleType::Step => SchedulerType::StepLR {
                step_size: config.step_size.ok_or_else(|| missing("step_size"))?,
                gamma: config.gamma.unwrap_or(0.1),
            },
            LrScheduleType::MultiStep => SchedulerType::MultiStepLR {
                milestones: config.milestones.clone().ok_or_else(|| missing("milestones"))?,
                gamma: config.gamma.unwrap_or(0.1),
            },
            LrScheduleType::Exponential => SchedulerType::ExponentialLR {
                gamma: config.gamma.ok_or_else(|| missing("gamma"))?,
            },
            LrScheduleType::CosineAnnealing => SchedulerType::CosineAnnealingLR {
                t_max: config.t_max.ok_or_else(|| missing("t_max"))?,
                eta_min: config.eta_min.unwrap_or(0.0),
            },
            LrScheduleType::Poly => SchedulerType::PolyLR {
                max_iter: config.max_iter.ok_or_else(|| missing("max_iter"))?,
                power: config.power.unwrap_or(0.9),
            },
        };

        match &schedule {
            SchedulerType::StepLR { step_size: 0, .. }
            | SchedulerType::CosineAnnealingLR { t_max: 0, .. }
            | SchedulerType::PolyLR { max_iter: 0, .. } => Err(Error::Config(format!(
                "training.lr_schedule has a zero period: {schedule:?}"
            ))),
            _ => Ok(schedule),
        }
    }
}

/// Linear warmup applied before the schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Warmup {
    /// Number of warmup iterations
    pub iters: usize,
    /// LR multiplier at iteration zero
    pub factor: f64,
}

impl Warmup {
    fn multiplier(&self, step: usize) -> f64 {
        if step >= self.iters {
            return 1.0;
        }
        let alpha = step as f64 / self.iters as f64;
        self.factor * (1.0 - alpha) + alpha
    }
}

/// Serializable progress of a [`LearningRateScheduler`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub scheduler_type: SchedulerType,
    pub warmup: Option<Warmup>,
    pub base_lr: f64,
    pub current_lr: f64,
    pub current_step: usize,
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    scheduler_type: SchedulerType,
    warmup: Option<Warmup>,
    base_lr: f64,
    current_lr: f64,
    current_step: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            warmup: None,
            base_lr,
            current_lr: base_lr,
            current_step: 0,
        }
    }

    /// Builds the scheduler for a run; no schedule means a constant rate.
    pub fn from_config(config: Option<&LrScheduleConfig>, base_lr: f64) -> Result<Self> {
        let Some(config) = config else {
            return Ok(Self::new(SchedulerType::Constant, base_lr));
        };

        let scheduler = Self::new(SchedulerType::from_config(config)?, base_lr);
        if config.warmup_iters == 0 {
            return Ok(scheduler);
        }

        Ok(scheduler.with_warmup(Warmup {
            iters: config.warmup_iters,
            factor: config.warmup_factor.unwrap_or(0.2),
        }))
    }

    pub fn with_warmup(mut self, warmup: Warmup) -> Self {
        self.warmup = Some(warmup);
        self.current_lr = self.compute_lr(self.current_step);
        self
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Number of times the scheduler has been stepped
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Advances one iteration and returns the learning rate to use for it
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.current_lr = self.compute_lr(self.current_step);
        self.current_lr
    }

    fn compute_lr(&self, step: usize) -> f64 {
        let lr = match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,

            SchedulerType::StepLR { step_size, gamma } => {
                self.base_lr * gamma.powi((step / step_size) as i32)
            }

            SchedulerType::MultiStepLR { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| m <= step).count();
                self.base_lr * gamma.powi(passed as i32)
            }

            SchedulerType::ExponentialLR { gamma } => self.base_lr * gamma.powi(step as i32),

            SchedulerType::CosineAnnealingLR { t_max, eta_min } => {
                let progress = (step as f64 / *t_max as f64).min(1.0);
                eta_min + (self.base_lr - eta_min) * (1.0 + (progress * PI).cos()) / 2.0
            }

            SchedulerType::PolyLR { max_iter, power } => {
                let remaining = 1.0 - (step as f64 / *max_iter as f64).min(1.0);
                self.base_lr * remaining.powf(*power)
            }
        };

        match &self.warmup {
            Some(warmup) => lr * warmup.multiplier(step),
            None => lr,
        }
    }

    /// Snapshot of the scheduler for checkpointing
    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            scheduler_type: self.scheduler_type.clone(),
            warmup: self.warmup,
            base_lr: self.base_lr,
            current_lr: self.current_lr,
            current_step: self.current_step,
        }
    }

    /// Restores a snapshot taken with [`state`](Self::state)
    pub fn load_state(&mut self, state: SchedulerState) {
        self.scheduler_type = state.scheduler_type;
        self.warmup = state.warmup;
        self.base_lr = state.base_lr;
        self.current_lr = state.current_lr;
        self.current_step = state.current_step;
    }

    /// Reset the scheduler
    pub fn reset(&mut self) {
        self.current_step = 0;
        self.current_lr = self.compute_lr(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = LearningRateScheduler::new(SchedulerType::Constant, 0.001);
        assert_eq!(scheduler.get_lr(), 0.001);
        assert_eq!(scheduler.step(), 0.001);
        assert_eq!(scheduler.step(), 0.001);
        assert_eq!(scheduler.current_step(), 2);
    }

    #[test]
    fn test_step_lr() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::StepLR {
                step_size: 2,
                gamma: 0.5,
            },
            0.001,
        );

        assert!((scheduler.step() - 0.001).abs() < 1e-12); // step 1
        assert!((scheduler.step() - 0.0005).abs() < 1e-12); // step 2
        assert!((scheduler.step() - 0.0005).abs() < 1e-12); // step 3
        assert!((scheduler.step() - 0.00025).abs() < 1e-12); // step 4
    }

    #[test]
    fn test_multi_step_lr() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::MultiStepLR {
                milestones: vec![2, 4],
                gamma: 0.1,
            },
            1.0,
        );

        let lrs: Vec<f64> = (0..5).map(|_| scheduler.step()).collect();
        let expected = [1.0, 0.1, 0.1, 0.01, 0.01];
        for (lr, want) in lrs.iter().zip(expected) {
            assert!((lr - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_exponential_lr() {
        let mut scheduler =
            LearningRateScheduler::new(SchedulerType::ExponentialLR { gamma: 0.9 }, 0.001);

        assert!((scheduler.step() - 0.0009).abs() < 1e-12);
        assert!((scheduler.step() - 0.00081).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_annealing() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::CosineAnnealingLR {
                t_max: 10,
                eta_min: 0.0001,
            },
            0.001,
        );

        for _ in 0..5 {
            scheduler.step();
        }
        let lr_at_5 = scheduler.get_lr();
        assert!((lr_at_5 - 0.00055).abs() < 1e-9);

        for _ in 0..10 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_poly_lr() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::PolyLR {
                max_iter: 4,
                power: 1.0,
            },
            1.0,
        );

        let lrs: Vec<f64> = (0..5).map(|_| scheduler.step()).collect();
        assert_eq!(lrs, vec![0.75, 0.5, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_warmup() {
        let mut scheduler = LearningRateScheduler::new(SchedulerType::Constant, 1.0).with_warmup(Warmup {
            iters: 4,
            factor: 0.2,
        });

        assert!((scheduler.get_lr() - 0.2).abs() < 1e-12);
        assert!((scheduler.step() - 0.4).abs() < 1e-12);
        assert!((scheduler.step() - 0.6).abs() < 1e-12);
        assert!((scheduler.step() - 0.8).abs() < 1e-12);
        assert!((scheduler.step() - 1.0).abs() < 1e-12);
        assert!((scheduler.step() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_state_round_trip_continues_curve() {
        let schedule = SchedulerType::CosineAnnealingLR {
            t_max: 20,
            eta_min: 0.0,
        };
        let mut original = LearningRateScheduler::new(schedule.clone(), 0.01);
        for _ in 0..7 {
            original.step();
        }

        let json = serde_json::to_string(&original.state()).unwrap();
        let state: SchedulerState = serde_json::from_str(&json).unwrap();

        let mut restored = LearningRateScheduler::new(SchedulerType::Constant, 1.0);
        restored.load_state(state);
        assert_eq!(restored.current_step(), 7);
        assert_eq!(restored.get_lr(), original.get_lr());

        for _ in 0..5 {
            assert_eq!(restored.step(), original.step());
        }
    }

    #[test]
    fn test_reset() {
        let mut scheduler =
            LearningRateScheduler::new(SchedulerType::ExponentialLR { gamma: 0.9 }, 0.001);

        scheduler.step();
        scheduler.step();
        assert_ne!(scheduler.get_lr(), 0.001);
        assert_eq!(scheduler.current_step(), 2);

        scheduler.reset();
        assert_eq!(scheduler.get_lr(), 0.001);
        assert_eq!(scheduler.current_step(), 0);
    }

    #[test]
    fn test_from_config() -> Result<()> {
        let config = LrScheduleConfig {
            name: LrScheduleType::Poly,
            max_iter: Some(100),
            warmup_iters: 10,
            ..Default::default()
        };
        let scheduler = LearningRateScheduler::from_config(Some(&config), 0.1)?;
        assert_eq!(
            scheduler.state().scheduler_type,
            SchedulerType::PolyLR {
                max_iter: 100,
                power: 0.9
            }
        );
        assert!(scheduler.get_lr() < 0.1);

        let constant = LearningRateScheduler::from_config(None, 0.1)?;
        assert_eq!(constant.get_lr(), 0.1);

        let missing = LrScheduleConfig {
            name: LrScheduleType::Step,
            ..Default::default()
        };
        assert!(matches!(
            SchedulerType::from_config(&missing),
            Err(Error::Config(_))
        ));
        Ok(())
    }
}
