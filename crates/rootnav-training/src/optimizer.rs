//! Optimizer construction from configuration.
//!
//! Each optimizer has its own concrete type, so callers hand a
//! [`WithOptimizer`] visitor to [`OptimizerChoice::dispatch`] and receive
//! the optimizer as a generic parameter.

use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, AdamWConfig, Optimizer, SgdConfig};
use burn::tensor::backend::AutodiffBackend;
use rootnav_core::{OptimizerConfig, OptimizerType};

/// Optimizer selected by a configuration
#[derive(Clone)]
pub enum OptimizerChoice {
    Sgd(SgdConfig),
    Adam(AdamConfig),
    AdamW(AdamWConfig),
}

/// Code that runs with whichever optimizer the configuration selected.
pub trait WithOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    type Output;

    fn run<O: Optimizer<M, B>>(self, optimizer: O) -> Self::Output;
}

impl OptimizerChoice {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        let weight_decay = config.weight_decay.filter(|&decay| decay > 0.0);

        match config.name {
            OptimizerType::Sgd => {
                let momentum = config.momentum.filter(|&m| m > 0.0).map(|m| {
                    MomentumConfig::new().with_momentum(m).with_dampening(0.0)
                });
                OptimizerChoice::Sgd(
                    SgdConfig::new()
                        .with_momentum(momentum)
                        .with_weight_decay(weight_decay.map(|d| WeightDecayConfig::new(d as f32))),
                )
            }
            OptimizerType::Adam => {
                let mut adam = AdamConfig::new()
                    .with_weight_decay(weight_decay.map(|d| WeightDecayConfig::new(d as f32)));
                if let Some(beta1) = config.beta1 {
                    adam = adam.with_beta_1(beta1 as f32);
                }
                if let Some(beta2) = config.beta2 {
                    adam = adam.with_beta_2(beta2 as f32);
                }
                OptimizerChoice::Adam(adam)
            }
            OptimizerType::AdamW => {
                let mut adamw = AdamWConfig::new();
                if let Some(decay) = weight_decay {
                    adamw = adamw.with_weight_decay(decay as f32);
                }
                if let Some(beta1) = config.beta1 {
                    adamw = adamw.with_beta_1(beta1 as f32);
                }
                if let Some(beta2) = config.beta2 {
                    adamw = adamw.with_beta_2(beta2 as f32);
                }
                OptimizerChoice::AdamW(adamw)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerChoice::Sgd(_) => "sgd",
            OptimizerChoice::Adam(_) => "adam",
            OptimizerChoice::AdamW(_) => "adamw",
        }
    }

    /// Initialises the optimizer for model type `M` and passes it to `visitor`.
    pub fn dispatch<B, M, V>(&self, visitor: V) -> V::Output
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        V: WithOptimizer<B, M>,
    {
        match self {
            OptimizerChoice::Sgd(config) => visitor.run(config.init::<B, M>()),
            OptimizerChoice::Adam(config) => visitor.run(config.init::<B, M>()),
            OptimizerChoice::AdamW(config) => visitor.run(config.init::<B, M>()),
        }
    }
}
