//! Weight updates driven by the rollout loss.

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::{StepperError, StepperResult};

/// Updates network weights from a rollout loss.
pub trait Optimization {
    /// True if the rollout should keep the autograd graph.
    fn is_training(&self) -> bool;

    /// Backpropagate `loss` and update weights.
    fn step_weights(&mut self, loss: &Tensor) -> StepperResult<()>;
}

/// No-op optimization used for validation and inference.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOptimization;

impl Optimization for NullOptimization {
    fn is_training(&self) -> bool {
        false
    }

    fn step_weights(&mut self, _loss: &Tensor) -> StepperResult<()> {
        Ok(())
    }
}

/// AdamW hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Learning rate
    pub lr: f64,
    /// Decoupled weight decay
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

fn default_weight_decay() -> f64 {
    0.01
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            weight_decay: default_weight_decay(),
        }
    }
}

/// AdamW over every variable of a [`VarMap`].
pub struct AdamWOptimization {
    optimizer: AdamW,
    steps: usize,
}

impl AdamWOptimization {
    /// Create an optimizer over the variables in `var_map`.
    pub fn new(var_map: &VarMap, config: &OptimizationConfig) -> StepperResult<Self> {
        if !(config.lr.is_finite() && config.lr > 0.0) {
            return Err(StepperError::invalid_config(format!(
                "learning rate must be positive, got {}",
                config.lr
            )));
        }
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(var_map.all_vars(), params)?;
        Ok(Self {
            optimizer,
            steps: 0,
        })
    }

    /// Number of updates applied.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}

impl Optimization for AdamWOptimization {
    fn is_training(&self) -> bool {
        true
    }

    fn step_weights(&mut self, loss: &Tensor) -> StepperResult<()> {
        self.optimizer.backward_step(loss)?;
        self.steps += 1;
        Ok(())
    }
}
