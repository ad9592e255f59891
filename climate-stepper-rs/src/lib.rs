//! Autoregressive climate emulation with physical corrections.
//!
//! This crate rolls a learned single-step network forward in time and keeps
//! its output physically consistent:
//! - Packing of named fields into network channels and back
//! - Semantic access to physical quantities through field aliases
//! - Dry air conservation, zero global-mean moisture advection and moisture
//!   budget closure after every step
//! - Prescribed sea-surface temperature over ocean
//! - Ensemble rollouts, step losses and checkpointing
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use climate_stepper_rs::prelude::*;
//!
//! let config = StepperConfig::test();
//! let area = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();
//! let sigma = SigmaCoordinates::new(vec![0.0, 500.0, 1000.0], vec![1.0, 0.5, 0.0]).unwrap();
//! let stepper =
//!     SingleModuleStepper::new(config, (4, 8), area, sigma, RunContext::cpu()).unwrap();
//! # let batch = TensorMap::new();
//! let stepped = stepper
//!     .run_on_batch(&batch, &mut NullOptimization, 4, None)
//!     .unwrap();
//! println!("loss: {}", stepped.metrics["loss"]);
//! ```

pub mod aggregator;
pub mod checkpoint;
pub mod climate_data;
pub mod config;
pub mod constants;
pub mod corrector;
pub mod distributed;
pub mod error;
pub mod fields;
pub mod inference;
pub mod loss;
pub mod metrics;
pub mod module;
pub mod normalizer;
pub mod ocean;
pub mod optimization;
pub mod packer;
pub mod sigma;
pub mod stepper;

pub use aggregator::{Aggregator, MeanLossAggregator, NullAggregator};
pub use checkpoint::StepperState;
pub use climate_data::{natural_sort, ClimateData, ClimateField, FieldAliases};
pub use config::{DataRequirements, InferenceConfig, StepperConfig, StepperSource};
pub use corrector::{Corrector, CorrectorConfig, MoistureBudgetCorrection};
pub use distributed::RunContext;
pub use error::{StepperError, StepperResult};
pub use fields::TensorMap;
pub use inference::{run_inference, InferenceSummary};
pub use loss::{ConservationLossConfig, LossConfig, LossKind};
pub use module::{ModuleSelector, StepModule};
pub use normalizer::{NormalizationConfig, Normalize, StandardNormalizer};
pub use ocean::{BoundaryCondition, Ocean, OceanConfig};
pub use optimization::{AdamWOptimization, NullOptimization, Optimization, OptimizationConfig};
pub use packer::Packer;
pub use sigma::SigmaCoordinates;
pub use stepper::{SingleModuleStepper, SteppedData};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::aggregator::{Aggregator, MeanLossAggregator, NullAggregator};
    pub use crate::config::StepperConfig;
    pub use crate::corrector::{CorrectorConfig, MoistureBudgetCorrection};
    pub use crate::distributed::RunContext;
    pub use crate::error::{StepperError, StepperResult};
    pub use crate::fields::TensorMap;
    pub use crate::normalizer::Normalize;
    pub use crate::optimization::{NullOptimization, Optimization};
    pub use crate::sigma::SigmaCoordinates;
    pub use crate::stepper::{SingleModuleStepper, SteppedData};
}
