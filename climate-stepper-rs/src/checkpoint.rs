//! Saving and restoring steppers.
//!
//! A checkpoint is a directory holding two files:
//!
//! - `stepper.json`: configuration, normalization statistics, grid shape,
//!   area weights and sigma coordinates
//! - `weights.safetensors`: the network variables

use std::path::Path;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StepperConfig;
use crate::distributed::RunContext;
use crate::error::{StepperError, StepperResult};
use crate::normalizer::StandardNormalizer;
use crate::sigma::SigmaCoordinates;
use crate::stepper::SingleModuleStepper;

/// File name of the serialized state.
pub const STATE_FILE: &str = "stepper.json";

/// File name of the network weights.
pub const WEIGHTS_FILE: &str = "weights.safetensors";

/// Everything except weights needed to rebuild a stepper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepperState {
    /// Stepper configuration
    pub config: StepperConfig,
    /// Normalization statistics used in training
    pub normalizer: StandardNormalizer,
    /// Grid shape `(lat, lon)`
    pub img_shape: (usize, usize),
    /// Row-major area weights of shape `img_shape`
    pub area: Vec<f32>,
    /// Vertical coordinates
    pub sigma_coordinates: SigmaCoordinates,
}

impl StepperState {
    /// Area weights as a `(lat, lon)` tensor on the CPU.
    pub fn area_tensor(&self) -> StepperResult<Tensor> {
        let (n_lat, n_lon) = self.img_shape;
        if self.area.len() != n_lat * n_lon {
            return Err(StepperError::checkpoint(format!(
                "area has {} values, expected {} for grid {:?}",
                self.area.len(),
                n_lat * n_lon,
                self.img_shape
            )));
        }
        Ok(Tensor::from_vec(
            self.area.clone(),
            self.img_shape,
            &candle_core::Device::Cpu,
        )?)
    }
}

impl SingleModuleStepper {
    /// Snapshot of the non-weight state.
    pub fn get_state(&self) -> StepperResult<StepperState> {
        let area = self
            .area()
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(StepperState {
            config: self.config().clone(),
            normalizer: self.normalizer().clone(),
            img_shape: self.img_shape(),
            area,
            sigma_coordinates: self.sigma_coordinates().clone(),
        })
    }

    /// Write the stepper to `dir`, creating it if needed.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> StepperResult<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let state = self.get_state()?;
        std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(&state)?)?;
        self.var_map().save(dir.join(WEIGHTS_FILE))?;
        info!(path = %dir.display(), "saved stepper checkpoint");
        Ok(())
    }

    /// Restore a stepper written by [`SingleModuleStepper::save`].
    ///
    /// Normalization statistics come from the checkpoint, not from the
    /// stored normalization config.
    pub fn load<P: AsRef<Path>>(dir: P, context: RunContext) -> StepperResult<Self> {
        let dir = dir.as_ref();
        let state_path = dir.join(STATE_FILE);
        if !state_path.exists() {
            return Err(StepperError::checkpoint(format!(
                "no {STATE_FILE} in {}",
                dir.display()
            )));
        }
        let state: StepperState = serde_json::from_str(&std::fs::read_to_string(&state_path)?)?;
        let area = state.area_tensor()?;
        let mut stepper = Self::with_normalizer(
            state.config,
            state.normalizer,
            state.img_shape,
            area,
            state.sigma_coordinates,
            context,
        )?;
        let weights_path = dir.join(WEIGHTS_FILE);
        if weights_path.exists() {
            stepper.var_map_mut().load(&weights_path)?;
        }
        info!(path = %dir.display(), "loaded stepper checkpoint");
        Ok(stepper)
    }

    /// Read only the stored state, e.g. to query data requirements.
    pub fn load_state<P: AsRef<Path>>(dir: P) -> StepperResult<StepperState> {
        let content = std::fs::read_to_string(dir.as_ref().join(STATE_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }
}
