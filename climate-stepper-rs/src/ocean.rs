//! Prescribed boundary conditions applied after correction.

use serde::{Deserialize, Serialize};

use crate::error::{StepperError, StepperResult};
use crate::fields::TensorMap;

/// Overwrites generated fields with prescribed values.
///
/// Called once per step after the corrector, on denormalized fields.
/// `target` holds the reference values for the step being generated.
pub trait BoundaryCondition {
    /// Names that must be present in `target`.
    fn target_names(&self) -> Vec<String>;

    /// Return `gen` with prescribed fields replaced.
    fn prescribe(
        &self,
        target: &TensorMap,
        input: &TensorMap,
        gen: TensorMap,
    ) -> StepperResult<TensorMap>;
}

/// Configuration for a prescribed sea-surface temperature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OceanConfig {
    /// Surface temperature field overwritten over ocean.
    pub surface_temperature_name: String,
    /// Fraction of each cell covered by ocean, in `[0, 1]`.
    pub ocean_fraction_name: String,
    /// Blend by ocean fraction instead of masking on its rounded value.
    #[serde(default)]
    pub interpolate: bool,
}

impl OceanConfig {
    /// Build the ocean, checking the surface temperature is predicted.
    ///
    /// # Errors
    /// Fails if `surface_temperature_name` is not among `out_names`.
    pub fn build(&self, out_names: &[String]) -> StepperResult<Ocean> {
        if !out_names.contains(&self.surface_temperature_name) {
            return Err(StepperError::invalid_config(format!(
                "ocean surface temperature {} must be an output variable",
                self.surface_temperature_name
            )));
        }
        Ok(Ocean {
            config: self.clone(),
        })
    }

    /// Fields the ocean reads from the data.
    pub fn names(&self) -> Vec<String> {
        vec![
            self.surface_temperature_name.clone(),
            self.ocean_fraction_name.clone(),
        ]
    }
}

/// Prescribes surface temperature over ocean cells.
#[derive(Debug, Clone)]
pub struct Ocean {
    config: OceanConfig,
}

impl Ocean {
    /// Configuration in use.
    pub fn config(&self) -> &OceanConfig {
        &self.config
    }
}

impl BoundaryCondition for Ocean {
    fn target_names(&self) -> Vec<String> {
        self.config.names()
    }

    fn prescribe(
        &self,
        target: &TensorMap,
        _input: &TensorMap,
        mut gen: TensorMap,
    ) -> StepperResult<TensorMap> {
        let sst_name = &self.config.surface_temperature_name;
        let fraction_name = &self.config.ocean_fraction_name;
        let fraction = target
            .get(fraction_name)
            .ok_or_else(|| StepperError::missing_field(fraction_name.as_str()))?;
        let prescribed = target
            .get(sst_name)
            .ok_or_else(|| StepperError::missing_field(sst_name.as_str()))?;
        let generated = gen
            .get(sst_name)
            .ok_or_else(|| StepperError::missing_field(sst_name.as_str()))?;

        // An ensemble member axis on `gen` broadcasts against the target.
        let prescribed = prescribed.to_dtype(generated.dtype())?;
        let fraction = fraction.to_dtype(generated.dtype())?;
        let value = if self.config.interpolate {
            let land = fraction.affine(-1.0, 1.0)?;
            fraction
                .broadcast_mul(&prescribed)?
                .broadcast_add(&generated.broadcast_mul(&land)?)?
        } else {
            let is_ocean = fraction.round()?.eq(&fraction.ones_like()?)?;
            let shape = generated.shape();
            is_ocean
                .broadcast_as(shape)?
                .where_cond(&prescribed.broadcast_as(shape)?, generated)?
        };
        gen.insert(sst_name.clone(), value);
        Ok(gen)
    }
}
