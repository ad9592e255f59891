//! Post-step physical consistency corrections.
//!
//! The corrector runs after every network step on denormalized fields. It is
//! a pure function of `(input, generated)` and applies up to three stages in
//! a fixed order:
//!
//! 1. **Dry air conservation**: shift dry-air surface pressure by a global
//!    constant so that its area-weighted global mean matches the input, then
//!    solve for the surface pressure giving that dry air:
//!
//!    ```text
//!    ps = (dry_air + Σ_k Δak_k q_k) / (1 - Σ_k Δbk_k q_k)
//!    ```
//!
//! 2. **Zero global-mean moisture advection**: subtract the global mean of
//!    the advective total-water tendency.
//!
//! 3. **Moisture budget closure**: rescale precipitation or evaporation so
//!    that `global_mean(dTWP/dt) = global_mean(E) - global_mean(P)`, and
//!    optionally recompute advection per column as the budget residual.
//!
//! The budget stage assumes the global-mean advective tendency is zero.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::climate_data::ClimateData;
use crate::constants::TIMESTEP_SECONDS;
use crate::error::{StepperError, StepperResult};
use crate::fields::TensorMap;
use crate::metrics::{expand_to_grid, remove_global_mean, weighted_mean};
use crate::sigma::SigmaCoordinates;

/// Which budget terms are modified to close the moisture budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoistureBudgetCorrection {
    /// Scale precipitation to close the global budget.
    Precipitation,
    /// Scale evaporation to close the global budget.
    Evaporation,
    /// Scale precipitation, then recompute advection per column.
    AdvectionAndPrecipitation,
    /// Scale evaporation, then recompute advection per column.
    AdvectionAndEvaporation,
}

impl MoistureBudgetCorrection {
    /// True if precipitation carries the global-mean correction.
    pub fn modifies_precipitation(&self) -> bool {
        matches!(self, Self::Precipitation | Self::AdvectionAndPrecipitation)
    }

    /// True if advection is recomputed as the column budget residual.
    pub fn recomputes_advection(&self) -> bool {
        matches!(
            self,
            Self::AdvectionAndPrecipitation | Self::AdvectionAndEvaporation
        )
    }
}

/// Switches for the corrector stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectorConfig {
    /// Conserve global dry air mass by offsetting surface pressure.
    #[serde(default)]
    pub conserve_dry_air: bool,

    /// Force the advective moisture tendency to have zero global mean.
    #[serde(default)]
    pub zero_global_mean_moisture_advection: bool,

    /// Close the moisture budget by modifying the given terms.
    #[serde(default)]
    pub moisture_budget_correction: Option<MoistureBudgetCorrection>,
}

impl CorrectorConfig {
    /// True if at least one stage is enabled.
    pub fn is_active(&self) -> bool {
        self.conserve_dry_air
            || self.zero_global_mean_moisture_advection
            || self.moisture_budget_correction.is_some()
    }

    /// Flag configurations whose budget assumption is left unchecked.
    ///
    /// Budget closure assumes zero global-mean advection. This is not
    /// enforced; a warning is logged so the caller can decide.
    pub fn validate(&self) -> StepperResult<()> {
        if let Some(mode) = self.moisture_budget_correction {
            if !self.zero_global_mean_moisture_advection {
                warn!(
                    ?mode,
                    "moisture_budget_correction assumes zero global-mean moisture advection, \
                     but zero_global_mean_moisture_advection is disabled"
                );
            }
        }
        Ok(())
    }

    /// Build a corrector on `area` weights and `sigma` coordinates.
    pub fn build(
        &self,
        area: &Tensor,
        sigma: &SigmaCoordinates,
        timestep_seconds: f64,
    ) -> StepperResult<Corrector> {
        Corrector::new(self.clone(), area.clone(), sigma.clone(), timestep_seconds)
    }
}

/// Stateless corrector applied to every generated step.
#[derive(Debug, Clone)]
pub struct Corrector {
    config: CorrectorConfig,
    area: Tensor,
    sigma: SigmaCoordinates,
    timestep_seconds: f64,
}

impl Corrector {
    /// Create a corrector.
    ///
    /// # Errors
    /// Fails if `area` is not a 2-D `(lat, lon)` tensor, the sigma
    /// coordinates are invalid, or the timestep is not positive.
    pub fn new(
        config: CorrectorConfig,
        area: Tensor,
        sigma: SigmaCoordinates,
        timestep_seconds: f64,
    ) -> StepperResult<Self> {
        if area.rank() != 2 {
            return Err(StepperError::shape_mismatch(
                "(lat, lon) area weights",
                format!("{:?}", area.dims()),
            ));
        }
        sigma.validate()?;
        if timestep_seconds <= 0.0 {
            return Err(StepperError::invalid_config(format!(
                "timestep_seconds must be positive, got {timestep_seconds}"
            )));
        }
        config.validate()?;
        Ok(Self {
            config,
            area,
            sigma,
            timestep_seconds,
        })
    }

    /// Create a corrector with the default six-hour timestep.
    pub fn with_default_timestep(
        config: CorrectorConfig,
        area: Tensor,
        sigma: SigmaCoordinates,
    ) -> StepperResult<Self> {
        Self::new(config, area, sigma, TIMESTEP_SECONDS)
    }

    /// Configuration in use.
    pub fn config(&self) -> &CorrectorConfig {
        &self.config
    }

    /// Move the area weights to `device`.
    pub fn to_device(mut self, device: &Device) -> StepperResult<Self> {
        self.area = self.area.to_device(device)?;
        Ok(self)
    }

    /// Apply the enabled stages to `gen`, returning the corrected mapping.
    ///
    /// `input` is the denormalized state the step started from.
    pub fn correct(&self, input: &TensorMap, mut gen: TensorMap) -> StepperResult<TensorMap> {
        if self.config.conserve_dry_air {
            force_conserve_dry_air(input, &mut gen, &self.area, &self.sigma)?;
        }
        if self.config.zero_global_mean_moisture_advection {
            force_zero_global_mean_moisture_advection(&mut gen, &self.area)?;
        }
        if let Some(mode) = self.config.moisture_budget_correction {
            force_conserve_moisture(
                input,
                &mut gen,
                &self.area,
                &self.sigma,
                mode,
                self.timestep_seconds,
            )?;
        }
        Ok(gen)
    }
}

/// Offset dry-air surface pressure so its global mean matches `input`.
pub fn force_conserve_dry_air(
    input: &TensorMap,
    gen: &mut TensorMap,
    area: &Tensor,
    sigma: &SigmaCoordinates,
) -> StepperResult<()> {
    let input = ClimateData::new(input);
    let input_pressure = input.surface_pressure()?;
    let target_dry_air = weighted_mean(&input.surface_pressure_due_to_dry_air(sigma)?, area)?;

    let mut gen = ClimateData::new(gen);
    let gen_dry_air = gen.surface_pressure_due_to_dry_air(sigma)?;
    let error = (weighted_mean(&gen_dry_air, area)? - target_dry_air)?;
    let new_dry_air = gen_dry_air.broadcast_sub(&expand_to_grid(&error)?)?;

    let water = gen.specific_total_water()?;
    let (ak_diff, bk_diff) = sigma.diff_tensors(water.device(), water.dtype())?;
    let ak_term = water.broadcast_mul(&ak_diff)?.sum(candle_core::D::Minus1)?;
    let bk_term = water.broadcast_mul(&bk_diff)?.sum(candle_core::D::Minus1)?;
    let denominator = bk_term.affine(-1.0, 1.0)?;
    let new_pressure = (new_dry_air + ak_term)?.broadcast_div(&denominator)?;
    gen.set_surface_pressure(new_pressure.to_dtype(input_pressure.dtype())?)
}

/// Remove the global mean of the advective moisture tendency.
pub fn force_zero_global_mean_moisture_advection(
    gen: &mut TensorMap,
    area: &Tensor,
) -> StepperResult<()> {
    let mut gen = ClimateData::new(gen);
    let advection = gen.tendency_of_total_water_path_due_to_advection()?;
    gen.set_tendency_of_total_water_path_due_to_advection(remove_global_mean(&advection, area)?)
}

/// Close the moisture budget by modifying the terms selected by `mode`.
///
/// Scaling divides by the current global mean of the modified term; a zero
/// mean propagates as non-finite values rather than an error.
pub fn force_conserve_moisture(
    input: &TensorMap,
    gen: &mut TensorMap,
    area: &Tensor,
    sigma: &SigmaCoordinates,
    mode: MoistureBudgetCorrection,
    timestep_seconds: f64,
) -> StepperResult<()> {
    let input_twp = ClimateData::new(input).total_water_path(sigma)?;
    let mut gen = ClimateData::new(gen);

    let twp_tendency = (gen.total_water_path(sigma)? - input_twp)?.affine(1.0 / timestep_seconds, 0.0)?;
    let twp_tendency_mean = weighted_mean(&twp_tendency, area)?;
    let evaporation_mean = weighted_mean(&gen.evaporation_rate()?, area)?;
    let precipitation_mean = weighted_mean(&gen.precipitation_rate()?, area)?;

    if mode.modifies_precipitation() {
        let new_mean = (&evaporation_mean - &twp_tendency_mean)?;
        let scale = expand_to_grid(&(new_mean / precipitation_mean)?)?;
        let precipitation = gen.precipitation_rate()?.broadcast_mul(&scale)?;
        gen.set_precipitation_rate(precipitation)?;
    } else {
        let new_mean = (&twp_tendency_mean + &precipitation_mean)?;
        let scale = expand_to_grid(&(new_mean / evaporation_mean)?)?;
        let evaporation = gen.evaporation_rate()?.broadcast_mul(&scale)?;
        gen.set_evaporation_rate(evaporation)?;
    }

    if mode.recomputes_advection() {
        let budget = (gen.evaporation_rate()? - gen.precipitation_rate()?)?;
        gen.set_tendency_of_total_water_path_due_to_advection((twp_tendency - budget)?)?;
    }
    Ok(())
}
