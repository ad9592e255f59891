//! Physical-quantity accessors over a named field mapping.
//!
//! Datasets name the same quantity differently (`PRESsfc` vs `PS`), so each
//! canonical quantity carries an ordered alias list. Lookups take the first
//! alias present; writes go to whichever alias already exists.
//!
//! [`ClimateData`] never copies the mapping. Wrapping a `&mut TensorMap`
//! makes the setters write through to the caller's data.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use candle_core::Tensor;

use crate::constants::LATENT_HEAT_OF_VAPORIZATION;
use crate::error::{StepperError, StepperResult};
use crate::fields::TensorMap;
use crate::metrics;
use crate::sigma::SigmaCoordinates;

/// Canonical physical quantities resolvable through aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClimateField {
    SpecificTotalWater,
    SurfacePressure,
    AdvectionTendency,
    LatentHeatFlux,
    SensibleHeatFlux,
    PrecipitationRate,
    SurfaceDownShortwave,
    SurfaceUpShortwave,
    SurfaceDownLongwave,
    SurfaceUpLongwave,
}

impl ClimateField {
    /// Every canonical quantity.
    pub const ALL: [ClimateField; 10] = [
        Self::SpecificTotalWater,
        Self::SurfacePressure,
        Self::AdvectionTendency,
        Self::LatentHeatFlux,
        Self::SensibleHeatFlux,
        Self::PrecipitationRate,
        Self::SurfaceDownShortwave,
        Self::SurfaceUpShortwave,
        Self::SurfaceDownLongwave,
        Self::SurfaceUpLongwave,
    ];

    /// Canonical name used in error messages.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Self::SpecificTotalWater => "specific_total_water",
            Self::SurfacePressure => "surface_pressure",
            Self::AdvectionTendency => "tendency_of_total_water_path_due_to_advection",
            Self::LatentHeatFlux => "latent_heat_flux",
            Self::SensibleHeatFlux => "sensible_heat_flux",
            Self::PrecipitationRate => "precipitation_rate",
            Self::SurfaceDownShortwave => "sfc_down_sw_radiative_flux",
            Self::SurfaceUpShortwave => "sfc_up_sw_radiative_flux",
            Self::SurfaceDownLongwave => "sfc_down_lw_radiative_flux",
            Self::SurfaceUpLongwave => "sfc_up_lw_radiative_flux",
        }
    }

    /// Field names tried for this quantity, highest priority first.
    ///
    /// For [`ClimateField::SpecificTotalWater`] these are level prefixes.
    pub fn default_aliases(&self) -> &'static [&'static str] {
        match self {
            Self::SpecificTotalWater => &["specific_total_water_"],
            Self::SurfacePressure => &["PRESsfc", "PS"],
            Self::AdvectionTendency => &["tendency_of_total_water_path_due_to_advection"],
            Self::LatentHeatFlux => &["LHTFLsfc", "LHFLX"],
            Self::SensibleHeatFlux => &["SHTFLsfc"],
            Self::PrecipitationRate => &["PRATEsfc", "surface_precipitation_rate"],
            Self::SurfaceDownShortwave => &["DSWRFsfc"],
            Self::SurfaceUpShortwave => &["USWRFsfc"],
            Self::SurfaceDownLongwave => &["DLWRFsfc"],
            Self::SurfaceUpLongwave => &["ULWRFsfc"],
        }
    }
}

/// Ordered alias lists for every canonical quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAliases {
    aliases: HashMap<ClimateField, Vec<String>>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        let aliases = ClimateField::ALL
            .iter()
            .map(|field| {
                let names = field.default_aliases().iter().map(|s| s.to_string()).collect();
                (*field, names)
            })
            .collect();
        Self { aliases }
    }
}

impl FieldAliases {
    /// Replace the alias list of one quantity.
    pub fn with_aliases(mut self, field: ClimateField, names: Vec<String>) -> Self {
        self.aliases.insert(field, names);
        self
    }

    /// Alias list of `field`, highest priority first.
    pub fn get(&self, field: ClimateField) -> &[String] {
        self.aliases.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    Text(String),
    Number(String),
}

impl Ord for Chunk {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Chunk::Number(a), Chunk::Number(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Chunk::Text(a), Chunk::Text(b)) => a.cmp(b),
            (Chunk::Number(_), Chunk::Text(_)) => Ordering::Less,
            (Chunk::Text(_), Chunk::Number(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn natural_key(name: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;
    for c in name.chars() {
        let is_digit = c.is_ascii_digit();
        if is_digit != in_digits {
            chunks.push(make_chunk(std::mem::take(&mut current), in_digits));
        }
        in_digits = is_digit;
        current.push(c);
    }
    chunks.push(make_chunk(current, in_digits));
    chunks
}

fn make_chunk(text: String, digits: bool) -> Chunk {
    if digits {
        let trimmed = text.trim_start_matches('0');
        Chunk::Number(trimmed.to_string())
    } else {
        Chunk::Text(text.to_lowercase())
    }
}

/// Sort names alphabetically but with embedded numbers compared by value,
/// so `a2` sorts before `a11`.
pub fn natural_sort<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut sorted: Vec<String> = names.iter().map(|s| s.as_ref().to_string()).collect();
    sorted.sort_by_cached_key(|name| natural_key(name));
    sorted
}

/// Semantic view over a named field mapping.
///
/// `D` is `&TensorMap` for read-only access or `&mut TensorMap` when the
/// setters are needed.
pub struct ClimateData<'a, D> {
    data: D,
    aliases: Cow<'a, FieldAliases>,
}

impl<'a, D: Deref<Target = TensorMap>> ClimateData<'a, D> {
    /// Wrap `data` with the default alias table.
    pub fn new(data: D) -> Self {
        Self {
            data,
            aliases: Cow::Owned(FieldAliases::default()),
        }
    }

    /// Wrap `data` with a custom alias table.
    pub fn with_aliases(data: D, aliases: &'a FieldAliases) -> Self {
        Self {
            data,
            aliases: Cow::Borrowed(aliases),
        }
    }

    fn get(&self, field: ClimateField) -> StepperResult<Tensor> {
        self.aliases
            .get(field)
            .iter()
            .find_map(|alias| self.data.get(alias))
            .cloned()
            .ok_or_else(|| StepperError::missing_field(field.canonical_name()))
    }

    fn extract_levels(&self, field: ClimateField) -> StepperResult<Tensor> {
        for prefix in self.aliases.get(field) {
            let names: Vec<&String> = self
                .data
                .keys()
                .filter(|name| name.starts_with(prefix.as_str()))
                .collect();
            if names.is_empty() {
                continue;
            }
            let tensors = natural_sort(&names)
                .iter()
                .map(|name| &self.data[name])
                .collect::<Vec<_>>();
            let level_axis = tensors[0].rank();
            return Ok(Tensor::stack(&tensors, level_axis)?);
        }
        Err(StepperError::missing_field(field.canonical_name()))
    }

    /// All levels of specific total water stacked as `(..., level)`.
    pub fn specific_total_water(&self) -> StepperResult<Tensor> {
        self.extract_levels(ClimateField::SpecificTotalWater)
    }

    /// Surface pressure (Pa).
    pub fn surface_pressure(&self) -> StepperResult<Tensor> {
        self.get(ClimateField::SurfacePressure)
    }

    /// Precipitation rate (kg m-2 s-1).
    pub fn precipitation_rate(&self) -> StepperResult<Tensor> {
        self.get(ClimateField::PrecipitationRate)
    }

    /// Latent heat flux (W m-2).
    pub fn latent_heat_flux(&self) -> StepperResult<Tensor> {
        self.get(ClimateField::LatentHeatFlux)
    }

    /// Sensible heat flux (W m-2).
    pub fn sensible_heat_flux(&self) -> StepperResult<Tensor> {
        self.get(ClimateField::SensibleHeatFlux)
    }

    /// Evaporation rate derived from latent heat flux (kg m-2 s-1).
    pub fn evaporation_rate(&self) -> StepperResult<Tensor> {
        let lhf = self.latent_heat_flux()?;
        Ok(lhf.affine(1.0 / LATENT_HEAT_OF_VAPORIZATION, 0.0)?)
    }

    /// Tendency of total water path due to advection (kg m-2 s-1).
    pub fn tendency_of_total_water_path_due_to_advection(&self) -> StepperResult<Tensor> {
        self.get(ClimateField::AdvectionTendency)
    }

    /// Surface pressure attributable to dry air (Pa).
    pub fn surface_pressure_due_to_dry_air(&self, sigma: &SigmaCoordinates) -> StepperResult<Tensor> {
        metrics::surface_pressure_due_to_dry_air(
            &self.specific_total_water()?,
            &self.surface_pressure()?,
            sigma,
        )
    }

    /// Vertically integrated total water (kg m-2).
    pub fn total_water_path(&self, sigma: &SigmaCoordinates) -> StepperResult<Tensor> {
        metrics::vertical_integral(
            &self.specific_total_water()?,
            &self.surface_pressure()?,
            sigma,
        )
    }

    /// Net downward surface energy flux, ignoring frozen precipitation.
    pub fn net_surface_energy_flux_without_frozen_precip(&self) -> StepperResult<Tensor> {
        metrics::net_surface_energy_flux(
            &self.get(ClimateField::SurfaceDownLongwave)?,
            &self.get(ClimateField::SurfaceUpLongwave)?,
            &self.get(ClimateField::SurfaceDownShortwave)?,
            &self.get(ClimateField::SurfaceUpShortwave)?,
            &self.latent_heat_flux()?,
            &self.sensible_heat_flux()?,
        )
    }
}

impl<'a, D: DerefMut<Target = TensorMap>> ClimateData<'a, D> {
    fn set(&mut self, field: ClimateField, value: Tensor) -> StepperResult<()> {
        let alias = self
            .aliases
            .get(field)
            .iter()
            .find(|alias| self.data.contains_key(alias.as_str()))
            .cloned()
            .ok_or_else(|| StepperError::missing_field(field.canonical_name()))?;
        self.data.insert(alias, value);
        Ok(())
    }

    /// Overwrite surface pressure under its existing alias.
    pub fn set_surface_pressure(&mut self, value: Tensor) -> StepperResult<()> {
        self.set(ClimateField::SurfacePressure, value)
    }

    /// Overwrite precipitation rate under its existing alias.
    pub fn set_precipitation_rate(&mut self, value: Tensor) -> StepperResult<()> {
        self.set(ClimateField::PrecipitationRate, value)
    }

    /// Overwrite latent heat flux under its existing alias.
    pub fn set_latent_heat_flux(&mut self, value: Tensor) -> StepperResult<()> {
        self.set(ClimateField::LatentHeatFlux, value)
    }

    /// Store an evaporation rate as the equivalent latent heat flux.
    pub fn set_evaporation_rate(&mut self, value: Tensor) -> StepperResult<()> {
        let lhf = value.affine(LATENT_HEAT_OF_VAPORIZATION, 0.0)?;
        self.set(ClimateField::LatentHeatFlux, lhf)
    }

    /// Overwrite the advective moisture tendency under its existing alias.
    pub fn set_tendency_of_total_water_path_due_to_advection(
        &mut self,
        value: Tensor,
    ) -> StepperResult<()> {
        self.set(ClimateField::AdvectionTendency, value)
    }
}
