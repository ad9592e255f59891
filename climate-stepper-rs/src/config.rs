//! Stepper and inference configuration.
//!
//! Configurations are plain serde structs read from YAML. Deprecated keys
//! are migrated by [`StepperConfig::migrate_deprecated`], which
//! [`StepperConfig::from_file`] calls for you.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::TIMESTEP_SECONDS;
use crate::corrector::CorrectorConfig;
use crate::error::{StepperError, StepperResult};
use crate::loss::{ConservationLossConfig, LossConfig};
use crate::module::ModuleSelector;
use crate::normalizer::NormalizationConfig;
use crate::ocean::OceanConfig;
use crate::sigma::SigmaCoordinates;

/// Deprecated form of [`OceanConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrescriberConfig {
    /// Field overwritten by the prescriber
    pub prescribed_name: String,
    /// Mask selecting where the prescribed values apply
    pub mask_name: String,
    /// Blend by the mask instead of rounding it
    #[serde(default)]
    pub interpolate: bool,
}

/// Configuration of a single-module stepper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepperConfig {
    /// Network architecture
    pub builder: ModuleSelector,
    /// Input fields, in channel order
    pub in_names: Vec<String>,
    /// Output fields, in channel order
    pub out_names: Vec<String>,
    /// Normalization statistics
    pub normalization: NormalizationConfig,
    /// Prescribed sea-surface temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocean: Option<OceanConfig>,
    /// Deprecated, use `ocean`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescriber: Option<PrescriberConfig>,
    /// Per-step loss
    #[serde(default)]
    pub loss: LossConfig,
    /// Deprecated, use `corrector.conserve_dry_air`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conserve_dry_air: Option<bool>,
    /// Post-step physical corrections
    #[serde(default)]
    pub corrector: CorrectorConfig,
    /// Penalties on the whole generated timeseries
    #[serde(default)]
    pub conservation_loss: ConservationLossConfig,
    /// Members generated per sample
    #[serde(default = "default_ensemble_members")]
    pub n_ensemble_members: usize,
    /// Keep dropout active outside training
    #[serde(default)]
    pub enable_inference_dropout: bool,
    /// Model timestep used by the moisture budget
    #[serde(default = "default_timestep_seconds")]
    pub timestep_seconds: f64,
    /// Safetensors weights to start from instead of a random initialization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_weights_path: Option<PathBuf>,
}

fn default_ensemble_members() -> usize {
    1
}

fn default_timestep_seconds() -> f64 {
    TIMESTEP_SECONDS
}

/// Fields and window length a data loader must provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequirements {
    /// Every field read by the stepper, sorted
    pub names: Vec<String>,
    /// Timesteps per sample
    pub n_timesteps: usize,
}

impl StepperConfig {
    /// Minimal configuration over a toy two-level atmosphere, for tests.
    pub fn test() -> Self {
        let in_names: Vec<String> = [
            "PRESsfc",
            "specific_total_water_0",
            "specific_total_water_1",
            "DSWRFtoa",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let out_names: Vec<String> = [
            "PRESsfc",
            "specific_total_water_0",
            "specific_total_water_1",
            "PRATEsfc",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let mut normalization = NormalizationConfig::default();
        for (name, mean, std) in [
            ("PRESsfc", 1.0e5, 1.0e3),
            ("specific_total_water_0", 1.0e-2, 5.0e-3),
            ("specific_total_water_1", 5.0e-3, 2.5e-3),
            ("DSWRFtoa", 300.0, 100.0),
            ("PRATEsfc", 3.0e-5, 1.0e-5),
        ] {
            normalization.means.insert(name.to_string(), mean);
            normalization.stds.insert(name.to_string(), std);
        }
        Self {
            builder: ModuleSelector::test(),
            in_names,
            out_names,
            normalization,
            ocean: None,
            prescriber: None,
            loss: LossConfig::default(),
            conserve_dry_air: None,
            corrector: CorrectorConfig::default(),
            conservation_loss: ConservationLossConfig::default(),
            n_ensemble_members: 1,
            enable_inference_dropout: false,
            timestep_seconds: TIMESTEP_SECONDS,
            base_weights_path: None,
        }
    }

    /// Load from a YAML file, migrating deprecated keys and validating.
    pub fn from_file<P: AsRef<Path>>(path: P) -> StepperResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        let config = config.migrate_deprecated()?;
        config.validate()?;
        Ok(config)
    }

    /// Save as YAML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> StepperResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Move deprecated keys into their current location.
    ///
    /// # Errors
    /// Fails if a deprecated key conflicts with its replacement.
    pub fn migrate_deprecated(mut self) -> StepperResult<Self> {
        if let Some(conserve) = self.conserve_dry_air.take() {
            warn!("conserve_dry_air is deprecated, use corrector.conserve_dry_air instead");
            if self.corrector.conserve_dry_air && !conserve {
                return Err(StepperError::invalid_config(
                    "conserve_dry_air: false conflicts with corrector.conserve_dry_air: true",
                ));
            }
            self.corrector.conserve_dry_air = conserve;
        }
        if let Some(prescriber) = self.prescriber.take() {
            warn!("directly configuring prescriber is deprecated, use ocean instead");
            if self.ocean.is_some() {
                return Err(StepperError::invalid_config(
                    "cannot specify both prescriber and ocean",
                ));
            }
            self.ocean = Some(OceanConfig {
                surface_temperature_name: prescriber.prescribed_name,
                ocean_fraction_name: prescriber.mask_name,
                interpolate: prescriber.interpolate,
            });
        }
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> StepperResult<()> {
        if self.in_names.is_empty() || self.out_names.is_empty() {
            return Err(StepperError::invalid_config(
                "in_names and out_names must not be empty",
            ));
        }
        for (label, names) in [("in_names", &self.in_names), ("out_names", &self.out_names)] {
            let unique: BTreeSet<&String> = names.iter().collect();
            if unique.len() != names.len() {
                return Err(StepperError::invalid_config(format!(
                    "{label} contains duplicate names"
                )));
            }
        }
        if self.n_ensemble_members == 0 {
            return Err(StepperError::invalid_config(
                "n_ensemble_members must be at least 1",
            ));
        }
        if !(self.timestep_seconds.is_finite() && self.timestep_seconds > 0.0) {
            return Err(StepperError::invalid_config(format!(
                "timestep_seconds must be positive, got {}",
                self.timestep_seconds
            )));
        }
        if self.conserve_dry_air.is_some() || self.prescriber.is_some() {
            return Err(StepperError::invalid_config(
                "deprecated keys must be migrated before use",
            ));
        }
        self.builder.validate()?;
        self.corrector.validate()?;
        Ok(())
    }

    /// Every field the stepper reads, including ocean fields.
    pub fn all_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.normalize_names().into_iter().collect();
        if let Some(ocean) = &self.ocean {
            names.extend(ocean.names());
        }
        names.into_iter().collect()
    }

    /// Inputs and outputs, which carry normalization statistics.
    pub fn normalize_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .in_names
            .iter()
            .chain(self.out_names.iter())
            .cloned()
            .collect();
        names.into_iter().collect()
    }

    /// Inputs that the network does not predict.
    pub fn forcing_names(&self) -> Vec<String> {
        self.in_names
            .iter()
            .filter(|name| !self.out_names.contains(name))
            .cloned()
            .collect()
    }

    /// Data needed to roll out `n_forward_steps` steps.
    pub fn data_requirements(&self, n_forward_steps: usize) -> DataRequirements {
        DataRequirements {
            names: self.all_names(),
            n_timesteps: n_forward_steps + 1,
        }
    }
}

/// Where an inference run gets its stepper from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepperSource {
    /// Directory written by `SingleModuleStepper::save`
    Existing {
        /// Checkpoint directory
        checkpoint_path: PathBuf,
    },
    /// Fresh, untrained stepper
    Config(Box<StepperConfig>),
}

/// Configuration of the `inference` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Stepper to run
    pub stepper: StepperSource,
    /// Safetensors file with `(sample, time, lat, lon)` fields
    pub data_path: PathBuf,
    /// Safetensors file receiving the generated fields
    pub output_path: PathBuf,
    /// Steps to roll out
    pub n_forward_steps: usize,
    /// Vertical coordinates; read from `ak_N`/`bk_N` scalars in the data
    /// or from the checkpoint when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigma_coordinates: Option<SigmaCoordinates>,
    /// Grid latitudes in degrees for area weights; uniform when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lats: Option<Vec<f64>>,
}

impl InferenceConfig {
    /// Load from a YAML file and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> StepperResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        if let StepperSource::Config(stepper) = config.stepper {
            config.stepper = StepperSource::Config(Box::new(stepper.migrate_deprecated()?));
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> StepperResult<()> {
        if self.n_forward_steps == 0 {
            return Err(StepperError::invalid_config(
                "n_forward_steps must be at least 1",
            ));
        }
        if let Some(sigma) = &self.sigma_coordinates {
            sigma.validate()?;
        }
        match &self.stepper {
            StepperSource::Config(stepper) => stepper.validate(),
            StepperSource::Existing { .. } => Ok(()),
        }
    }
}
