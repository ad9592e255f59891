//! Per-field standardization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{StepperError, StepperResult};
use crate::fields::TensorMap;

/// Maps fields between physical units and standardized space.
pub trait Normalize {
    /// `(x - mean) / std` for every field in `data`.
    fn normalize(&self, data: &TensorMap) -> StepperResult<TensorMap>;

    /// Exact inverse of [`Normalize::normalize`].
    fn denormalize(&self, data: &TensorMap) -> StepperResult<TensorMap>;
}

/// Per-name mean and standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardNormalizer {
    means: HashMap<String, f64>,
    stds: HashMap<String, f64>,
}

impl StandardNormalizer {
    /// Create a normalizer, checking that every mean has a positive std.
    pub fn new(means: HashMap<String, f64>, stds: HashMap<String, f64>) -> StepperResult<Self> {
        for name in means.keys() {
            match stds.get(name) {
                Some(std) if *std > 0.0 && std.is_finite() => {}
                Some(std) => {
                    return Err(StepperError::invalid_config(format!(
                        "std for {name} must be positive and finite, got {std}"
                    )))
                }
                None => return Err(StepperError::MissingNormalization { name: name.clone() }),
            }
        }
        if let Some(name) = stds.keys().find(|name| !means.contains_key(*name)) {
            return Err(StepperError::MissingNormalization { name: name.clone() });
        }
        Ok(Self { means, stds })
    }

    /// True if `name` has statistics.
    pub fn contains(&self, name: &str) -> bool {
        self.means.contains_key(name)
    }

    /// Mean and std for `name`.
    pub fn stats(&self, name: &str) -> StepperResult<(f64, f64)> {
        let mean = self.means.get(name);
        let std = self.stds.get(name);
        match (mean, std) {
            (Some(mean), Some(std)) => Ok((*mean, *std)),
            _ => Err(StepperError::MissingNormalization {
                name: name.to_string(),
            }),
        }
    }

    /// Restrict to `names`, failing if any is not covered.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> StepperResult<Self> {
        let mut means = HashMap::with_capacity(names.len());
        let mut stds = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let (mean, std) = self.stats(name)?;
            means.insert(name.to_string(), mean);
            stds.insert(name.to_string(), std);
        }
        Ok(Self { means, stds })
    }

    fn apply(
        &self,
        data: &TensorMap,
        transform: impl Fn(&Tensor, f64, f64) -> candle_core::Result<Tensor>,
    ) -> StepperResult<TensorMap> {
        data.iter()
            .map(|(name, tensor)| {
                let (mean, std) = self.stats(name)?;
                Ok((name.clone(), transform(tensor, mean, std)?))
            })
            .collect()
    }
}

impl Normalize for StandardNormalizer {
    fn normalize(&self, data: &TensorMap) -> StepperResult<TensorMap> {
        self.apply(data, |x, mean, std| x.affine(1.0 / std, -mean / std))
    }

    fn denormalize(&self, data: &TensorMap) -> StepperResult<TensorMap> {
        self.apply(data, |x, mean, std| x.affine(std, mean))
    }
}

/// Where normalization statistics come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationConfig {
    /// Inline per-name means.
    #[serde(default)]
    pub means: HashMap<String, f64>,
    /// Inline per-name standard deviations.
    #[serde(default)]
    pub stds: HashMap<String, f64>,
    /// JSON file with `{"means": {...}, "stds": {...}}`; overrides inline values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct StatsFile {
    means: HashMap<String, f64>,
    stds: HashMap<String, f64>,
}

impl NormalizationConfig {
    /// Load statistics, keeping only `names`.
    ///
    /// # Errors
    /// Fails with [`StepperError::MissingNormalization`] if a name has no
    /// statistics, or with an I/O or JSON error when the stats file is bad.
    pub fn build<S: AsRef<str>>(&self, names: &[S]) -> StepperResult<StandardNormalizer> {
        let normalizer = match &self.stats_path {
            Some(path) => Self::load_stats(path)?,
            None => StandardNormalizer::new(self.means.clone(), self.stds.clone())?,
        };
        normalizer.subset(names)
    }

    fn load_stats(path: &Path) -> StepperResult<StandardNormalizer> {
        let contents = std::fs::read_to_string(path)?;
        let stats: StatsFile = serde_json::from_str(&contents)?;
        StandardNormalizer::new(stats.means, stats.stds)
    }
}
