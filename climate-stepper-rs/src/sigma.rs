//! Hybrid sigma-pressure vertical coordinates.
//!
//! Pressure at level interface `k` is `ak[k] + bk[k] * surface_pressure`.
//! Interfaces are stored sorted by level index, so a grid with `n` layers
//! carries `n + 1` values of each coefficient.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{StepperError, StepperResult};

/// Hybrid sigma-pressure interface coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaCoordinates {
    ak: Vec<f64>,
    bk: Vec<f64>,
}

impl SigmaCoordinates {
    /// Create coordinates from interface coefficients.
    ///
    /// # Errors
    /// Fails if `ak` and `bk` differ in length or describe no layer.
    pub fn new(ak: Vec<f64>, bk: Vec<f64>) -> StepperResult<Self> {
        let coords = Self { ak, bk };
        coords.validate()?;
        Ok(coords)
    }

    /// Build coordinates from scalars named `ak_N` / `bk_N`, sorted by `N`.
    pub fn from_indexed(values: &HashMap<String, f64>) -> StepperResult<Self> {
        let mut ak = BTreeMap::new();
        let mut bk = BTreeMap::new();
        for (name, value) in values {
            let (target, suffix) = if let Some(suffix) = name.strip_prefix("ak_") {
                (&mut ak, suffix)
            } else if let Some(suffix) = name.strip_prefix("bk_") {
                (&mut bk, suffix)
            } else {
                continue;
            };
            let level: usize = suffix.parse().map_err(|_| {
                StepperError::invalid_config(format!("bad sigma coordinate name: {name}"))
            })?;
            target.insert(level, *value);
        }
        if ak.is_empty() || bk.is_empty() {
            return Err(StepperError::invalid_config(
                "data does not contain ak and bk sigma coordinates",
            ));
        }
        if ak.len() != bk.len() {
            return Err(StepperError::invalid_config(format!(
                "expected same number of ak and bk coordinates, got {} and {}",
                ak.len(),
                bk.len()
            )));
        }
        Self::new(ak.into_values().collect(), bk.into_values().collect())
    }

    /// Check the coordinate invariants.
    ///
    /// Requires equal lengths, at least two interfaces, monotonic `bk` and
    /// strictly monotonic interface pressure at a 1000 hPa surface.
    pub fn validate(&self) -> StepperResult<()> {
        if self.ak.len() != self.bk.len() {
            return Err(StepperError::shape_mismatch(
                format!("bk of length {}", self.ak.len()),
                format!("bk of length {}", self.bk.len()),
            ));
        }
        if self.ak.len() < 2 {
            return Err(StepperError::invalid_config(
                "sigma coordinates need at least two interfaces",
            ));
        }
        if !is_monotonic(&self.bk, false) {
            return Err(StepperError::invalid_config(format!(
                "bk must be monotonic, got {:?}",
                self.bk
            )));
        }
        // ak alone may turn over in hybrid grids; interface pressure may not.
        let pressure: Vec<f64> = self
            .ak
            .iter()
            .zip(&self.bk)
            .map(|(ak, bk)| ak + bk * REFERENCE_SURFACE_PRESSURE)
            .collect();
        if !is_monotonic(&pressure, true) {
            return Err(StepperError::invalid_config(format!(
                "interface pressures must be strictly monotonic, got {pressure:?}"
            )));
        }
        Ok(())
    }

    /// Interface offsets `ak`.
    pub fn ak(&self) -> &[f64] {
        &self.ak
    }

    /// Interface scale factors `bk`.
    pub fn bk(&self) -> &[f64] {
        &self.bk
    }

    /// Number of vertical layers.
    pub fn n_levels(&self) -> usize {
        self.ak.len() - 1
    }

    /// Layer differences `(Δak, Δbk)` as 1-D tensors of length `n_levels`.
    pub fn diff_tensors(&self, device: &Device, dtype: DType) -> StepperResult<(Tensor, Tensor)> {
        let ak_diff: Vec<f64> = self.ak.windows(2).map(|w| w[1] - w[0]).collect();
        let bk_diff: Vec<f64> = self.bk.windows(2).map(|w| w[1] - w[0]).collect();
        let n = ak_diff.len();
        let ak_diff = Tensor::from_vec(ak_diff, n, device)?.to_dtype(dtype)?;
        let bk_diff = Tensor::from_vec(bk_diff, n, device)?.to_dtype(dtype)?;
        Ok((ak_diff, bk_diff))
    }
}

/// Surface pressure (Pa) at which interface ordering is checked.
const REFERENCE_SURFACE_PRESSURE: f64 = 1.0e5;

/// True if `values` only increase or only decrease.
fn is_monotonic(values: &[f64], strict: bool) -> bool {
    let steps = || values.windows(2).map(|w| w[1] - w[0]);
    if strict {
        steps().all(|d| d > 0.0) || steps().all(|d| d < 0.0)
    } else {
        steps().all(|d| d >= 0.0) || steps().all(|d| d <= 0.0)
    }
}
