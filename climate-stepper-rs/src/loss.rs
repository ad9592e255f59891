//! Step losses on packed tensors.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::climate_data::ClimateData;
use crate::error::{StepperError, StepperResult};
use crate::fields::TensorMap;
use crate::metrics::dry_air_absolute_differences;
use crate::sigma::SigmaCoordinates;

/// Kind of per-step loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Mean squared error
    #[default]
    Mse,
    /// Mean absolute error
    L1,
    /// Squared error weighted by grid-cell area
    AreaWeightedMse,
}

/// Configuration of the per-step loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Loss function
    #[serde(default)]
    pub kind: LossKind,
    /// Scalar multiplier
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::default(),
            weight: default_weight(),
        }
    }
}

impl LossConfig {
    /// Build the loss. `area` is required for [`LossKind::AreaWeightedMse`].
    pub fn build(&self, area: &Tensor) -> StepperResult<StepLoss> {
        if !(self.weight.is_finite() && self.weight >= 0.0) {
            return Err(StepperError::invalid_config(format!(
                "loss weight must be finite and non-negative, got {}",
                self.weight
            )));
        }
        let area = match self.kind {
            LossKind::AreaWeightedMse => {
                let mean = area.mean_all()?;
                Some(area.broadcast_div(&mean)?)
            }
            _ => None,
        };
        Ok(StepLoss {
            kind: self.kind,
            weight: self.weight,
            area,
        })
    }
}

/// Loss between a generated and a target packed tensor.
#[derive(Debug, Clone)]
pub struct StepLoss {
    kind: LossKind,
    weight: f64,
    area: Option<Tensor>,
}

impl StepLoss {
    /// Scalar loss between `gen` and `target` of equal shape.
    pub fn compute(&self, gen: &Tensor, target: &Tensor) -> StepperResult<Tensor> {
        if gen.dims() != target.dims() {
            return Err(StepperError::shape_mismatch(
                format!("{:?}", target.dims()),
                format!("{:?}", gen.dims()),
            ));
        }
        let diff = (gen - target)?;
        let loss = match (&self.kind, &self.area) {
            (LossKind::L1, _) => diff.abs()?.mean_all()?,
            (LossKind::AreaWeightedMse, Some(area)) => diff
                .sqr()?
                .broadcast_mul(&area.to_dtype(diff.dtype())?)?
                .mean_all()?,
            _ => diff.sqr()?.mean_all()?,
        };
        Ok(loss.affine(self.weight, 0.0)?)
    }
}

/// Penalties on the generated timeseries as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConservationLossConfig {
    /// Weight of the mean absolute step-to-step change of global dry air.
    #[serde(default)]
    pub dry_air_penalty: Option<f64>,
}

impl ConservationLossConfig {
    pub fn build(&self, area: &Tensor, sigma: &SigmaCoordinates) -> StepperResult<ConservationLoss> {
        if let Some(penalty) = self.dry_air_penalty {
            if !(penalty.is_finite() && penalty >= 0.0) {
                return Err(StepperError::invalid_config(format!(
                    "dry_air_penalty must be finite and non-negative, got {penalty}"
                )));
            }
        }
        Ok(ConservationLoss {
            dry_air_penalty: self.dry_air_penalty,
            area: area.clone(),
            sigma: sigma.clone(),
        })
    }
}

/// Conservation penalties on a denormalized generated timeseries.
#[derive(Debug, Clone)]
pub struct ConservationLoss {
    dry_air_penalty: Option<f64>,
    area: Tensor,
    sigma: SigmaCoordinates,
}

impl ConservationLoss {
    /// Metrics and the total penalty for `gen_data`, `(..., time, lat, lon)`.
    ///
    /// Returns a zero loss on the device of `area` when no penalty is set.
    pub fn compute(&self, gen_data: &TensorMap) -> StepperResult<(HashMap<String, f64>, Tensor)> {
        let mut metrics = HashMap::new();
        let mut loss = Tensor::zeros((), DType::F32, self.area.device())?;
        if let Some(penalty) = self.dry_air_penalty {
            let view = ClimateData::new(gen_data);
            let differences = dry_air_absolute_differences(
                &view.specific_total_water()?,
                &view.surface_pressure()?,
                &self.area,
                &self.sigma,
            )?;
            let dry_air_loss = differences.mean_all()?.affine(penalty, 0.0)?;
            metrics.insert(
                "dry_air_loss".to_string(),
                dry_air_loss.to_dtype(DType::F64)?.to_scalar::<f64>()?,
            );
            loss = (loss + dry_air_loss.to_dtype(DType::F32)?)?;
        }
        Ok((metrics, loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn area(device: &Device) -> Tensor {
        Tensor::new(&[[1f32, 3.0]], device).unwrap()
    }

    #[test]
    fn test_mse_and_l1() {
        let device = Device::Cpu;
        let gen = Tensor::new(&[[[[1f32, 2.0]]]], &device).unwrap();
        let target = Tensor::zeros((1, 1, 1, 2), DType::F32, &device).unwrap();

        let mse = LossConfig::default().build(&area(&device)).unwrap();
        let value = mse.compute(&gen, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!((value - 2.5).abs() < 1e-6);

        let l1 = LossConfig {
            kind: LossKind::L1,
            weight: 2.0,
        }
        .build(&area(&device))
        .unwrap();
        let value = l1.compute(&gen, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!((value - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_area_weighted() {
        let device = Device::Cpu;
        let gen = Tensor::new(&[[[[1f32, 2.0]]]], &device).unwrap();
        let target = Tensor::zeros((1, 1, 1, 2), DType::F32, &device).unwrap();
        let loss = LossConfig {
            kind: LossKind::AreaWeightedMse,
            weight: 1.0,
        }
        .build(&area(&device))
        .unwrap();
        // weights normalize to [0.5, 1.5]
        let value = loss.compute(&gen, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!((value - 3.25).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch() {
        let device = Device::Cpu;
        let loss = LossConfig::default().build(&area(&device)).unwrap();
        let gen = Tensor::zeros((1, 2, 1, 2), DType::F32, &device).unwrap();
        let target = Tensor::zeros((1, 1, 1, 2), DType::F32, &device).unwrap();
        assert!(loss.compute(&gen, &target).is_err());
    }

    fn timeseries(device: &Device, pressures: &[f32]) -> TensorMap {
        let n_times = pressures.len();
        let ps: Vec<f32> = pressures
            .iter()
            .flat_map(|p| std::iter::repeat(*p).take(4))
            .collect();
        let mut data = TensorMap::new();
        data.insert(
            "PRESsfc".into(),
            Tensor::from_vec(ps, (1, n_times, 2, 2), device).unwrap(),
        );
        for level in 0..2 {
            data.insert(
                format!("specific_total_water_{level}"),
                Tensor::zeros((1, n_times, 2, 2), DType::F32, device).unwrap(),
            );
        }
        data
    }

    #[test]
    fn test_conservation_loss_disabled() {
        let device = Device::Cpu;
        let sigma = SigmaCoordinates::new(vec![0.0, 500.0, 1000.0], vec![1.0, 0.5, 0.0]).unwrap();
        let area = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        let loss = ConservationLossConfig::default().build(&area, &sigma).unwrap();
        let (metrics, value) = loss.compute(&TensorMap::new()).unwrap();
        assert!(metrics.is_empty());
        assert_eq!(value.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_dry_air_penalty() {
        let device = Device::Cpu;
        let sigma = SigmaCoordinates::new(vec![0.0, 500.0, 1000.0], vec![1.0, 0.5, 0.0]).unwrap();
        let area = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        let config = ConservationLossConfig {
            dry_air_penalty: Some(0.5),
        };
        let loss = config.build(&area, &sigma).unwrap();
        // dry air equals surface pressure without water: changes of 10 and 30
        let data = timeseries(&device, &[1e5, 1.0001e5, 0.9998e5]);
        let (metrics, value) = loss.compute(&data).unwrap();
        let value = value.to_scalar::<f32>().unwrap();
        assert!((value - 10.0).abs() < 1e-2, "penalty {value}");
        assert!((metrics["dry_air_loss"] - 10.0).abs() < 1e-2);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let config = LossConfig {
            kind: LossKind::Mse,
            weight: -1.0,
        };
        assert!(config.build(&area(&Device::Cpu)).is_err());
    }
}
