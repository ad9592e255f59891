//! Area-weighted reductions and column diagnostics.
//!
//! All functions treat the two trailing dimensions of a field as the
//! horizontal `(lat, lon)` grid and, where a vertical dimension exists,
//! expect it after the grid: `(..., lat, lon, level)`.

use candle_core::{Device, Tensor, D};

use crate::constants::GRAVITY;
use crate::error::{StepperError, StepperResult};
use crate::sigma::SigmaCoordinates;

fn check_same_device(tensor: &Tensor, other: &Tensor) -> StepperResult<()> {
    if !tensor.device().same_device(other.device()) {
        return Err(StepperError::DeviceMismatch {
            expected: tensor.device().clone(),
            got: other.device().clone(),
        });
    }
    Ok(())
}

/// Area-weighted mean over the trailing `(lat, lon)` dimensions.
///
/// `area` need not sum to one. The result has the shape of `tensor` with the
/// two trailing dimensions removed.
///
/// # Errors
/// Fails if `area` does not match the trailing dims of `tensor` or lives on
/// another device.
pub fn weighted_mean(tensor: &Tensor, area: &Tensor) -> StepperResult<Tensor> {
    check_same_device(tensor, area)?;
    let dims = tensor.dims();
    if dims.len() < 2 || &dims[dims.len() - 2..] != area.dims() {
        return Err(StepperError::shape_mismatch(
            format!("(..., {:?}) matching area weights", area.dims()),
            format!("{dims:?}"),
        ));
    }
    let area = area.to_dtype(tensor.dtype())?;
    let total = area.sum_all()?;
    let weighted = tensor
        .broadcast_mul(&area)?
        .sum(D::Minus1)?
        .sum(D::Minus1)?;
    Ok(weighted.broadcast_div(&total)?)
}

/// Append two unit dims so a global mean broadcasts over the grid.
pub fn expand_to_grid(global: &Tensor) -> StepperResult<Tensor> {
    let rank = global.rank();
    Ok(global.unsqueeze(rank)?.unsqueeze(rank + 1)?)
}

/// Subtract the area-weighted global mean, leaving a zero-mean field.
pub fn remove_global_mean(tensor: &Tensor, area: &Tensor) -> StepperResult<Tensor> {
    let mean = weighted_mean(tensor, area)?;
    Ok(tensor.broadcast_sub(&expand_to_grid(&mean)?)?)
}

fn check_levels(integrand: &Tensor, sigma: &SigmaCoordinates) -> StepperResult<()> {
    let levels = integrand.dims().last().copied().unwrap_or(0);
    if levels != sigma.n_levels() {
        return Err(StepperError::shape_mismatch(
            format!("{} vertical levels", sigma.n_levels()),
            format!("{levels} vertical levels"),
        ));
    }
    Ok(())
}

/// Mass-weighted vertical integral `(1/g) * Σ_k Δp_k * x_k`.
///
/// `Δp_k = Δak_k + Δbk_k * surface_pressure` is the pressure thickness of
/// layer `k`. `integrand` is `(..., level)` and `surface_pressure` is `(...)`.
pub fn vertical_integral(
    integrand: &Tensor,
    surface_pressure: &Tensor,
    sigma: &SigmaCoordinates,
) -> StepperResult<Tensor> {
    check_same_device(integrand, surface_pressure)?;
    check_levels(integrand, sigma)?;
    let (ak_diff, bk_diff) = sigma.diff_tensors(integrand.device(), integrand.dtype())?;
    let surface_pressure = surface_pressure.to_dtype(integrand.dtype())?;
    let thickness = surface_pressure
        .unsqueeze(surface_pressure.rank())?
        .broadcast_mul(&bk_diff)?
        .broadcast_add(&ak_diff)?;
    let integral = thickness.broadcast_mul(integrand)?.sum(D::Minus1)?;
    Ok(integral.affine(1.0 / GRAVITY, 0.0)?)
}

/// Surface pressure exerted by dry air alone (Pa).
pub fn surface_pressure_due_to_dry_air(
    specific_total_water: &Tensor,
    surface_pressure: &Tensor,
    sigma: &SigmaCoordinates,
) -> StepperResult<Tensor> {
    let total_water_path = vertical_integral(specific_total_water, surface_pressure, sigma)?;
    let surface_pressure = surface_pressure.to_dtype(total_water_path.dtype())?;
    Ok((surface_pressure - total_water_path.affine(GRAVITY, 0.0)?)?)
}

/// Net energy flux into the surface, positive downward (W m-2).
///
/// Radiative fluxes count down minus up; latent and sensible heat fluxes
/// leave the surface.
pub fn net_surface_energy_flux(
    lw_down: &Tensor,
    lw_up: &Tensor,
    sw_down: &Tensor,
    sw_up: &Tensor,
    latent_heat_flux: &Tensor,
    sensible_heat_flux: &Tensor,
) -> StepperResult<Tensor> {
    let net = lw_down
        .broadcast_sub(lw_up)?
        .broadcast_add(sw_down)?
        .broadcast_sub(sw_up)?
        .broadcast_sub(latent_heat_flux)?
        .broadcast_sub(sensible_heat_flux)?;
    Ok(net)
}

/// Area weights `cos(lat)` for a regular lat-lon grid, normalized to sum 1.
///
/// Returns a `(lats.len(), num_lon)` f32 tensor.
pub fn spherical_area_weights(
    lats: &[f64],
    num_lon: usize,
    device: &Device,
) -> StepperResult<Tensor> {
    if lats.is_empty() || num_lon == 0 {
        return Err(StepperError::invalid_config("area weights need a non-empty grid"));
    }
    let row: Vec<f64> = lats.iter().map(|lat| lat.to_radians().cos()).collect();
    let total: f64 = row.iter().sum::<f64>() * num_lon as f64;
    let weights: Vec<f32> = row
        .iter()
        .flat_map(|w| std::iter::repeat((w / total) as f32).take(num_lon))
        .collect();
    Ok(Tensor::from_vec(weights, (lats.len(), num_lon), device)?)
}

/// Absolute change of global-mean dry air between consecutive times.
///
/// `specific_total_water` is `(..., time, lat, lon, level)` and
/// `surface_pressure` is `(..., time, lat, lon)`. Leading dims are averaged,
/// giving a `(time - 1,)` tensor.
pub fn dry_air_absolute_differences(
    specific_total_water: &Tensor,
    surface_pressure: &Tensor,
    area: &Tensor,
    sigma: &SigmaCoordinates,
) -> StepperResult<Tensor> {
    let dry_air = surface_pressure_due_to_dry_air(specific_total_water, surface_pressure, sigma)?;
    let global = weighted_mean(&dry_air, area)?;
    let n_times = global.dim(D::Minus1)?;
    if n_times < 2 {
        return Err(StepperError::shape_mismatch(
            "at least 2 timesteps",
            format!("{n_times} timesteps"),
        ));
    }
    let last = global.rank() - 1;
    let later = global.narrow(last, 1, n_times - 1)?;
    let earlier = global.narrow(last, 0, n_times - 1)?;
    let diffs = (later - earlier)?.abs()?;
    Ok(diffs.reshape(((), n_times - 1))?.mean(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn toy_sigma() -> SigmaCoordinates {
        SigmaCoordinates::new(vec![0.0, 500.0, 1000.0], vec![1.0, 0.5, 0.0]).unwrap()
    }

    #[test]
    fn test_weighted_mean_uniform_matches_mean() {
        let device = Device::Cpu;
        let tensor = Tensor::arange(0f32, 24.0, &device)
            .unwrap()
            .reshape((2, 3, 4))
            .unwrap();
        let area = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        let mean = weighted_mean(&tensor, &area).unwrap().to_vec1::<f32>().unwrap();
        assert!((mean[0] - 5.5).abs() < 1e-6);
        assert!((mean[1] - 17.5).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_mean_respects_weights() {
        let device = Device::Cpu;
        let tensor = Tensor::new(&[[1f32, 3.0]], &device).unwrap();
        let area = Tensor::new(&[[3f32, 1.0]], &device).unwrap();
        let mean = weighted_mean(&tensor, &area).unwrap().to_scalar::<f32>().unwrap();
        assert!((mean - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_mean_shape_mismatch() {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        let area = Tensor::ones((4, 3), DType::F32, &device).unwrap();
        let err = weighted_mean(&tensor, &area).unwrap_err();
        assert!(matches!(err, StepperError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_remove_global_mean_is_zero_mean() {
        let device = Device::Cpu;
        let tensor = Tensor::randn(1.0f32, 2.0, (3, 4, 8), &device).unwrap();
        let area = Tensor::rand(0.5f32, 1.5, (4, 8), &device).unwrap();
        let centered = remove_global_mean(&tensor, &area).unwrap();
        let mean = weighted_mean(&centered, &area).unwrap().to_vec1::<f32>().unwrap();
        for m in mean {
            assert!(m.abs() < 1e-5, "mean should vanish, got {m}");
        }
    }

    #[test]
    fn test_vertical_integral_constant_water() {
        // With q = 1 everywhere the integral collapses to (p_top - ps) / g, and
        // the toy grid puts the top interface at 1000 Pa.
        let device = Device::Cpu;
        let ps = Tensor::full(1e5f32, (2, 2), &device).unwrap();
        let q = Tensor::ones((2, 2, 2), DType::F32, &device).unwrap();
        let twp = vertical_integral(&q, &ps, &toy_sigma()).unwrap();
        let expected = ((500.0 - 0.5e5) + (500.0 - 0.5e5)) / GRAVITY;
        for v in twp.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((v as f64 - expected).abs() / expected.abs() < 1e-5);
        }
    }

    #[test]
    fn test_vertical_integral_level_mismatch() {
        let device = Device::Cpu;
        let ps = Tensor::full(1e5f32, (2, 2), &device).unwrap();
        let q = Tensor::ones((2, 2, 3), DType::F32, &device).unwrap();
        assert!(vertical_integral(&q, &ps, &toy_sigma()).is_err());
    }

    #[test]
    fn test_dry_air_without_water_is_surface_pressure() {
        let device = Device::Cpu;
        let ps = Tensor::full(98000f32, (2, 3), &device).unwrap();
        let q = Tensor::zeros((2, 3, 2), DType::F32, &device).unwrap();
        let dry = surface_pressure_due_to_dry_air(&q, &ps, &toy_sigma()).unwrap();
        for v in dry.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((v - 98000.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_net_surface_energy_flux_sign_convention() {
        let device = Device::Cpu;
        let t = |v: f32| Tensor::full(v, (1, 1), &device).unwrap();
        let net = net_surface_energy_flux(&t(300.0), &t(350.0), &t(200.0), &t(20.0), &t(80.0), &t(15.0))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((net[0] - 35.0).abs() < 1e-4);
    }

    #[test]
    fn test_spherical_area_weights() {
        let device = Device::Cpu;
        let weights = spherical_area_weights(&[-60.0, 0.0, 60.0], 4, &device).unwrap();
        assert_eq!(weights.dims(), &[3, 4]);
        let total = weights.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((total - 1.0).abs() < 1e-6);
        let rows = weights.to_vec2::<f32>().unwrap();
        assert!((rows[1][0] - 2.0 * rows[0][0]).abs() < 1e-6);
    }

    #[test]
    fn test_dry_air_absolute_differences() {
        let device = Device::Cpu;
        let sigma = toy_sigma();
        // (sample=2, time=3, lat=2, lon=2)
        let ps_values: Vec<f32> = (0..2)
            .flat_map(|_| [1e5f32, 1e5 + 10.0, 1e5 + 30.0])
            .flat_map(|p| std::iter::repeat(p).take(4))
            .collect();
        let ps = Tensor::from_vec(ps_values, (2, 3, 2, 2), &device).unwrap();
        let q = Tensor::zeros((2, 3, 2, 2, 2), DType::F32, &device).unwrap();
        let area = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        let diffs = dry_air_absolute_differences(&q, &ps, &area, &sigma)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(diffs.len(), 2);
        assert!((diffs[0] - 10.0).abs() < 1e-2);
        assert!((diffs[1] - 20.0).abs() < 1e-2);
    }
}
