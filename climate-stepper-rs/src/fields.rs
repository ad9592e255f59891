//! Named field mappings and the axis helpers used to slice them.
//!
//! A [`TensorMap`] is the currency passed between every stage of a rollout:
//! the normalizer, the packers, the corrector and the ocean all consume and
//! produce one.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{StepperError, StepperResult};

/// Mapping from field name to tensor.
pub type TensorMap = HashMap<String, Tensor>;

/// Resolve a possibly negative axis against a tensor rank.
pub fn resolve_axis(axis: isize, rank: usize) -> StepperResult<usize> {
    let resolved = if axis < 0 {
        rank as isize + axis
    } else {
        axis
    };
    if resolved < 0 || resolved >= rank as isize {
        return Err(StepperError::shape_mismatch(
            format!("axis in [-{rank}, {rank})"),
            format!("axis {axis}"),
        ));
    }
    Ok(resolved as usize)
}

/// Select a single index along `axis`, removing that axis.
pub fn select(tensor: &Tensor, axis: usize, index: usize) -> StepperResult<Tensor> {
    Ok(tensor.narrow(axis, index, 1)?.squeeze(axis)?)
}

/// Select `index` along `axis` for each of `names`.
///
/// Fails with [`StepperError::MissingField`] if a name is absent and with
/// [`StepperError::MissingTime`] if the tensor is too short along `axis`.
pub fn select_names<S: AsRef<str>>(
    data: &TensorMap,
    names: &[S],
    axis: usize,
    index: usize,
) -> StepperResult<TensorMap> {
    let mut selected = TensorMap::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        let tensor = data
            .get(name)
            .ok_or_else(|| StepperError::missing_field(name))?;
        if tensor.rank() <= axis || tensor.dim(axis)? <= index {
            return Err(StepperError::MissingTime {
                name: name.to_string(),
                time_index: index,
            });
        }
        selected.insert(name.to_string(), select(tensor, axis, index)?);
    }
    Ok(selected)
}

/// Move every tensor to `device` and cast it to `dtype`.
pub fn to_device(data: &TensorMap, device: &Device, dtype: DType) -> StepperResult<TensorMap> {
    data.iter()
        .map(|(name, tensor)| {
            let moved = tensor.to_device(device)?.to_dtype(dtype)?;
            Ok((name.clone(), moved))
        })
        .collect()
}

/// Detach every tensor from the autograd graph.
pub fn detach(data: TensorMap) -> TensorMap {
    data.into_iter()
        .map(|(name, tensor)| (name, tensor.detach()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_axis() {
        assert_eq!(resolve_axis(-3, 4).unwrap(), 1);
        assert_eq!(resolve_axis(0, 4).unwrap(), 0);
        assert_eq!(resolve_axis(-1, 2).unwrap(), 1);
        assert!(resolve_axis(4, 4).is_err());
        assert!(resolve_axis(-5, 4).is_err());
    }

    #[test]
    fn test_select_names_missing_time() {
        let device = Device::Cpu;
        let mut data = TensorMap::new();
        data.insert(
            "PRESsfc".to_string(),
            Tensor::zeros((2, 3, 4, 5), DType::F32, &device).unwrap(),
        );

        let selected = select_names(&data, &["PRESsfc"], 1, 2).unwrap();
        assert_eq!(selected["PRESsfc"].dims(), &[2, 4, 5]);

        let err = select_names(&data, &["PRESsfc"], 1, 3).unwrap_err();
        assert!(matches!(err, StepperError::MissingTime { time_index: 3, .. }));

        let err = select_names(&data, &["TMP2m"], 1, 0).unwrap_err();
        assert!(err.is_missing_field());
    }
}
