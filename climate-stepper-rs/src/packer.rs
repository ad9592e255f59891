//! Packing named fields into a single channel tensor and back.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{StepperError, StepperResult};
use crate::fields::{resolve_axis, select, TensorMap};

/// Stacks a fixed, ordered list of fields along a new axis.
///
/// The name order is the channel order seen by the network, so it must not
/// change between packing inputs and unpacking outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packer {
    names: Vec<String>,
    axis: isize,
}

impl Packer {
    /// Create a packer for `names`, stacking along `axis` by default.
    pub fn new(names: Vec<String>, axis: isize) -> Self {
        Self { names, axis }
    }

    /// Declared field names in channel order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Default stacking axis.
    pub fn axis(&self) -> isize {
        self.axis
    }

    /// Number of channels produced by [`Packer::pack`].
    pub fn n_channels(&self) -> usize {
        self.names.len()
    }

    /// Pack along the default axis.
    pub fn pack(&self, fields: &TensorMap) -> StepperResult<Tensor> {
        self.pack_along(fields, self.axis)
    }

    /// Stack the declared fields along a new axis at position `axis`.
    ///
    /// Negative axes count from the end of the packed result, so `-3` puts
    /// channels before a trailing `(lat, lon)` grid.
    ///
    /// # Errors
    /// Fails with [`StepperError::MissingField`] if a declared name is absent.
    pub fn pack_along(&self, fields: &TensorMap, axis: isize) -> StepperResult<Tensor> {
        let tensors = self
            .names
            .iter()
            .map(|name| {
                fields
                    .get(name)
                    .ok_or_else(|| StepperError::missing_field(name.as_str()))
            })
            .collect::<StepperResult<Vec<&Tensor>>>()?;
        let first = tensors
            .first()
            .ok_or_else(|| StepperError::invalid_config("packer has no names"))?;
        let axis = resolve_axis(axis, first.rank() + 1)?;
        Ok(Tensor::stack(&tensors, axis)?)
    }

    /// Pack the declared fields if all of them are present.
    pub fn pack_if_available(&self, fields: &TensorMap, axis: isize) -> StepperResult<Option<Tensor>> {
        if self.names.iter().all(|name| fields.contains_key(name)) {
            self.pack_along(fields, axis).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Unpack along the default axis.
    pub fn unpack(&self, tensor: &Tensor) -> StepperResult<TensorMap> {
        self.unpack_along(tensor, self.axis)
    }

    /// Split `tensor` along `axis` into the declared fields.
    ///
    /// Each field has the shape of `tensor` with `axis` removed.
    pub fn unpack_along(&self, tensor: &Tensor, axis: isize) -> StepperResult<TensorMap> {
        let axis = resolve_axis(axis, tensor.rank())?;
        let n_channels = tensor.dim(axis)?;
        if n_channels != self.names.len() {
            return Err(StepperError::shape_mismatch(
                format!("{} channels along axis {axis}", self.names.len()),
                format!("{n_channels} channels"),
            ));
        }
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| Ok((name.clone(), select(tensor, axis, index)?)))
            .collect()
    }
}
