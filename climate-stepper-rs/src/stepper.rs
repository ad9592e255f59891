//! Autoregressive rollout of a single step module.
//!
//! Each forward step runs a fixed pipeline:
//!
//! 1. pack the normalized input fields into channels
//! 2. run the network, unpack and denormalize its output
//! 3. apply the corrector against the denormalized input
//! 4. prescribe ocean fields from the data at the next time
//! 5. renormalize, compute the step loss and build the next input
//!
//! The next input takes every predicted field from the output and every
//! other input ("forcing") from the data at the next time.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use crate::aggregator::{Aggregator, NullAggregator};
use crate::config::{DataRequirements, StepperConfig};
use crate::corrector::Corrector;
use crate::distributed::RunContext;
use crate::error::{StepperError, StepperResult};
use crate::fields::{detach, select, select_names, to_device, TensorMap};
use crate::loss::{ConservationLoss, StepLoss};
use crate::module::StepModule;
use crate::normalizer::{Normalize, StandardNormalizer};
use crate::ocean::{BoundaryCondition, Ocean};
use crate::optimization::Optimization;
use crate::packer::Packer;
use crate::sigma::SigmaCoordinates;

/// Channel axis of packed `(..., channel, lat, lon)` tensors.
pub const CHANNEL_AXIS: isize = -3;

/// Time axis of `(sample, time, ...)` batch tensors.
pub const TIME_AXIS: usize = 1;

/// Result of stepping one batch.
///
/// Generated fields include the initial condition at time 0. With more
/// than one ensemble member they carry a leading member axis,
/// `(member, sample, time, ...)`.
#[derive(Debug, Clone)]
pub struct SteppedData {
    /// Per-step and total losses plus conservation metrics
    pub metrics: HashMap<String, f64>,
    /// Denormalized generated timeseries
    pub gen_data: TensorMap,
    /// Denormalized batch
    pub target_data: TensorMap,
    /// Normalized generated timeseries
    pub gen_data_norm: TensorMap,
    /// Normalized batch
    pub target_data_norm: TensorMap,
}

impl SteppedData {
    /// True if generated fields carry a member axis the targets lack.
    pub fn is_ensemble(&self) -> bool {
        self.gen_data.iter().any(|(name, gen)| {
            self.target_data
                .get(name)
                .is_some_and(|target| gen.rank() == target.rank() + 1)
        })
    }

    /// Drop time 0 from every generated and target field.
    pub fn remove_initial_condition(&self) -> StepperResult<Self> {
        let gen_axis = if self.is_ensemble() {
            TIME_AXIS + 1
        } else {
            TIME_AXIS
        };
        Ok(Self {
            metrics: self.metrics.clone(),
            gen_data: drop_first(&self.gen_data, gen_axis)?,
            target_data: drop_first(&self.target_data, TIME_AXIS)?,
            gen_data_norm: drop_first(&self.gen_data_norm, gen_axis)?,
            target_data_norm: drop_first(&self.target_data_norm, TIME_AXIS)?,
        })
    }

    /// Stack several results along a new axis `dim`. Metrics are dropped.
    pub fn stack(list: &[SteppedData], dim: usize) -> StepperResult<Self> {
        if list.is_empty() {
            return Err(StepperError::invalid_config("cannot stack an empty list"));
        }
        Ok(Self {
            metrics: HashMap::new(),
            gen_data: stack_maps(list, dim, |d| &d.gen_data)?,
            target_data: stack_maps(list, dim, |d| &d.target_data)?,
            gen_data_norm: stack_maps(list, dim, |d| &d.gen_data_norm)?,
            target_data_norm: stack_maps(list, dim, |d| &d.target_data_norm)?,
        })
    }
}

fn stack_maps(
    list: &[SteppedData],
    dim: usize,
    pick: fn(&SteppedData) -> &TensorMap,
) -> StepperResult<TensorMap> {
    let names = list.first().map(|first| pick(first).keys()).into_iter().flatten();
    names
        .map(|name| {
            let tensors = list
                .iter()
                .map(|item| {
                    pick(item)
                        .get(name)
                        .ok_or_else(|| StepperError::missing_field(name.as_str()))
                })
                .collect::<StepperResult<Vec<&Tensor>>>()?;
            Ok((name.clone(), Tensor::stack(&tensors, dim)?))
        })
        .collect()
}

fn drop_first(data: &TensorMap, axis: usize) -> StepperResult<TensorMap> {
    data.iter()
        .map(|(name, tensor)| {
            let len = tensor.dim(axis)?;
            if len == 0 {
                return Err(StepperError::MissingTime {
                    name: name.clone(),
                    time_index: 0,
                });
            }
            Ok((name.clone(), tensor.narrow(axis, 1, len - 1)?))
        })
        .collect()
}

/// Stepper for a single network.
pub struct SingleModuleStepper {
    config: StepperConfig,
    in_packer: Packer,
    out_packer: Packer,
    normalizer: StandardNormalizer,
    ocean: Option<Ocean>,
    module: Box<dyn StepModule>,
    var_map: VarMap,
    img_shape: (usize, usize),
    area: Tensor,
    sigma: SigmaCoordinates,
    loss: StepLoss,
    conservation_loss: ConservationLoss,
    corrector: Option<Corrector>,
    context: RunContext,
}

impl SingleModuleStepper {
    /// Build a stepper with freshly initialized weights, or with the weights
    /// at `config.base_weights_path` when set.
    ///
    /// `area` is a `(lat, lon)` tensor of relative cell areas in any units.
    pub fn new(
        config: StepperConfig,
        img_shape: (usize, usize),
        area: Tensor,
        sigma: SigmaCoordinates,
        context: RunContext,
    ) -> StepperResult<Self> {
        let normalizer = config.normalization.build(&config.normalize_names())?;
        let base_weights = config.base_weights_path.clone();
        let mut stepper =
            Self::with_normalizer(config, normalizer, img_shape, area, sigma, context)?;
        if let Some(path) = base_weights {
            if !path.exists() {
                return Err(StepperError::checkpoint(format!(
                    "base weights not found: {}",
                    path.display()
                )));
            }
            stepper.var_map.load(&path)?;
            info!(path = %path.display(), "initialized from base weights");
        }
        Ok(stepper)
    }

    /// Build a stepper with explicit normalization statistics.
    pub fn with_normalizer(
        config: StepperConfig,
        normalizer: StandardNormalizer,
        img_shape: (usize, usize),
        area: Tensor,
        sigma: SigmaCoordinates,
        context: RunContext,
    ) -> StepperResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, context.device());
        let module = config
            .builder
            .build(config.in_names.len(), config.out_names.len(), vb)?;
        Self::assemble(config, normalizer, module, var_map, img_shape, area, sigma, context)
    }

    /// Build a stepper around an existing network.
    ///
    /// The network's weights are not tracked, so [`SingleModuleStepper::var_map`]
    /// is empty.
    pub fn with_module(
        config: StepperConfig,
        module: Box<dyn StepModule>,
        img_shape: (usize, usize),
        area: Tensor,
        sigma: SigmaCoordinates,
        context: RunContext,
    ) -> StepperResult<Self> {
        let normalizer = config.normalization.build(&config.normalize_names())?;
        Self::assemble(
            config,
            normalizer,
            module,
            VarMap::new(),
            img_shape,
            area,
            sigma,
            context,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: StepperConfig,
        normalizer: StandardNormalizer,
        module: Box<dyn StepModule>,
        var_map: VarMap,
        img_shape: (usize, usize),
        area: Tensor,
        sigma: SigmaCoordinates,
        context: RunContext,
    ) -> StepperResult<Self> {
        config.validate()?;
        if area.dims() != [img_shape.0, img_shape.1] {
            return Err(StepperError::shape_mismatch(
                format!("area of shape {img_shape:?}"),
                format!("{:?}", area.dims()),
            ));
        }
        let area = area.to_device(context.device())?.to_dtype(DType::F32)?;
        let in_packer = Packer::new(config.in_names.clone(), CHANNEL_AXIS);
        let out_packer = Packer::new(config.out_names.clone(), CHANNEL_AXIS);
        let ocean = config
            .ocean
            .as_ref()
            .map(|ocean| ocean.build(&config.out_names))
            .transpose()?;
        let loss = config.loss.build(&area)?;
        let conservation_loss = config.conservation_loss.build(&area, &sigma)?;
        let corrector = if config.corrector.is_active() {
            Some(config.corrector.build(&area, &sigma, config.timestep_seconds)?)
        } else {
            None
        };

        info!(
            n_in_channels = config.in_names.len(),
            n_out_channels = config.out_names.len(),
            n_levels = sigma.n_levels(),
            ?img_shape,
            rank = context.rank(),
            "built single-module stepper"
        );

        Ok(Self {
            config,
            in_packer,
            out_packer,
            normalizer,
            ocean,
            module,
            var_map,
            img_shape,
            area,
            sigma,
            loss,
            conservation_loss,
            corrector,
            context,
        })
    }

    pub fn config(&self) -> &StepperConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &StandardNormalizer {
        &self.normalizer
    }

    /// Trainable variables.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Mutable variables, for restoring weights.
    pub fn var_map_mut(&mut self) -> &mut VarMap {
        &mut self.var_map
    }

    pub fn img_shape(&self) -> (usize, usize) {
        self.img_shape
    }

    pub fn area(&self) -> &Tensor {
        &self.area
    }

    pub fn sigma_coordinates(&self) -> &SigmaCoordinates {
        &self.sigma
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Data needed to roll out `n_forward_steps` steps.
    pub fn data_requirements(&self, n_forward_steps: usize) -> DataRequirements {
        self.config.data_requirements(n_forward_steps)
    }

    /// Roll the network forward `n_forward_steps` steps over `data`.
    ///
    /// `data` holds denormalized `(sample, time, lat, lon)` tensors with at
    /// least `n_forward_steps + 1` times for every forcing field. Fields are
    /// moved to the stepper's device as `f32`.
    ///
    /// # Errors
    /// Fails if an input is neither predicted nor present in the data at a
    /// step, or if any correction stage misses a field.
    pub fn run_on_batch(
        &self,
        data: &TensorMap,
        optimization: &mut dyn Optimization,
        n_forward_steps: usize,
        aggregator: Option<&mut dyn Aggregator>,
    ) -> StepperResult<SteppedData> {
        let mut null_aggregator = NullAggregator;
        let aggregator: &mut dyn Aggregator = match aggregator {
            Some(aggregator) => aggregator,
            None => &mut null_aggregator,
        };

        let device = self.context.device();
        let data = to_device(data, device, DType::F32)?;
        // Fields without statistics (e.g. ocean masks) are only read denormalized.
        let normalizable: TensorMap = data
            .iter()
            .filter(|(name, _)| self.normalizer.contains(name))
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect();
        let full_data_norm = self.normalizer.normalize(&normalizable)?;
        let full_target_norm = self
            .out_packer
            .pack_if_available(&full_data_norm, CHANNEL_AXIS)?;

        let training = optimization.is_training();
        let dropout_active = training || self.config.enable_inference_dropout;
        let n_members = self.config.n_ensemble_members;

        let mut loss = Tensor::zeros((), DType::F32, device)?;
        let mut metrics = HashMap::new();
        let mut input_norm = select_names(&full_data_norm, self.in_packer.names(), TIME_AXIS, 0)?;
        let mut gen_steps: Vec<TensorMap> = Vec::with_capacity(n_forward_steps + 1);

        for step in 0..n_forward_steps {
            let input_tensor = self.in_packer.pack(&input_norm)?;
            let input_data = self.normalizer.denormalize(&input_norm)?;
            let target_tensor = match &full_target_norm {
                Some(full) if full.dim(TIME_AXIS)? > step + 1 => {
                    Some(select(full, TIME_AXIS, step + 1)?)
                }
                _ => None,
            };

            let mut members = Vec::with_capacity(n_members);
            for _ in 0..n_members {
                members.push(self.step_member(&input_tensor, &input_data, &data, step, dropout_active)?);
            }
            let (gen_norm, stored) = if n_members == 1 {
                let gen_norm = members.remove(0);
                (gen_norm.clone(), gen_norm)
            } else {
                ensemble_mean(&members)?
            };

            let step_loss = match &target_tensor {
                Some(target) => {
                    let gen_tensor = self.out_packer.pack(&gen_norm)?;
                    self.loss.compute(&gen_tensor, target)?
                }
                None => Tensor::new(f32::NAN, device)?,
            };
            let step_loss_value = scalar(&step_loss)?;
            debug!(step, loss = step_loss_value, "forward step");
            metrics.insert(format!("loss_step_{step}"), step_loss_value);
            loss = (loss + step_loss)?;

            let (gen_norm, stored) = if training {
                (gen_norm, stored)
            } else {
                (detach(gen_norm), detach(stored))
            };
            gen_steps.push(stored);

            let forcing_names: Vec<&String> = self
                .in_packer
                .names()
                .iter()
                .filter(|name| !gen_norm.contains_key(*name))
                .collect();
            let mut next_input = select_names(&full_data_norm, &forcing_names, TIME_AXIS, step + 1)?;
            next_input.extend(gen_norm);
            input_norm = next_input;
        }

        let initial = self.initial_condition(&full_data_norm, gen_steps.first())?;
        gen_steps.insert(0, initial);

        let time_axis = if n_members > 1 { TIME_AXIS + 1 } else { TIME_AXIS };
        let gen_data_norm = self
            .out_packer
            .names()
            .iter()
            .map(|name| {
                let tensors = gen_steps
                    .iter()
                    .map(|step| {
                        step.get(name)
                            .ok_or_else(|| StepperError::missing_field(name.as_str()))
                    })
                    .collect::<StepperResult<Vec<&Tensor>>>()?;
                Ok((name.clone(), Tensor::stack(&tensors, time_axis)?))
            })
            .collect::<StepperResult<TensorMap>>()?;
        let gen_data = self.normalizer.denormalize(&gen_data_norm)?;

        let (conservation_metrics, conservation_loss) = self.conservation_loss.compute(&gen_data)?;
        metrics.extend(conservation_metrics);
        let loss = (loss + conservation_loss)?;
        let loss_value = scalar(&loss)?;
        metrics.insert("loss".to_string(), loss_value);

        optimization.step_weights(&loss)?;
        aggregator.record_batch(loss_value, &data, &gen_data, &full_data_norm, &gen_data_norm)?;

        Ok(SteppedData {
            metrics,
            gen_data,
            target_data: data,
            gen_data_norm,
            target_data_norm: full_data_norm,
        })
    }

    /// Normalized outputs at time 0, laid out like `first_step`.
    ///
    /// Outputs absent from the data (diagnostics in pure inference) have no
    /// initial value and are filled with NaN.
    fn initial_condition(
        &self,
        data_norm: &TensorMap,
        first_step: Option<&TensorMap>,
    ) -> StepperResult<TensorMap> {
        let n_members = self.config.n_ensemble_members;
        let mut initial = TensorMap::new();
        for name in self.out_packer.names() {
            let value = match (data_norm.get(name), first_step.and_then(|s| s.get(name))) {
                (Some(tensor), _) => {
                    let value = select(tensor, TIME_AXIS, 0)?;
                    if n_members > 1 {
                        Tensor::stack(&vec![&value; n_members], 0)?
                    } else {
                        value
                    }
                }
                (None, Some(generated)) => {
                    Tensor::full(f32::NAN, generated.dims(), generated.device())?
                }
                (None, None) => return Err(StepperError::missing_field(name.as_str())),
            };
            initial.insert(name.clone(), value);
        }
        Ok(initial)
    }

    /// One member's generated fields for the step after `step`, normalized.
    fn step_member(
        &self,
        input_tensor: &Tensor,
        input_data: &TensorMap,
        data: &TensorMap,
        step: usize,
        train: bool,
    ) -> StepperResult<TensorMap> {
        let gen_tensor = self
            .module
            .forward_t(input_tensor, train)?
            .to_dtype(DType::F32)?;
        let gen_norm = self.out_packer.unpack(&gen_tensor)?;
        let mut gen_data = self.normalizer.denormalize(&gen_norm)?;
        if let Some(corrector) = &self.corrector {
            gen_data = corrector.correct(input_data, gen_data)?;
        }
        if let Some(ocean) = &self.ocean {
            let target = select_names(data, &ocean.target_names(), TIME_AXIS, step + 1)?;
            gen_data = ocean.prescribe(&target, input_data, gen_data)?;
        }
        self.normalizer.normalize(&gen_data)
    }
}

fn scalar(tensor: &Tensor) -> StepperResult<f64> {
    Ok(tensor.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Member mean and member-stacked fields of an ensemble step.
fn ensemble_mean(members: &[TensorMap]) -> StepperResult<(TensorMap, TensorMap)> {
    let mut mean = TensorMap::new();
    let mut stacked = TensorMap::new();
    for name in members[0].keys() {
        let tensors: Vec<&Tensor> = members.iter().map(|member| &member[name]).collect();
        let stack = Tensor::stack(&tensors, 0)?;
        mean.insert(name.clone(), stack.mean(0)?);
        stacked.insert(name.clone(), stack);
    }
    Ok((mean, stacked))
}
