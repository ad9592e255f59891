//! Inference over a batch stored as safetensors.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Tensor};
use tracing::{info, warn};

use crate::aggregator::{Aggregator, MeanLossAggregator};
use crate::config::{InferenceConfig, StepperSource};
use crate::distributed::RunContext;
use crate::error::{StepperError, StepperResult};
use crate::fields::TensorMap;
use crate::metrics::spherical_area_weights;
use crate::optimization::NullOptimization;
use crate::sigma::SigmaCoordinates;
use crate::stepper::SingleModuleStepper;

/// Outcome of an inference run.
#[derive(Debug, Clone)]
pub struct InferenceSummary {
    /// Per-step and total losses
    pub metrics: HashMap<String, f64>,
    /// Aggregated logs
    pub logs: HashMap<String, f64>,
    /// Where generated fields were written
    pub output_path: PathBuf,
}

fn is_sigma_name(name: &str) -> bool {
    ["ak_", "bk_"].iter().any(|prefix| {
        name.strip_prefix(prefix)
            .is_some_and(|level| !level.is_empty() && level.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Split `ak_N`/`bk_N` scalars out of a loaded batch.
pub fn split_sigma_scalars(data: TensorMap) -> StepperResult<(TensorMap, HashMap<String, f64>)> {
    let mut fields = TensorMap::new();
    let mut scalars = HashMap::new();
    for (name, tensor) in data {
        if is_sigma_name(&name) {
            let value = tensor
                .flatten_all()?
                .to_dtype(DType::F64)?
                .to_vec1::<f64>()?;
            match value.as_slice() {
                [value] => {
                    scalars.insert(name, *value);
                }
                _ => {
                    return Err(StepperError::shape_mismatch(
                        format!("a scalar for {name}"),
                        format!("{} values", value.len()),
                    ))
                }
            }
        } else {
            fields.insert(name, tensor);
        }
    }
    Ok((fields, scalars))
}

/// Grid `(lat, lon)` of the batch, read from the field `name`.
fn grid_shape(data: &TensorMap, name: &str) -> StepperResult<(usize, usize)> {
    let tensor = data
        .get(name)
        .ok_or_else(|| StepperError::missing_field(name))?;
    match tensor.dims() {
        [.., n_lat, n_lon] if tensor.rank() >= 4 => Ok((*n_lat, *n_lon)),
        dims => Err(StepperError::shape_mismatch(
            "(sample, time, lat, lon)",
            format!("{dims:?}"),
        )),
    }
}

/// Inference settings that a checkpoint overrides.
fn ignored_by_checkpoint(config: &InferenceConfig) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if matches!(config.stepper, StepperSource::Existing { .. }) {
        if config.sigma_coordinates.is_some() {
            ignored.push("sigma_coordinates");
        }
        if config.lats.is_some() {
            ignored.push("lats");
        }
    }
    ignored
}

fn build_stepper(
    config: &InferenceConfig,
    data: &TensorMap,
    sigma_scalars: &HashMap<String, f64>,
    context: RunContext,
) -> StepperResult<SingleModuleStepper> {
    match &config.stepper {
        StepperSource::Existing { checkpoint_path } => {
            let ignored = ignored_by_checkpoint(config);
            if !ignored.is_empty() {
                warn!(
                    ?ignored,
                    "settings are ignored when loading a checkpoint; its stored values are used"
                );
            }
            SingleModuleStepper::load(checkpoint_path, context)
        }
        StepperSource::Config(stepper_config) => {
            let first_input = stepper_config
                .in_names
                .first()
                .ok_or_else(|| StepperError::invalid_config("in_names must not be empty"))?;
            let img_shape = grid_shape(data, first_input)?;
            let sigma = match &config.sigma_coordinates {
                Some(sigma) => sigma.clone(),
                None => SigmaCoordinates::from_indexed(sigma_scalars)?,
            };
            let area = match &config.lats {
                Some(lats) => {
                    if lats.len() != img_shape.0 {
                        return Err(StepperError::shape_mismatch(
                            format!("{} latitudes", img_shape.0),
                            format!("{} latitudes", lats.len()),
                        ));
                    }
                    spherical_area_weights(lats, img_shape.1, context.device())?
                }
                None => Tensor::ones(img_shape, DType::F32, context.device())?,
            };
            SingleModuleStepper::new(
                stepper_config.as_ref().clone(),
                img_shape,
                area,
                sigma,
                context,
            )
        }
    }
}

/// Roll out the configured stepper and write the generated fields.
pub fn run_inference(config: &InferenceConfig, context: RunContext) -> StepperResult<InferenceSummary> {
    config.validate()?;
    info!(path = %config.data_path.display(), "loading batch");
    let raw = candle_core::safetensors::load(&config.data_path, context.device())?;
    let (data, sigma_scalars) = split_sigma_scalars(raw)?;

    let stepper = build_stepper(config, &data, &sigma_scalars, context)?;
    let requirements = stepper.data_requirements(config.n_forward_steps);
    let missing: Vec<&String> = requirements
        .names
        .iter()
        .filter(|name| !data.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        info!(?missing, "batch lacks some fields; outputs without targets get NaN loss");
    }

    let mut aggregator = MeanLossAggregator::new();
    let stepped = stepper.run_on_batch(
        &data,
        &mut NullOptimization,
        config.n_forward_steps,
        Some(&mut aggregator as &mut dyn Aggregator),
    )?;
    for step in 0..config.n_forward_steps {
        if let Some(loss) = stepped.metrics.get(&format!("loss_step_{step}")) {
            info!(step, loss, "step loss");
        }
    }

    if stepper.context().is_root() {
        if let Some(parent) = config.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        candle_core::safetensors::save(&stepped.gen_data, &config.output_path)?;
        info!(path = %config.output_path.display(), "wrote generated fields");
    }

    Ok(InferenceSummary {
        metrics: stepped.metrics,
        logs: aggregator.get_logs("inference"),
        output_path: config.output_path.clone(),
    })
}
