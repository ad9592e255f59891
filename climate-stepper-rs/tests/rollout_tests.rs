//! Integration tests for autoregressive rollouts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use candle_core::{DType, Device, Tensor};
use climate_stepper_rs::metrics::dry_air_absolute_differences;
use climate_stepper_rs::prelude::*;
use climate_stepper_rs::{
    AdamWOptimization, ClimateData, MeanLossAggregator, OceanConfig, OptimizationConfig,
    StepModule,
};

const N_LAT: usize = 4;
const N_LON: usize = 8;

fn toy_sigma() -> SigmaCoordinates {
    SigmaCoordinates::new(vec![0.0, 500.0, 1000.0], vec![1.0, 0.5, 0.0]).unwrap()
}

fn uniform_area() -> Tensor {
    Tensor::ones((N_LAT, N_LON), DType::F32, &Device::Cpu).unwrap()
}

fn batch(n_samples: usize, n_times: usize) -> TensorMap {
    let device = Device::Cpu;
    let shape = (n_samples, n_times, N_LAT, N_LON);
    let mut data = TensorMap::new();
    data.insert(
        "PRESsfc".into(),
        Tensor::rand(9.8e4f32, 1.02e5, shape, &device).unwrap(),
    );
    data.insert(
        "specific_total_water_0".into(),
        Tensor::rand(5e-3f32, 1.5e-2, shape, &device).unwrap(),
    );
    data.insert(
        "specific_total_water_1".into(),
        Tensor::rand(2e-3f32, 8e-3, shape, &device).unwrap(),
    );
    data.insert(
        "DSWRFtoa".into(),
        Tensor::rand(0f32, 600.0, shape, &device).unwrap(),
    );
    data.insert(
        "PRATEsfc".into(),
        Tensor::rand(1e-5f32, 5e-5, shape, &device).unwrap(),
    );
    data
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Copies input channels to output channels and records every input.
struct PersistenceModule {
    /// Input channel feeding each output channel; `None` outputs zeros.
    sources: Vec<Option<usize>>,
    inputs: Rc<RefCell<Vec<Tensor>>>,
}

impl PersistenceModule {
    fn new(config: &StepperConfig) -> (Self, Rc<RefCell<Vec<Tensor>>>) {
        let sources = config
            .out_names
            .iter()
            .map(|name| config.in_names.iter().position(|n| n == name))
            .collect();
        let inputs = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                sources,
                inputs: Rc::clone(&inputs),
            },
            inputs,
        )
    }
}

impl StepModule for PersistenceModule {
    fn forward_t(&self, input: &Tensor, _train: bool) -> StepperResult<Tensor> {
        self.inputs.borrow_mut().push(input.clone());
        let (n_samples, _, n_lat, n_lon) = input.dims4()?;
        let channels = self
            .sources
            .iter()
            .map(|source| match source {
                Some(index) => Ok(input.narrow(1, *index, 1)?),
                None => Ok(Tensor::zeros(
                    (n_samples, 1, n_lat, n_lon),
                    input.dtype(),
                    input.device(),
                )?),
            })
            .collect::<StepperResult<Vec<Tensor>>>()?;
        Ok(Tensor::cat(&channels, 1)?)
    }
}

fn persistence_stepper(config: StepperConfig) -> (SingleModuleStepper, Rc<RefCell<Vec<Tensor>>>) {
    let (module, inputs) = PersistenceModule::new(&config);
    let stepper = SingleModuleStepper::with_module(
        config,
        Box::new(module),
        (N_LAT, N_LON),
        uniform_area(),
        toy_sigma(),
        RunContext::cpu(),
    )
    .unwrap();
    (stepper, inputs)
}

#[test]
fn test_rollout_length_is_steps_plus_one() {
    let config = StepperConfig::test();
    let stepper = SingleModuleStepper::new(
        config,
        (N_LAT, N_LON),
        uniform_area(),
        toy_sigma(),
        RunContext::cpu(),
    )
    .unwrap();
    for n_steps in [1usize, 3] {
        let data = batch(2, n_steps + 1);
        let stepped = stepper
            .run_on_batch(&data, &mut NullOptimization, n_steps, None)
            .unwrap();
        for name in &stepper.config().out_names {
            assert_eq!(stepped.gen_data[name].dim(1).unwrap(), n_steps + 1);
        }
        let step_losses = stepped
            .metrics
            .keys()
            .filter(|key| key.starts_with("loss_step_"))
            .count();
        assert_eq!(step_losses, n_steps);
    }
}

#[test]
fn test_forcing_comes_from_data() {
    let config = StepperConfig::test();
    let forcing_channel = config
        .in_names
        .iter()
        .position(|name| name == "DSWRFtoa")
        .unwrap();
    let (stepper, inputs) = persistence_stepper(config);
    let data = batch(1, 4);
    stepper
        .run_on_batch(&data, &mut NullOptimization, 3, None)
        .unwrap();

    let inputs = inputs.borrow();
    assert_eq!(inputs.len(), 3);
    for (step, input) in inputs.iter().enumerate() {
        let seen = input.narrow(1, forcing_channel, 1).unwrap().squeeze(1).unwrap();
        let expected = data["DSWRFtoa"]
            .narrow(1, step, 1)
            .unwrap()
            .squeeze(1)
            .unwrap()
            .affine(1.0 / 100.0, -3.0)
            .unwrap();
        assert!(
            max_abs_diff(&seen, &expected) < 1e-5,
            "forcing at step {step} was not taken from the data"
        );
    }
}

#[test]
fn test_predicted_inputs_come_from_model() {
    let (stepper, _) = persistence_stepper(StepperConfig::test());
    let data = batch(1, 3);
    let stepped = stepper
        .run_on_batch(&data, &mut NullOptimization, 2, None)
        .unwrap();

    // persistence keeps the initial pressure, ignoring later data
    let initial = data["PRESsfc"].narrow(1, 0, 1).unwrap();
    for time in 1..3 {
        let generated = stepped.gen_data["PRESsfc"].narrow(1, time, 1).unwrap();
        assert!(max_abs_diff(&generated, &initial) < 0.5);
    }
    // outputs that are not inputs start from zero in normalized space
    let precipitation = stepped.gen_data_norm["PRATEsfc"].narrow(1, 1, 1).unwrap();
    let largest = precipitation
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(largest < 1e-5);
}

#[test]
fn test_dry_air_conserved_over_rollout() {
    let mut config = StepperConfig::test();
    config.corrector.conserve_dry_air = true;
    let stepper = SingleModuleStepper::new(
        config,
        (N_LAT, N_LON),
        uniform_area(),
        toy_sigma(),
        RunContext::cpu(),
    )
    .unwrap();
    let data = batch(2, 4);
    let stepped = stepper
        .run_on_batch(&data, &mut NullOptimization, 3, None)
        .unwrap();

    let view = ClimateData::new(&stepped.gen_data);
    let differences = dry_air_absolute_differences(
        &view.specific_total_water().unwrap(),
        &view.surface_pressure().unwrap(),
        &uniform_area(),
        &toy_sigma(),
    )
    .unwrap()
    .to_vec1::<f32>()
    .unwrap();
    assert_eq!(differences.len(), 3);
    for difference in differences {
        assert!(difference < 1.0, "dry air drifted by {difference} Pa");
    }
}

#[test]
fn test_ocean_prescribes_surface_temperature() {
    let mut config = StepperConfig::test();
    config.in_names.push("surface_temperature".into());
    config.in_names.push("ocean_fraction".into());
    config.out_names.push("surface_temperature".into());
    for (name, mean, std) in [("surface_temperature", 285.0, 15.0), ("ocean_fraction", 0.5, 0.5)] {
        config.normalization.means.insert(name.into(), mean);
        config.normalization.stds.insert(name.into(), std);
    }
    config.ocean = Some(OceanConfig {
        surface_temperature_name: "surface_temperature".into(),
        ocean_fraction_name: "ocean_fraction".into(),
        interpolate: false,
    });
    let (stepper, _) = persistence_stepper(config);

    let device = Device::Cpu;
    let mut data = batch(1, 3);
    data.insert(
        "surface_temperature".into(),
        Tensor::rand(270f32, 300.0, (1, 3, N_LAT, N_LON), &device).unwrap(),
    );
    // western half ocean, eastern half land
    let row: Vec<f32> = (0..N_LON).map(|i| if i < N_LON / 2 { 1.0 } else { 0.0 }).collect();
    let mask: Vec<f32> = row.iter().copied().cycle().take(3 * N_LAT * N_LON).collect();
    data.insert(
        "ocean_fraction".into(),
        Tensor::from_vec(mask, (1, 3, N_LAT, N_LON), &device).unwrap(),
    );

    let stepped = stepper
        .run_on_batch(&data, &mut NullOptimization, 2, None)
        .unwrap();
    let generated = &stepped.gen_data["surface_temperature"];
    let ocean = N_LON / 2;
    for time in 1..3 {
        let gen_ocean = generated.narrow(1, time, 1).unwrap().narrow(3, 0, ocean).unwrap();
        let target_ocean = data["surface_temperature"]
            .narrow(1, time, 1)
            .unwrap()
            .narrow(3, 0, ocean)
            .unwrap();
        assert!(max_abs_diff(&gen_ocean, &target_ocean) < 1e-3);

        // land keeps the persisted initial value
        let gen_land = generated.narrow(1, time, 1).unwrap().narrow(3, ocean, ocean).unwrap();
        let initial_land = data["surface_temperature"]
            .narrow(1, 0, 1)
            .unwrap()
            .narrow(3, ocean, ocean)
            .unwrap();
        assert!(max_abs_diff(&gen_land, &initial_land) < 1e-3);
    }
}

#[test]
fn test_ensemble_members_share_persistence() {
    let mut config = StepperConfig::test();
    config.n_ensemble_members = 2;
    let (stepper, _) = persistence_stepper(config);
    let data = batch(2, 3);
    let stepped = stepper
        .run_on_batch(&data, &mut NullOptimization, 2, None)
        .unwrap();
    let pressure = &stepped.gen_data["PRESsfc"];
    assert_eq!(pressure.dims(), &[2, 2, 3, N_LAT, N_LON]);
    let first = pressure.narrow(0, 0, 1).unwrap();
    let second = pressure.narrow(0, 1, 1).unwrap();
    assert_eq!(max_abs_diff(&first, &second), 0.0);
    assert!(stepped.is_ensemble());
}

/// Persistence shifted by +1 and -1 on alternating calls.
struct AlternatingModule {
    persistence: PersistenceModule,
    calls: Cell<usize>,
}

impl StepModule for AlternatingModule {
    fn forward_t(&self, input: &Tensor, train: bool) -> StepperResult<Tensor> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        let shift = if call % 2 == 0 { 1.0 } else { -1.0 };
        Ok(self.persistence.forward_t(input, train)?.affine(1.0, shift)?)
    }
}

fn mse_at(gen: &TensorMap, target: &TensorMap, names: &[String], time: usize) -> f32 {
    let total: f32 = names
        .iter()
        .map(|name| {
            let gen = gen[name].narrow(1, time, 1).unwrap();
            let target = target[name].narrow(1, time, 1).unwrap();
            (gen - target)
                .unwrap()
                .sqr()
                .unwrap()
                .mean_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
        })
        .sum();
    total / names.len() as f32
}

#[test]
fn test_ensemble_mean_drives_rollout_and_loss() {
    let mut config = StepperConfig::test();
    config.n_ensemble_members = 2;
    let out_names = config.out_names.clone();
    let (persistence, inputs) = PersistenceModule::new(&config);
    let module = AlternatingModule {
        persistence,
        calls: Cell::new(0),
    };
    let stepper = SingleModuleStepper::with_module(
        config,
        Box::new(module),
        (N_LAT, N_LON),
        uniform_area(),
        toy_sigma(),
        RunContext::cpu(),
    )
    .unwrap();
    let data = batch(1, 3);
    let stepped = stepper
        .run_on_batch(&data, &mut NullOptimization, 2, None)
        .unwrap();

    // members really differ
    let pressure = &stepped.gen_data_norm["PRESsfc"];
    assert_eq!(pressure.dims(), &[2, 1, 3, N_LAT, N_LON]);
    let spread = (pressure.narrow(0, 0, 1).unwrap() - pressure.narrow(0, 1, 1).unwrap())
        .unwrap()
        .narrow(2, 1, 1)
        .unwrap()
        .mean_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!((spread - 2.0).abs() < 1e-3, "member spread {spread}");

    // the member mean, i.e. plain persistence, feeds step 1
    let inputs = inputs.borrow();
    assert_eq!(inputs.len(), 4);
    let n_predicted = 3;
    let initial = inputs[0].narrow(1, 0, n_predicted).unwrap();
    let next = inputs[2].narrow(1, 0, n_predicted).unwrap();
    assert!(max_abs_diff(&initial, &next) < 1e-3);

    // the step loss is the loss of the mean
    let (reference, _) = persistence_stepper(StepperConfig::test());
    let reference_loss = reference
        .run_on_batch(&data, &mut NullOptimization, 1, None)
        .unwrap()
        .metrics["loss_step_0"];
    let ensemble_loss = stepped.metrics["loss_step_0"];
    assert!(
        (ensemble_loss - reference_loss).abs() < 1e-3 * reference_loss.max(1.0),
        "ensemble loss {ensemble_loss}, mean loss {reference_loss}"
    );
    let member_losses: Vec<f32> = (0..2)
        .map(|member| {
            let member_gen: TensorMap = stepped
                .gen_data_norm
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.get(member).unwrap()))
                .collect();
            mse_at(&member_gen, &stepped.target_data_norm, &out_names, 1)
        })
        .collect();
    let largest_gap = member_losses
        .iter()
        .map(|loss| (*loss as f64 - ensemble_loss).abs())
        .fold(0.0, f64::max);
    assert!(largest_gap >= 0.5, "member losses {member_losses:?} match the ensemble");
}

#[test]
fn test_training_step_updates_weights() {
    let stepper = SingleModuleStepper::new(
        StepperConfig::test(),
        (N_LAT, N_LON),
        uniform_area(),
        toy_sigma(),
        RunContext::cpu(),
    )
    .unwrap();
    let mut optimization =
        AdamWOptimization::new(stepper.var_map(), &OptimizationConfig::default()).unwrap();
    let before: Vec<Tensor> = stepper
        .var_map()
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().copy().unwrap())
        .collect();

    let data = batch(2, 3);
    let mut aggregator = MeanLossAggregator::new();
    stepper
        .run_on_batch(&data, &mut optimization, 2, Some(&mut aggregator as &mut dyn Aggregator))
        .unwrap();

    assert_eq!(optimization.steps(), 1);
    assert_eq!(aggregator.n_batches(), 1);
    let changed = stepper
        .var_map()
        .all_vars()
        .iter()
        .zip(before.iter())
        .any(|(var, old)| max_abs_diff(var.as_tensor(), old) > 0.0);
    assert!(changed, "no weight changed after a training step");
}
