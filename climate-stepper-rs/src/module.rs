//! Single-step networks.
//!
//! A step module maps a packed `(sample, channel, lat, lon)` input to a
//! packed output with the same spatial shape. The stepper only depends on
//! [`StepModule`].

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Dropout, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{StepperError, StepperResult};

/// A network advancing packed fields by one step.
pub trait StepModule {
    /// Forward pass. `train` enables dropout.
    fn forward_t(&self, input: &Tensor, train: bool) -> StepperResult<Tensor>;
}

/// Architecture choice for the step module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleSelector {
    /// Stack of same-padded convolutions with GELU.
    Conv {
        /// Channels of the hidden layers
        hidden_channels: usize,
        /// Number of convolutions, at least one
        num_layers: usize,
        /// Odd kernel size
        #[serde(default = "default_kernel_size")]
        kernel_size: usize,
        /// Dropout probability after each activation
        #[serde(default)]
        dropout: f32,
    },
    /// 1x1 convolution mixing channels per grid cell.
    Pointwise,
}

fn default_kernel_size() -> usize {
    3
}

impl Default for ModuleSelector {
    fn default() -> Self {
        Self::Conv {
            hidden_channels: 64,
            num_layers: 4,
            kernel_size: default_kernel_size(),
            dropout: 0.0,
        }
    }
}

impl ModuleSelector {
    /// Small network for tests
    pub fn test() -> Self {
        Self::Conv {
            hidden_channels: 8,
            num_layers: 2,
            kernel_size: 3,
            dropout: 0.0,
        }
    }

    /// Check layer counts, kernel size and dropout range.
    pub fn validate(&self) -> StepperResult<()> {
        if let Self::Conv {
            hidden_channels,
            num_layers,
            kernel_size,
            dropout,
        } = self
        {
            if *num_layers == 0 || *hidden_channels == 0 {
                return Err(StepperError::invalid_config(
                    "conv module needs at least one layer and one hidden channel",
                ));
            }
            if kernel_size % 2 == 0 {
                return Err(StepperError::invalid_config(format!(
                    "kernel_size must be odd, got {kernel_size}"
                )));
            }
            if !(0.0..1.0).contains(dropout) {
                return Err(StepperError::invalid_config(format!(
                    "dropout must be in [0, 1), got {dropout}"
                )));
            }
        }
        Ok(())
    }

    /// Build the network with parameters under `vb`.
    pub fn build(
        &self,
        n_in_channels: usize,
        n_out_channels: usize,
        vb: VarBuilder,
    ) -> StepperResult<Box<dyn StepModule>> {
        self.validate()?;
        let module: Box<dyn StepModule> = match self {
            Self::Conv {
                hidden_channels,
                num_layers,
                kernel_size,
                dropout,
            } => Box::new(ConvNet::new(
                n_in_channels,
                n_out_channels,
                *hidden_channels,
                *num_layers,
                *kernel_size,
                *dropout,
                vb,
            )?),
            Self::Pointwise => Box::new(PointwiseNet::new(n_in_channels, n_out_channels, vb)?),
        };
        Ok(module)
    }
}

/// Same-padded convolution stack.
pub struct ConvNet {
    layers: Vec<Conv2d>,
    dropout: Dropout,
}

impl ConvNet {
    /// Create the stack; parameters are named `layers.{i}`.
    pub fn new(
        n_in_channels: usize,
        n_out_channels: usize,
        hidden_channels: usize,
        num_layers: usize,
        kernel_size: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> StepperResult<Self> {
        let config = Conv2dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_channels = if i == 0 { n_in_channels } else { hidden_channels };
            let out_channels = if i + 1 == num_layers {
                n_out_channels
            } else {
                hidden_channels
            };
            layers.push(conv2d(
                in_channels,
                out_channels,
                kernel_size,
                config,
                vb.pp(format!("layers.{i}")),
            )?);
        }
        Ok(Self {
            layers,
            dropout: Dropout::new(dropout),
        })
    }
}

impl StepModule for ConvNet {
    fn forward_t(&self, input: &Tensor, train: bool) -> StepperResult<Tensor> {
        let last = self.layers.len() - 1;
        let mut hidden = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if i < last {
                hidden = self.dropout.forward(&hidden.gelu()?, train)?;
            }
        }
        Ok(hidden)
    }
}

/// Per-cell linear channel mixer.
pub struct PointwiseNet {
    mixer: Conv2d,
}

impl PointwiseNet {
    /// Create the mixer; parameters are named `mixer`.
    pub fn new(n_in_channels: usize, n_out_channels: usize, vb: VarBuilder) -> StepperResult<Self> {
        let mixer = conv2d(
            n_in_channels,
            n_out_channels,
            1,
            Conv2dConfig::default(),
            vb.pp("mixer"),
        )?;
        Ok(Self { mixer })
    }
}

impl StepModule for PointwiseNet {
    fn forward_t(&self, input: &Tensor, _train: bool) -> StepperResult<Tensor> {
        Ok(self.mixer.forward(input)?)
    }
}
