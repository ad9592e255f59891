//! CLI entry point for climate-stepper.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use climate_stepper_rs::{run_inference, InferenceConfig, RunContext, StepperConfig, StepperResult};

#[derive(Parser)]
#[command(name = "climate-stepper")]
#[command(about = "Autoregressive climate emulator with physical corrections")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stepper configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample stepper configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "stepper.yaml")]
        output: String,
    },
    /// Roll out a stepper over a batch
    Inference {
        /// Path to inference configuration file
        config: String,
    },
}

fn main() -> StepperResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = StepperConfig::from_file(&config)?;
            println!("✓ Configuration is valid");
            println!("  Inputs: {}", config.in_names.join(", "));
            println!("  Outputs: {}", config.out_names.join(", "));
            println!("  Forcings: {}", config.forcing_names().join(", "));
            println!("  Corrector: {:?}", config.corrector);
        }
        Commands::Init { output } => {
            tracing::info!("Generating sample config: {}", output);
            StepperConfig::test().to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Inference { config } => {
            tracing::info!("Running inference with config: {}", config);
            let config = InferenceConfig::from_file(&config)?;
            let context = RunContext::from_env(candle_core::Device::Cpu)?;
            let summary = run_inference(&config, context)?;
            if let Some(loss) = summary.metrics.get("loss") {
                println!("  Loss: {loss}");
            }
            println!("✓ Generated fields written to: {}", summary.output_path.display());
        }
    }

    Ok(())
}
