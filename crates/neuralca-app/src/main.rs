use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use neuralca_app::{ConfigOverrides, PaintStroke, RunOptions};
use neuralca_core::VisMode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "neuralca",
    version,
    about = "Run pretrained neural cellular automata headlessly"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Model file: JSON array of quantised dense layers.
    #[arg(long, env = "NEURALCA_MODEL")]
    model: PathBuf,
    /// Optional JSON engine config; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Grid width in cells.
    #[arg(long)]
    width: Option<u32>,
    /// Grid height in cells.
    #[arg(long)]
    height: Option<u32>,
    /// Seed for reproducible dropout masks.
    #[arg(long)]
    seed: Option<u64>,
    /// Per-step update probability of each cell.
    #[arg(long)]
    update_probability: Option<f32>,
}

impl EngineArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            width: self.width,
            height: self.height,
            seed: self.seed,
            update_probability: self.update_probability,
            benchmark_steps: None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Step the automaton and optionally dump frames as PNG.
    Run {
        #[command(flatten)]
        engine: EngineArgs,
        /// Number of frames to draw.
        #[arg(long, default_value_t = 100)]
        frames: u64,
        /// Batch extra steps into frames that arrive quickly.
        #[arg(long)]
        throttle: bool,
        /// Tensor to render (color, state, perception, hidden, update, maskedUpdate).
        #[arg(long, default_value_t = VisMode::Color)]
        vis: VisMode,
        /// Directory for PNG frames; nothing is written when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write every K-th frame.
        #[arg(long, default_value_t = 1)]
        every: u64,
        /// Paint stroke `x,y,radius,brush` applied before the run (repeatable).
        #[arg(long = "paint")]
        paints: Vec<PaintStroke>,
    },
    /// Print the per-stage timing report.
    Bench {
        #[command(flatten)]
        engine: EngineArgs,
        /// Steps measured for the whole pipeline and for each stage.
        #[arg(long)]
        steps: Option<u32>,
    },
    /// Print layer shapes and quantisation scales of a model file.
    Inspect {
        #[arg(long, env = "NEURALCA_MODEL")]
        model: PathBuf,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            engine,
            frames,
            throttle,
            vis,
            out,
            every,
            paints,
        } => {
            let config = engine
                .overrides()
                .apply(neuralca_app::load_config(engine.config.as_deref())?)?;
            let options = RunOptions {
                model: engine.model,
                config,
                frames,
                throttle,
                vis,
                out_dir: out,
                every,
                paints,
            };
            let summary = neuralca_app::run(&options)?;
            println!(
                "{} frames, {} steps (max {} per frame)",
                summary.frames, summary.steps, summary.max_steps_per_frame
            );
        }
        Command::Bench { engine, steps } => {
            let overrides = ConfigOverrides {
                benchmark_steps: steps,
                ..engine.overrides()
            };
            let config = overrides.apply(neuralca_app::load_config(engine.config.as_deref())?)?;
            info!(
                width = config.grid_width,
                height = config.grid_height,
                steps = config.benchmark_steps,
                "benchmarking"
            );
            print!("{}", neuralca_app::benchmark(&engine.model, config)?);
        }
        Command::Inspect { model } => {
            let layers = neuralca_app::load_model(&model)?;
            println!("{}", neuralca_app::describe_model(&layers));
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
