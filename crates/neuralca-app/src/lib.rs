//! Headless harness for the neural CA engine: model and config loading,
//! scripted paint strokes and PNG frame output.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use neuralca_core::{
    Brush, Device, Engine, EngineConfig, FixedTicks, Frame, LayerParams, RunSummary, Scheduler,
    Throttle, VisMode, read_model,
};
use tracing::info;

/// One scripted `paint` call applied before the run starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintStroke {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub brush: Brush,
}

impl FromStr for PaintStroke {
    type Err = String;

    /// Parses `x,y,radius,brush`, e.g. `40,40,8,clear`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, radius, brush] = parts.as_slice() else {
            return Err(format!("expected x,y,radius,brush but got `{s}`"));
        };
        let number = |field: &str, value: &str| {
            value
                .parse::<f32>()
                .map_err(|err| format!("invalid {field} `{value}`: {err}"))
        };
        Ok(Self {
            x: number("x", x)?,
            y: number("y", y)?,
            radius: number("radius", radius)?,
            brush: brush.parse()?,
        })
    }
}

/// Everything `neuralca run` needs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub model: PathBuf,
    pub config: EngineConfig,
    pub frames: u64,
    pub throttle: bool,
    pub vis: VisMode,
    pub out_dir: Option<PathBuf>,
    /// Write every `every`-th frame (1 = all).
    pub every: u64,
    pub paints: Vec<PaintStroke>,
}

/// Read a model file (JSON array of layer entries).
pub fn load_model(path: &Path) -> Result<Vec<LayerParams>> {
    let file = File::open(path).with_context(|| format!("failed to open model {}", path.display()))?;
    let layers = read_model(BufReader::new(file))
        .with_context(|| format!("failed to read model {}", path.display()))?;
    Ok(layers)
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u64>,
    pub update_probability: Option<f32>,
    pub benchmark_steps: Option<u32>,
}

impl ConfigOverrides {
    /// Merge into `config` and re-validate.
    pub fn apply(&self, mut config: EngineConfig) -> Result<EngineConfig> {
        if let Some(width) = self.width {
            config.grid_width = width;
        }
        if let Some(height) = self.height {
            config.grid_height = height;
        }
        if self.seed.is_some() {
            config.rng_seed = self.seed;
        }
        if let Some(probability) = self.update_probability {
            config.update_probability = probability;
        }
        if let Some(steps) = self.benchmark_steps {
            config.benchmark_steps = steps;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Read an engine config file, or fall back to defaults.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Create an engine from a model file.
pub fn build_engine(model: &Path, config: EngineConfig) -> Result<Engine> {
    let layers = load_model(model)?;
    let engine = Engine::new(&Device::new(), &layers, config)
        .with_context(|| format!("failed to initialise engine from {}", model.display()))?;
    Ok(engine)
}

/// Save a frame as PNG.
pub fn write_frame(path: &Path, frame: &Frame) -> Result<()> {
    image::save_buffer_with_format(
        path,
        &frame.pixels,
        frame.width,
        frame.height,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .with_context(|| format!("failed to write frame {}", path.display()))
}

/// Headless run: paint, then step and draw once per tick.
pub fn run(options: &RunOptions) -> Result<RunSummary> {
    if options.every == 0 {
        bail!("--every must be at least 1");
    }
    let throttle_budget = Duration::from_millis(options.config.throttle_frame_ms);
    let mut engine = build_engine(&options.model, options.config.clone())?;
    for stroke in &options.paints {
        engine.paint(stroke.x, stroke.y, stroke.radius, stroke.brush);
    }
    if let Some(dir) = &options.out_dir {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let throttle = if options.throttle {
        Throttle::new(true, throttle_budget)
    } else {
        Throttle::disabled()
    };
    let mut scheduler = Scheduler::new(FixedTicks::new(options.frames), throttle, options.vis);
    let summary = scheduler.run(&mut engine, |index, frame| {
        let Some(dir) = &options.out_dir else {
            return Ok(());
        };
        if index % options.every != 0 {
            return Ok(());
        }
        write_frame(&frame_path(dir, options.vis, index), frame)
    })?;
    info!(
        frames = summary.frames,
        steps = summary.steps,
        fps = %engine.fps(),
        "run complete"
    );
    Ok(summary)
}

/// `<dir>/<mode>_<index>.png` with a zero-padded index.
#[must_use]
pub fn frame_path(dir: &Path, mode: VisMode, index: u64) -> PathBuf {
    dir.join(format!("{mode}_{index:06}.png"))
}

/// Run the engine benchmark and return its report text.
pub fn benchmark(model: &Path, config: EngineConfig) -> Result<String> {
    let mut engine = build_engine(model, config)?;
    Ok(engine.benchmark().to_string())
}

/// One line per layer: shape and quantisation scales.
#[must_use]
pub fn describe_model(layers: &[LayerParams]) -> String {
    layers
        .iter()
        .enumerate()
        .map(|(index, layer)| {
            format!(
                "layer {index}: {} -> {} channels, weight_scale {:.4}, bias_scale {:.4}, {} bytes",
                layer.in_ch,
                layer.out_ch,
                layer.weight_scale,
                layer.bias_scale,
                layer.expected_len()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paint_strokes() {
        let stroke: PaintStroke = "40, 12.5, 8, clear".parse().expect("stroke");
        assert_eq!(
            stroke,
            PaintStroke {
                x: 40.0,
                y: 12.5,
                radius: 8.0,
                brush: Brush::Clear,
            }
        );
        assert!("1,2,3".parse::<PaintStroke>().is_err());
        assert!("1,2,x,seed".parse::<PaintStroke>().is_err());
        assert!("1,2,3,spray".parse::<PaintStroke>().is_err());
    }

    #[test]
    fn overrides_win_over_config() {
        let overrides = ConfigOverrides {
            width: Some(24),
            seed: Some(9),
            ..ConfigOverrides::default()
        };
        let config = overrides.apply(EngineConfig::default()).expect("config");
        assert_eq!(config.grid_width, 24);
        assert_eq!(config.grid_height, 96);
        assert_eq!(config.rng_seed, Some(9));

        let bad = ConfigOverrides {
            update_probability: Some(2.0),
            ..ConfigOverrides::default()
        };
        assert!(bad.apply(EngineConfig::default()).is_err());
    }

    #[test]
    fn frame_paths_are_sortable() {
        let path = frame_path(Path::new("out"), VisMode::MaskedUpdate, 42);
        assert_eq!(path, Path::new("out").join("maskedUpdate_000042.png"));
    }

    #[test]
    fn describes_layers() {
        let layer = LayerParams::from_bytes(&[0; 4 * 4 * 17], 0.5, 0.25, 16, 16);
        let text = describe_model(&[layer]);
        assert_eq!(
            text,
            "layer 0: 16 -> 16 channels, weight_scale 0.5000, bias_scale 0.2500, 272 bytes"
        );
    }
}
