//! Core compute pipeline for pretrained neural cellular automata.
//!
//! A grid of 16-channel cells is packed into RGBA8 textures owned by a
//! [`Device`]. One [`Engine::step`] runs the fixed kernel sequence
//! perception → dense → dense → dropout → alive-masked update and swaps the
//! double-buffered state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bench;
pub mod device;
pub mod engine;
pub mod kernels;
pub mod scheduler;
pub mod tensor;
pub mod weights;

pub use bench::{BenchmarkReport, FpsMeter, StageTiming};
pub use device::{Device, TextureBuffer};
pub use engine::{Engine, Stage, VisMode};
pub use kernels::{Brush, Dispatch, Frame, KernelKind, VisualizeParams};
pub use scheduler::{FixedTicks, RunSummary, Scheduler, ScriptedTicks, Throttle, TickSource};
pub use tensor::{Activation, PackScaleBias, PackedTensor, TensorId, TensorShape};
pub use weights::{DenseLayer, LayerParams, WeightStore, parse_model, read_model};

/// Number of state channels carried by every cell (RGBA plus 12 hidden).
pub const CHANNEL_N: u32 = 16;
/// Maximum number of packed input groups a dense kernel accumulates over.
pub const MAX_PACKED_DEPTH: u32 = 32;
/// Number of dense layers in the fixed architecture.
pub const LAYER_COUNT: usize = 2;

/// Errors surfaced by the engine and its resources.
#[derive(Debug, Error)]
pub enum NcaError {
    /// Weight blob could not be decoded or does not match its declared shape.
    #[error("malformed weights for layer {layer}: {reason}")]
    MalformedWeights { layer: usize, reason: String },
    /// Dense input exceeds the packed-group cap.
    #[error("dense input depth {depth} exceeds the supported maximum of {max} channels")]
    UnsupportedDepth { depth: u32, max: u32 },
    /// Texture allocation refused by the device.
    #[error("device allocation of {requested} bytes failed ({available} bytes available)")]
    ResourceExhausted { requested: usize, available: usize },
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Model file is not a valid JSON layer list.
    #[error("failed to parse model: {0}")]
    ModelParse(#[from] serde_json::Error),
}

/// Static configuration for an [`Engine`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Grid width in cells.
    pub grid_width: u32,
    /// Grid height in cells.
    pub grid_height: u32,
    /// Width of the hidden dense layer.
    pub hidden_channels: u32,
    /// Probability that a cell applies its update on a given step.
    pub update_probability: f32,
    /// Optional RNG seed for reproducible dropout masks.
    pub rng_seed: Option<u64>,
    /// Steps (and per-stage dispatches) measured by the benchmark.
    pub benchmark_steps: u32,
    /// Sampling window of the steps-per-second meter.
    pub fps_interval_ms: u64,
    /// Frames arriving faster than this earn an extra step under full throttle.
    pub throttle_frame_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grid_width: 96,
            grid_height: 96,
            hidden_channels: 128,
            update_probability: 0.5,
            rng_seed: None,
            benchmark_steps: 100,
            fps_interval_ms: 1_000,
            throttle_frame_ms: 18,
        }
    }
}

impl EngineConfig {
    /// Check ranges the kernels rely on.
    pub fn validate(&self) -> Result<(), NcaError> {
        if self.grid_width < 3 || self.grid_height < 3 {
            return Err(NcaError::InvalidConfig("grid must be at least 3x3 cells"));
        }
        if self.hidden_channels == 0 || !self.hidden_channels.is_multiple_of(4) {
            return Err(NcaError::InvalidConfig(
                "hidden_channels must be a positive multiple of 4",
            ));
        }
        if !(0.0..=1.0).contains(&self.update_probability) {
            return Err(NcaError::InvalidConfig(
                "update_probability must be between 0.0 and 1.0",
            ));
        }
        if self.benchmark_steps == 0 {
            return Err(NcaError::InvalidConfig("benchmark_steps must be non-zero"));
        }
        if self.fps_interval_ms == 0 {
            return Err(NcaError::InvalidConfig("fps_interval_ms must be non-zero"));
        }
        Ok(())
    }

    /// `(in_ch, out_ch)` each dense layer must declare.
    #[must_use]
    pub fn layer_shapes(&self) -> [(u32, u32); LAYER_COUNT] {
        [
            (CHANNEL_N * 3, self.hidden_channels),
            (self.hidden_channels, CHANNEL_N),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.layer_shapes(), [(48, 128), (128, 16)]);
    }

    #[test]
    fn rejects_degenerate_grid() {
        let config = EngineConfig {
            grid_width: 2,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(NcaError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let config = EngineConfig {
            update_probability: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"grid_width": 32, "rng_seed": 7}"#).expect("parse");
        assert_eq!(config.grid_width, 32);
        assert_eq!(config.grid_height, 96);
        assert_eq!(config.rng_seed, Some(7));
    }
}
