//! Simulation engine: owns the double-buffered state, the intermediate
//! tensors and the weights, and sequences the kernel dispatches of a step.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bench::{self, BenchmarkReport, FpsMeter};
use crate::device::{Device, Texel};
use crate::kernels::{
    Brush, DenseParams, Dispatch, DropoutParams, Frame, KernelKind, PaintParams,
    PerceptionParams, UpdateParams, VisualizeParams,
};
use crate::tensor::{Activation, PackedTensor, TensorId};
use crate::weights::{LayerParams, WeightStore};
use crate::{CHANNEL_N, EngineConfig, MAX_PACKED_DEPTH, NcaError};

/// Upper bound for the per-step dropout seed.
const SEED_RANGE: f32 = 1_000.0;

/// Which tensor [`Engine::draw`] renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VisMode {
    /// State composited over white.
    #[default]
    Color,
    State,
    Perception,
    Hidden,
    Update,
    MaskedUpdate,
}

impl VisMode {
    pub const ALL: [Self; 6] = [
        Self::Color,
        Self::State,
        Self::Perception,
        Self::Hidden,
        Self::Update,
        Self::MaskedUpdate,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::State => "state",
            Self::Perception => "perception",
            Self::Hidden => "hidden",
            Self::Update => "update",
            Self::MaskedUpdate => "maskedUpdate",
        }
    }
}

impl fmt::Display for VisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| format!("unknown visualisation mode `{s}`"))
    }
}

/// One dispatch of the step pipeline, named after the tensor it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Perception,
    Hidden,
    Update,
    MaskedUpdate,
    NextState,
}

impl Stage {
    /// Dispatch order of one step.
    pub const PIPELINE: [Self; 5] = [
        Self::Perception,
        Self::Hidden,
        Self::Update,
        Self::MaskedUpdate,
        Self::NextState,
    ];

    #[must_use]
    pub const fn kind(self) -> KernelKind {
        match self {
            Self::Perception => KernelKind::Perception,
            Self::Hidden | Self::Update => KernelKind::Dense,
            Self::MaskedUpdate => KernelKind::Dropout,
            Self::NextState => KernelKind::Update,
        }
    }
}

/// A running automaton. Owned by the caller; every operation goes through it.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    device: Device,
    state: PackedTensor,
    next_state: PackedTensor,
    perception: PackedTensor,
    hidden: PackedTensor,
    update: PackedTensor,
    masked_update: PackedTensor,
    weights: WeightStore,
    rng: SmallRng,
    fps: FpsMeter,
    steps: u64,
}

impl Engine {
    /// Allocate every tensor, install `layers` and reset to a single seed.
    pub fn new(
        device: &Device,
        layers: &[LayerParams],
        config: EngineConfig,
    ) -> Result<Self, NcaError> {
        config.validate()?;
        for (in_ch, _) in config.layer_shapes() {
            check_dense_depth(in_ch)?;
        }

        let (width, height) = (config.grid_width, config.grid_height);
        let tensor = |depth, activation| {
            PackedTensor::create(device, width, height, depth, activation)
        };
        let state = tensor(CHANNEL_N, Activation::Linear)?;
        let next_state = tensor(CHANNEL_N, Activation::Linear)?;
        let perception = tensor(CHANNEL_N * 3, Activation::Linear)?;
        let hidden = tensor(config.hidden_channels, Activation::Relu)?;
        let update = tensor(CHANNEL_N, Activation::Linear)?;
        let masked_update = tensor(CHANNEL_N, Activation::Linear)?;
        let weights = WeightStore::load(device, layers, config.layer_shapes())?;

        let seed = config.rng_seed.unwrap_or_else(rand::random::<u64>);
        let fps = FpsMeter::new(Duration::from_millis(config.fps_interval_ms));
        let mut engine = Self {
            config,
            device: device.clone(),
            state,
            next_state,
            perception,
            hidden,
            update,
            masked_update,
            weights,
            rng: SmallRng::seed_from_u64(seed),
            fps,
            steps: 0,
        };
        engine.reset();
        info!(
            width,
            height,
            hidden = engine.config.hidden_channels,
            textures = device.live_textures(),
            bytes = device.live_bytes(),
            "created neural CA engine",
        );
        Ok(engine)
    }

    /// Advance the automaton by one step.
    pub fn step(&mut self) {
        for stage in Stage::PIPELINE {
            self.run_stage(stage);
        }
        std::mem::swap(&mut self.state, &mut self.next_state);
        self.steps += 1;
        self.fps.record_step(Instant::now());
    }

    /// Run a single pipeline dispatch into its output tensor.
    pub fn run_stage(&mut self, stage: Stage) -> KernelKind {
        match stage {
            Stage::Perception => Dispatch::Perception(PerceptionParams { input: &self.state })
                .run(&mut self.perception),
            Stage::Hidden => Dispatch::Dense(DenseParams {
                input: &self.perception,
                weights: self.weights.layer(0),
            })
            .run(&mut self.hidden),
            Stage::Update => Dispatch::Dense(DenseParams {
                input: &self.hidden,
                weights: self.weights.layer(1),
            })
            .run(&mut self.update),
            Stage::MaskedUpdate => {
                let seed = self.rng.random_range(0.0..SEED_RANGE);
                Dispatch::Dropout(DropoutParams {
                    input: &self.update,
                    seed,
                    update_probability: self.config.update_probability,
                })
                .run(&mut self.masked_update)
            }
            Stage::NextState => Dispatch::Update(UpdateParams {
                state: &self.state,
                update: &self.masked_update,
            })
            .run(&mut self.next_state),
        }
    }

    /// Overwrite a disc of the current state.
    pub fn paint(&mut self, x: f32, y: f32, radius: f32, brush: Brush) {
        Dispatch::Paint(PaintParams {
            x,
            y,
            radius,
            brush,
        })
        .run(&mut self.state);
        debug!(x, y, radius, %brush, "painted state");
    }

    /// Clear the grid and plant one seed at its centre.
    pub fn reset(&mut self) {
        self.paint(0.0, 0.0, 10_000.0, Brush::Clear);
        let cx = self.config.grid_width as f32 / 2.0;
        let cy = self.config.grid_height as f32 / 2.0;
        self.paint(cx, cy, 1.0, Brush::Seed);
    }

    /// Hot-swap both dense layers; on error the previous weights stay active.
    pub fn set_weights(&mut self, layers: &[LayerParams]) -> Result<(), NcaError> {
        self.weights
            .replace(&self.device, layers)
            .inspect_err(|err| warn!(%err, "rejected weight swap; keeping previous weights"))
    }

    /// Render one of the tensors.
    #[must_use]
    pub fn draw(&self, mode: VisMode) -> Frame {
        VisualizeParams {
            input: self.tensor(mode),
            raw: mode != VisMode::Color,
        }
        .run()
    }

    /// Time the step and each of its dispatches.
    pub fn benchmark(&mut self) -> BenchmarkReport {
        bench::run(self)
    }

    /// Steps per second over the last completed sampling window.
    #[must_use]
    pub fn fps(&self) -> String {
        self.fps.last().to_string()
    }

    /// Read back one texel of the state, forcing completion of queued work.
    pub fn flush(&self) -> Texel {
        self.device.flush(self.state.buffer())
    }

    /// Read back one texel of a stage's output.
    pub fn flush_stage(&self, stage: Stage) -> Texel {
        self.device.flush(self.stage_output(stage).buffer())
    }

    #[must_use]
    pub fn stage_output(&self, stage: Stage) -> &PackedTensor {
        match stage {
            Stage::Perception => &self.perception,
            Stage::Hidden => &self.hidden,
            Stage::Update => &self.update,
            Stage::MaskedUpdate => &self.masked_update,
            Stage::NextState => &self.next_state,
        }
    }

    /// Tensor displayed by `mode`.
    #[must_use]
    pub fn tensor(&self, mode: VisMode) -> &PackedTensor {
        match mode {
            VisMode::Color | VisMode::State => &self.state,
            VisMode::Perception => &self.perception,
            VisMode::Hidden => &self.hidden,
            VisMode::Update => &self.update,
            VisMode::MaskedUpdate => &self.masked_update,
        }
    }

    /// State read by the next step.
    #[must_use]
    pub const fn state(&self) -> &PackedTensor {
        &self.state
    }

    /// Buffer the next step will write.
    #[must_use]
    pub const fn next_state(&self) -> &PackedTensor {
        &self.next_state
    }

    #[must_use]
    pub fn state_id(&self) -> TensorId {
        self.state.id()
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub const fn weights(&self) -> &WeightStore {
        &self.weights
    }

    /// Steps taken since construction.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Grid size as `(width, height)`.
    #[must_use]
    pub const fn grid_size(&self) -> (u32, u32) {
        (self.config.grid_width, self.config.grid_height)
    }
}

fn check_dense_depth(depth: u32) -> Result<(), NcaError> {
    if depth.div_ceil(4) > MAX_PACKED_DEPTH {
        return Err(NcaError::UnsupportedDepth {
            depth,
            max: MAX_PACKED_DEPTH * 4,
        });
    }
    Ok(())
}
