//! The fixed set of compute kernels.
//!
//! Every kernel is a pure function of its inputs evaluated independently for
//! each texel of the output tensor. Outputs are taken by `&mut` and inputs by
//! `&`, so a tensor can never be read and written by the same dispatch.

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::MAX_PACKED_DEPTH;
use crate::tensor::{PackedTensor, TensorShape};
use crate::weights::DenseLayer;

/// Neighbourhood alpha below which a cell counts as dead.
pub const ALIVE_THRESHOLD: f32 = 0.1;
/// Index of the alpha scalar within channel group 0.
const ALPHA: usize = 3;

/// Closed set of kernels making up the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKind {
    Perception,
    Dense,
    Dropout,
    Update,
    Paint,
    Visualize,
}

impl KernelKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Perception => "perception",
            Self::Dense => "dense",
            Self::Dropout => "dropout",
            Self::Update => "update",
            Self::Paint => "paint",
            Self::Visualize => "vis",
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a paint stroke writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Brush {
    /// Zero every channel.
    Clear,
    /// Plant a living seed: alpha and hidden channels set to one.
    Seed,
}

impl FromStr for Brush {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clear" => Ok(Self::Clear),
            "seed" => Ok(Self::Seed),
            other => Err(format!("unknown brush `{other}` (expected clear or seed)")),
        }
    }
}

impl fmt::Display for Brush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clear => "clear",
            Self::Seed => "seed",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PerceptionParams<'a> {
    pub input: &'a PackedTensor,
}

#[derive(Debug, Clone, Copy)]
pub struct DenseParams<'a> {
    pub input: &'a PackedTensor,
    pub weights: &'a DenseLayer,
}

#[derive(Debug, Clone, Copy)]
pub struct DropoutParams<'a> {
    pub input: &'a PackedTensor,
    pub seed: f32,
    pub update_probability: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateParams<'a> {
    pub state: &'a PackedTensor,
    pub update: &'a PackedTensor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintParams {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub brush: Brush,
}

/// Arguments of the read-only visualisation kernel.
#[derive(Debug, Clone, Copy)]
pub struct VisualizeParams<'a> {
    pub input: &'a PackedTensor,
    /// Dump the packed texture instead of compositing over white.
    pub raw: bool,
}

impl VisualizeParams<'_> {
    #[must_use]
    pub const fn kind(&self) -> KernelKind {
        KernelKind::Visualize
    }

    /// Render into a fresh frame; no tensor is written.
    #[must_use]
    pub fn run(&self) -> Frame {
        visualize(self.input, self.raw)
    }
}

/// A kernel together with its typed arguments, ready to run into an output.
#[derive(Debug, Clone, Copy)]
pub enum Dispatch<'a> {
    Perception(PerceptionParams<'a>),
    Dense(DenseParams<'a>),
    Dropout(DropoutParams<'a>),
    Update(UpdateParams<'a>),
    Paint(PaintParams),
}

impl Dispatch<'_> {
    #[must_use]
    pub const fn kind(&self) -> KernelKind {
        match self {
            Self::Perception(_) => KernelKind::Perception,
            Self::Dense(_) => KernelKind::Dense,
            Self::Dropout(_) => KernelKind::Dropout,
            Self::Update(_) => KernelKind::Update,
            Self::Paint(_) => KernelKind::Paint,
        }
    }

    /// Execute into `output`, returning the kernel that ran.
    pub fn run(&self, output: &mut PackedTensor) -> KernelKind {
        match *self {
            Self::Perception(p) => perception(p.input, output),
            Self::Dense(p) => dense(p.input, p.weights, output),
            Self::Dropout(p) => dropout(p.input, p.seed, p.update_probability, output),
            Self::Update(p) => update(p.state, p.update, output),
            Self::Paint(p) => paint(&p, output),
        }
        self.kind()
    }
}

/// Identity, x-gradient and y-gradient of every input group.
pub fn perception(input: &PackedTensor, output: &mut PackedTensor) {
    let in_depth4 = input.shape().depth4;
    let out_depth4 = output.shape().depth4;
    output.map_texels(|site| {
        if site.group >= out_depth4 {
            return None;
        }
        let filter = site.group / in_depth4;
        let ch = site.group % in_depth4;
        let read = |ox: i64, oy: i64| input.read(site.x + ox, site.y + oy, ch);
        if filter == 0 {
            return Some(read(0, 0));
        }
        let ((dx, dy), (ex, ey)) = if filter == 1 {
            ((1, 0), (0, 1))
        } else {
            ((0, 1), (1, 0))
        };
        let fwd = read(dx, dy);
        let back = read(-dx, -dy);
        let fwd_up = read(dx + ex, dy + ey);
        let back_up = read(-dx + ex, -dy + ey);
        let fwd_down = read(dx - ex, dy - ey);
        let back_down = read(-dx - ex, -dy - ey);
        Some(std::array::from_fn(|k| {
            ((fwd[k] - back[k]) * 2.0 + fwd_up[k] - back_up[k] + fwd_down[k] - back_down[k]) / 8.0
        }))
    });
}

/// Fully connected layer applied per cell: `output = W · input + b`.
pub fn dense(input: &PackedTensor, weights: &DenseLayer, output: &mut PackedTensor) {
    let in_depth4 = input.shape().depth4 as f32;
    let out_depth4 = output.shape().depth4;
    output.map_texels(|site| {
        if site.group >= out_depth4 {
            return None;
        }
        let mut acc = [0.0_f32; 4];
        let mut row = 0_u32;
        for i in 0..MAX_PACKED_DEPTH {
            for scalar in input.read(site.x, site.y, i) {
                let w = weights.weight(site.group, row);
                for (a, w) in acc.iter_mut().zip(w) {
                    *a += scalar * w;
                }
                row += 1;
            }
            // Inclusive ceiling check: the group containing the last channel
            // is always processed, partial or not.
            if i as f32 + 1.5 > in_depth4 {
                break;
            }
        }
        let bias = weights.bias(site.group, row);
        Some(std::array::from_fn(|k| acc[k] + bias[k]))
    });
}

/// "Hash without sine" over three floats, in `[0, 1)`.
#[must_use]
pub fn hash13(p: [f32; 3]) -> f32 {
    let mut p3 = p.map(|v| fract(v * 0.1031));
    let d = p3[0] * (p3[1] + 33.33) + p3[1] * (p3[2] + 33.33) + p3[2] * (p3[0] + 33.33);
    p3 = p3.map(|v| v + d);
    fract((p3[0] + p3[1]) * p3[2])
}

fn fract(v: f32) -> f32 {
    v - v.floor()
}

/// Whether the cell at `(x, y)` applies its update for this `seed`.
#[must_use]
pub fn dropout_keeps(x: i64, y: i64, seed: f32, update_probability: f32) -> bool {
    hash13([x as f32 + 0.5, y as f32 + 0.5, seed]) <= update_probability
}

/// Zero whole cells at random; all channel groups of a cell share one draw.
pub fn dropout(input: &PackedTensor, seed: f32, update_probability: f32, output: &mut PackedTensor) {
    debug_assert_eq!(input.shape(), output.shape());
    output.map_texels(|site| {
        let value = input.read_texel(site.index);
        if dropout_keeps(site.x, site.y, seed, update_probability) {
            Some(value)
        } else {
            Some([0.0; 4])
        }
    });
}

/// Whether `(x, y)` lies on the outermost ring of the grid.
#[must_use]
pub const fn is_border(shape: &TensorShape, x: i64, y: i64) -> bool {
    x < 1 || y < 1 || x >= shape.width as i64 - 1 || y >= shape.height as i64 - 1
}

/// Alive-masked merge `state + update`.
pub fn update(state: &PackedTensor, delta: &PackedTensor, output: &mut PackedTensor) {
    debug_assert_eq!(state.shape(), output.shape());
    debug_assert_eq!(delta.shape(), output.shape());
    let shape = *output.shape();
    output.map_texels(|site| {
        if is_border(&shape, site.x, site.y) {
            return Some([0.0; 4]);
        }
        let mut pre_max = 0.0_f32;
        let mut post_max = 0.0_f32;
        for oy in -1..=1 {
            for ox in -1..=1 {
                let pre = state.read(site.x + ox, site.y + oy, 0)[ALPHA];
                let post = pre + delta.read(site.x + ox, site.y + oy, 0)[ALPHA];
                pre_max = pre_max.max(pre);
                post_max = post_max.max(post);
            }
        }
        if pre_max.min(post_max) < ALIVE_THRESHOLD {
            return Some([0.0; 4]);
        }
        let current = state.read_texel(site.index);
        let change = delta.read_texel(site.index);
        Some(std::array::from_fn(|k| current[k] + change[k]))
    });
}

/// Overwrite a disc of cells; everything outside is left untouched.
pub fn paint(params: &PaintParams, output: &mut PackedTensor) {
    output.map_texels(|site| {
        let dx = site.x as f32 + 0.5 - params.x + 0.5;
        let dy = site.y as f32 + 0.5 - params.y + 0.5;
        if dx.hypot(dy) >= params.radius {
            return None;
        }
        Some(match params.brush {
            Brush::Clear => [0.0; 4],
            Brush::Seed if site.group > 0 => [1.0; 4],
            Brush::Seed => [0.0, 0.0, 0.0, 1.0],
        })
    });
}

/// Display-ready RGBA8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA bytes, row 0 at the top.
    pub pixels: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let mut px = [0; 4];
        px.copy_from_slice(&self.pixels[offset..offset + 4]);
        px
    }
}

/// Render a tensor: `raw` dumps the packed texture, otherwise the RGBA
/// channels are composited over white.
#[must_use]
pub fn visualize(input: &PackedTensor, raw: bool) -> Frame {
    if raw {
        let (width, height) = input.shape().texture_size();
        let pixels = input
            .texels()
            .iter()
            .flat_map(|&[r, g, b, _]| [r, g, b, u8::MAX])
            .collect();
        return Frame {
            width,
            height,
            pixels,
        };
    }
    let shape = input.shape();
    let width = shape.width;
    let mut pixels = vec![0_u8; shape.width as usize * shape.height as usize * 4];
    pixels
        .par_chunks_mut(4)
        .enumerate()
        .for_each(|(index, px)| {
            let x = (index % width as usize) as i64;
            let y = (index / width as usize) as i64;
            let rgba = input.read(x, y, 0);
            let alpha = rgba[ALPHA];
            for (out, c) in px.iter_mut().zip(&rgba[..3]) {
                *out = ((1.0 - alpha + c).clamp(0.0, 1.0) * 255.0).round() as u8;
            }
            px[3] = u8::MAX;
        });
    Frame {
        width,
        height: shape.height,
        pixels,
    }
}
