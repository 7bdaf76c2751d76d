//! Packed tensors: multi-channel grids stored four channels per RGBA8 texel.
//!
//! A logical `(height, width, depth)` grid is split into `depth4 = ceil(depth/4)`
//! channel groups. The groups are tiled into a near-square `grid_w × grid_h`
//! arrangement, each tile holding one group for the whole grid. Values pass
//! through a `tan`/`atan` companding law so unbounded activations fit in a
//! byte.

use std::f32::consts::{FRAC_PI_2, PI};
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::NcaError;
use crate::device::{Device, TEXEL_BYTES, Texel, TextureBuffer};

/// Largest angle handed to `tan` when decoding; saturated texels stay finite.
const MAX_PACKED_ANGLE: f32 = FRAC_PI_2 - 1.0e-3;

/// Activation class of the values a tensor holds; selects the pack preset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    /// Signed, unbounded values.
    #[default]
    Linear,
    /// Non-negative values; negatives encode to zero.
    Relu,
}

impl Activation {
    #[must_use]
    pub const fn pack(self) -> PackScaleBias {
        match self {
            Self::Linear => PackScaleBias::LINEAR,
            Self::Relu => PackScaleBias::RELU,
        }
    }
}

/// Parameters of the encode/decode pair mapping reals onto unit pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackScaleBias {
    pub scale: f32,
    pub bias: f32,
}

impl PackScaleBias {
    pub const LINEAR: Self = Self {
        scale: PI,
        bias: 127.0 / 255.0,
    };
    pub const RELU: Self = Self {
        scale: FRAC_PI_2,
        bias: 0.0,
    };

    /// `atan(value) / scale + bias`, quantised to a byte.
    #[must_use]
    pub fn encode(self, value: f32) -> u8 {
        let unit = value.atan() / self.scale + self.bias;
        (unit.clamp(0.0, 1.0) * 255.0).round() as u8
    }

    /// `tan((pixel - bias) * scale)`.
    #[must_use]
    pub fn decode(self, byte: u8) -> f32 {
        let unit = f32::from(byte) / 255.0;
        ((unit - self.bias) * self.scale)
            .clamp(-MAX_PACKED_ANGLE, MAX_PACKED_ANGLE)
            .tan()
    }

    #[must_use]
    pub fn encode4(self, value: [f32; 4]) -> Texel {
        value.map(|v| self.encode(v))
    }

    #[must_use]
    pub fn decode4(self, texel: Texel) -> [f32; 4] {
        texel.map(|b| self.decode(b))
    }
}

/// Geometry of a packed tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub depth4: u32,
    pub grid_w: u32,
    pub grid_h: u32,
    texture_width: u32,
    texture_height: u32,
}

impl TensorShape {
    /// Geometry of a `width × height × depth` tensor. A physical texture too
    /// large to address is reported as [`NcaError::ResourceExhausted`].
    pub fn new(width: u32, height: u32, depth: u32) -> Result<Self, NcaError> {
        if width == 0 || height == 0 {
            return Err(NcaError::InvalidConfig("tensor dimensions must be non-zero"));
        }
        if depth == 0 {
            return Err(NcaError::InvalidConfig("tensor depth must be non-zero"));
        }
        let depth4 = depth.div_ceil(4);
        let mut grid_w = 1;
        while grid_w * grid_w < depth4 {
            grid_w += 1;
        }
        let grid_h = depth4.div_ceil(grid_w);
        let (Some(texture_width), Some(texture_height)) =
            (width.checked_mul(grid_w), height.checked_mul(grid_h))
        else {
            return Err(NcaError::ResourceExhausted {
                requested: (width as usize)
                    .saturating_mul(grid_w as usize)
                    .saturating_mul(height as usize)
                    .saturating_mul(grid_h as usize)
                    .saturating_mul(TEXEL_BYTES),
                available: 0,
            });
        };
        Ok(Self {
            width,
            height,
            depth,
            depth4,
            grid_w,
            grid_h,
            texture_width,
            texture_height,
        })
    }

    /// Physical texture size in texels.
    #[must_use]
    pub const fn texture_size(&self) -> (u32, u32) {
        (self.texture_width, self.texture_height)
    }

    /// Physical coordinate of `(x, y)` inside the tile holding `group`.
    #[must_use]
    pub const fn texel_coord(&self, x: i64, y: i64, group: u32) -> (i64, i64) {
        let tx = (group % self.grid_w) as i64;
        let ty = (group / self.grid_w) as i64;
        (tx * self.width as i64 + x, ty * self.height as i64 + y)
    }

    /// Cell position and channel group owning the texel at `index`.
    #[must_use]
    pub const fn locate(&self, index: usize) -> TexelSite {
        let tex_w = self.texture_width as usize;
        let px = index % tex_w;
        let py = index / tex_w;
        let w = self.width as usize;
        let h = self.height as usize;
        TexelSite {
            index,
            x: (px % w) as i64,
            y: (py % h) as i64,
            group: ((py / h) * self.grid_w as usize + px / w) as u32,
        }
    }

    /// Whether `(x, y)` lies on the grid.
    #[must_use]
    pub const fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64
    }
}

/// One output texel of a kernel dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelSite {
    pub index: usize,
    pub x: i64,
    pub y: i64,
    pub group: u32,
}

/// Reference identity of a tensor; stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// Grid of packed activations backed by a device texture.
#[derive(Debug)]
pub struct PackedTensor {
    shape: TensorShape,
    activation: Activation,
    buffer: TextureBuffer,
}

impl PackedTensor {
    /// Allocate a tensor filled with encoded zeros.
    pub fn create(
        device: &Device,
        width: u32,
        height: u32,
        depth: u32,
        activation: Activation,
    ) -> Result<Self, NcaError> {
        let shape = TensorShape::new(width, height, depth)?;
        let (tex_w, tex_h) = shape.texture_size();
        let mut buffer = device.allocate(tex_w, tex_h)?;
        let zero = activation.pack().encode4([0.0; 4]);
        buffer.texels_mut().fill(zero);
        Ok(Self {
            shape,
            activation,
            buffer,
        })
    }

    #[must_use]
    pub fn id(&self) -> TensorId {
        TensorId(self.buffer.id())
    }

    #[must_use]
    pub const fn shape(&self) -> &TensorShape {
        &self.shape
    }

    #[must_use]
    pub const fn pack(&self) -> PackScaleBias {
        self.activation.pack()
    }

    #[must_use]
    pub const fn buffer(&self) -> &TextureBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn texels(&self) -> &[Texel] {
        self.buffer.texels()
    }

    /// Decoded channel group at a cell; coordinates outside the tile bleed
    /// into neighbouring tiles and clamp at the texture edge.
    #[must_use]
    pub fn read(&self, x: i64, y: i64, group: u32) -> [f32; 4] {
        let (tx, ty) = self.shape.texel_coord(x, y, group);
        self.pack().decode4(self.buffer.sample(tx, ty))
    }

    /// Decoded scalar channel at a cell.
    #[must_use]
    pub fn read_channel(&self, x: i64, y: i64, channel: u32) -> f32 {
        self.read(x, y, channel / 4)[(channel % 4) as usize]
    }

    /// Decoded texel at a physical index.
    #[must_use]
    pub fn read_texel(&self, index: usize) -> [f32; 4] {
        self.pack().decode4(self.buffer.texels()[index])
    }

    /// Upload one channel group of one cell; off-grid writes are ignored.
    pub fn write(&mut self, x: i64, y: i64, group: u32, value: [f32; 4]) {
        if !self.shape.contains(x, y) || group >= self.shape.depth4 {
            return;
        }
        let (tx, ty) = self.shape.texel_coord(x, y, group);
        let (tex_w, _) = self.shape.texture_size();
        let index = ty as usize * tex_w as usize + tx as usize;
        self.buffer.texels_mut()[index] = self.pack().encode4(value);
    }

    /// Upload one scalar channel of one cell.
    pub fn write_channel(&mut self, x: i64, y: i64, channel: u32, value: f32) {
        let group = channel / 4;
        let mut texel = self.read(x, y, group);
        texel[(channel % 4) as usize] = value;
        self.write(x, y, group, texel);
    }

    /// Evaluate `kernel` for every texel in parallel; `None` leaves the texel as is.
    pub(crate) fn map_texels<F>(&mut self, kernel: F)
    where
        F: Fn(TexelSite) -> Option<[f32; 4]> + Sync,
    {
        let shape = self.shape;
        let pack = self.pack();
        self.buffer
            .texels_mut()
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, texel)| {
                if let Some(value) = kernel(shape.locate(index)) {
                    *texel = pack.encode4(value);
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_step(pack: PackScaleBias) -> f32 {
        pack.scale * 0.5 / 255.0 + 1.0e-4
    }

    #[test]
    fn shape_tiles_depth_groups() {
        let state = TensorShape::new(96, 96, 16).expect("shape");
        assert_eq!((state.depth4, state.grid_w, state.grid_h), (4, 2, 2));
        assert_eq!(state.texture_size(), (192, 192));

        let perception = TensorShape::new(96, 96, 48).expect("shape");
        assert_eq!((perception.depth4, perception.grid_w, perception.grid_h), (12, 4, 3));

        let hidden = TensorShape::new(96, 96, 128).expect("shape");
        assert_eq!((hidden.depth4, hidden.grid_w, hidden.grid_h), (32, 6, 6));

        let odd = TensorShape::new(5, 7, 6).expect("shape");
        assert_eq!((odd.depth4, odd.grid_w, odd.grid_h), (2, 2, 1));
        assert_eq!(odd.texture_size(), (10, 7));
    }

    #[test]
    fn oversized_texture_is_resource_exhausted() {
        let err = TensorShape::new(1_500_000_000, 1, 48).expect_err("width overflows");
        assert!(matches!(err, NcaError::ResourceExhausted { .. }));
        let err = TensorShape::new(3, 800_000_000, 128).expect_err("height overflows");
        assert!(matches!(err, NcaError::ResourceExhausted { .. }));

        let device = Device::new();
        let err = PackedTensor::create(&device, 1_500_000_000, 1, 48, Activation::Linear)
            .expect_err("no allocation");
        assert!(matches!(err, NcaError::ResourceExhausted { .. }));
        assert_eq!(device.live_bytes(), 0);
    }

    #[test]
    fn locate_inverts_texel_coord() {
        let shape = TensorShape::new(5, 4, 48).expect("shape");
        let (tex_w, _) = shape.texture_size();
        for group in 0..shape.depth4 {
            let (tx, ty) = shape.texel_coord(3, 2, group);
            let site = shape.locate(ty as usize * tex_w as usize + tx as usize);
            assert_eq!((site.x, site.y, site.group), (3, 2, group));
        }
    }

    #[test]
    fn linear_round_trip_within_quantisation() {
        let pack = PackScaleBias::LINEAR;
        let mut v = -100.0_f32;
        while v <= 100.0 {
            let restored = pack.decode(pack.encode(v));
            let err = (restored.atan() - v.atan()).abs();
            assert!(err <= half_step(pack), "value {v} restored as {restored}");
            v += 0.37;
        }
        assert_eq!(pack.decode(pack.encode(0.0)), 0.0);
    }

    #[test]
    fn relu_round_trip_and_clamp() {
        let pack = PackScaleBias::RELU;
        let mut v = 0.0_f32;
        while v <= 100.0 {
            let restored = pack.decode(pack.encode(v));
            let err = (restored.atan() - v.atan()).abs();
            assert!(err <= half_step(pack), "value {v} restored as {restored}");
            v += 0.29;
        }
        assert_eq!(pack.encode(-3.0), 0);
        assert_eq!(pack.decode(0), 0.0);
    }

    #[test]
    fn saturated_texels_decode_finite() {
        for pack in [PackScaleBias::LINEAR, PackScaleBias::RELU] {
            let top = pack.decode(255);
            assert!(top.is_finite() && top > 100.0);
        }
        assert!(PackScaleBias::LINEAR.decode(0) < -100.0);
    }

    #[test]
    fn tensor_reads_back_writes() {
        let device = Device::new();
        let mut tensor = PackedTensor::create(&device, 4, 4, 16, Activation::Linear).expect("tensor");
        assert_eq!(tensor.read(1, 1, 3), [0.0; 4]);
        tensor.write_channel(2, 1, 7, 0.5);
        assert!((tensor.read_channel(2, 1, 7) - 0.5).abs() < 0.01);
        assert_eq!(tensor.read_channel(2, 1, 6), 0.0);
        // Off-grid writes are dropped.
        tensor.write(9, 9, 0, [1.0; 4]);
        tensor.write(0, 0, 4, [1.0; 4]);
        assert!(tensor.texels().iter().all(|t| *t == tensor.pack().encode4([0.0; 4])
            || *t == tensor.pack().encode4([0.0, 0.0, 0.0, 0.5])));
    }

    #[test]
    fn neighbour_reads_bleed_across_tiles() {
        let device = Device::new();
        let mut tensor = PackedTensor::create(&device, 3, 3, 8, Activation::Linear).expect("tensor");
        tensor.write(0, 1, 1, [2.0; 4]);
        // One step right of the last column of group 0 lands in group 1's tile.
        let bled = tensor.read(3, 1, 0);
        assert!((bled[0] - 2.0).abs() < 0.05);
    }
}
