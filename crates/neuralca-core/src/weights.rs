//! Dense layer weights: model file parsing, dequantisation and hot-swap.

use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::{Device, Texel, TextureBuffer};
use crate::{LAYER_COUNT, NcaError};

/// Quantisation centre shared by weights and biases.
pub const WEIGHT_CENTER: f32 = 0.5;

/// One layer entry of a model file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerParams {
    /// Base64 RGBA8 image of `out_ch / 4` columns and `in_ch + 1` rows.
    pub data_b64: String,
    pub weight_scale: f32,
    pub bias_scale: f32,
    pub in_ch: u32,
    pub out_ch: u32,
}

impl LayerParams {
    /// Build a layer entry from raw quantised bytes.
    #[must_use]
    pub fn from_bytes(
        bytes: &[u8],
        weight_scale: f32,
        bias_scale: f32,
        in_ch: u32,
        out_ch: u32,
    ) -> Self {
        Self {
            data_b64: STANDARD.encode(bytes),
            weight_scale,
            bias_scale,
            in_ch,
            out_ch,
        }
    }

    /// Byte count implied by the declared shape.
    #[must_use]
    pub fn expected_len(&self) -> usize {
        4 * (self.out_ch as usize / 4) * (self.in_ch as usize + 1)
    }

    fn decode_bytes(&self, layer: usize) -> Result<Vec<u8>, NcaError> {
        let malformed = |reason: String| NcaError::MalformedWeights { layer, reason };
        if self.in_ch == 0 {
            return Err(malformed("in_ch must be non-zero".to_string()));
        }
        if self.out_ch == 0 || !self.out_ch.is_multiple_of(4) {
            return Err(malformed(format!(
                "out_ch {} must be a positive multiple of 4",
                self.out_ch
            )));
        }
        let bytes = STANDARD
            .decode(self.data_b64.trim())
            .map_err(|err| malformed(format!("invalid base64: {err}")))?;
        let expected = self.expected_len();
        if bytes.len() != expected {
            return Err(malformed(format!(
                "expected {expected} bytes for {}x{} weights, found {}",
                self.in_ch,
                self.out_ch,
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// Parse a model file: a JSON array of layer entries.
pub fn parse_model(json: &str) -> Result<Vec<LayerParams>, NcaError> {
    Ok(serde_json::from_str(json)?)
}

/// Read a model file from any reader.
pub fn read_model<R: Read>(reader: R) -> Result<Vec<LayerParams>, NcaError> {
    Ok(serde_json::from_reader(reader)?)
}

/// Weight image of one dense layer resident on the device.
#[derive(Debug)]
pub struct DenseLayer {
    texture: TextureBuffer,
    weight_scale: f32,
    bias_scale: f32,
}

impl DenseLayer {
    /// Decode and upload one layer.
    pub fn load(device: &Device, layer: usize, params: &LayerParams) -> Result<Self, NcaError> {
        let bytes = params.decode_bytes(layer)?;
        let mut texture = device.allocate(params.out_ch / 4, params.in_ch + 1)?;
        for (texel, chunk) in texture.texels_mut().iter_mut().zip(bytes.chunks_exact(4)) {
            texel.copy_from_slice(chunk);
        }
        debug!(
            layer,
            texture = texture.id(),
            in_ch = params.in_ch,
            out_ch = params.out_ch,
            "uploaded dense weights"
        );
        Ok(Self {
            texture,
            weight_scale: params.weight_scale,
            bias_scale: params.bias_scale,
        })
    }

    /// `[weight_scale, bias_scale, center]`.
    #[must_use]
    pub const fn coefs(&self) -> [f32; 3] {
        [self.weight_scale, self.bias_scale, WEIGHT_CENTER]
    }

    /// Weights from input scalar `row` to output group `group`.
    #[must_use]
    pub fn weight(&self, group: u32, row: u32) -> [f32; 4] {
        dequantize(self.raw(group, row), self.weight_scale)
    }

    /// Bias of output group `group`, read at `row` (clamped onto the bias row).
    #[must_use]
    pub fn bias(&self, group: u32, row: u32) -> [f32; 4] {
        dequantize(self.raw(group, row), self.bias_scale)
    }

    fn raw(&self, group: u32, row: u32) -> Texel {
        self.texture.sample(i64::from(group), i64::from(row))
    }
}

fn dequantize(texel: Texel, scale: f32) -> [f32; 4] {
    texel.map(|b| (f32::from(b) / 255.0 - WEIGHT_CENTER) * scale)
}

/// Both dense layers of the network, replaced as a unit.
#[derive(Debug)]
pub struct WeightStore {
    layers: Vec<DenseLayer>,
    shapes: [(u32, u32); LAYER_COUNT],
    generation: u64,
}

impl WeightStore {
    /// Decode `params`, checking each layer against `shapes` (`(in_ch, out_ch)`).
    pub fn load(
        device: &Device,
        params: &[LayerParams],
        shapes: [(u32, u32); LAYER_COUNT],
    ) -> Result<Self, NcaError> {
        let layers = Self::decode_all(device, params, &shapes)?;
        info!(layers = layers.len(), "installed dense weights");
        Ok(Self {
            layers,
            shapes,
            generation: 0,
        })
    }

    /// Swap in new weights. All new textures are built before the old ones are
    /// released, so a failure leaves the current weights installed.
    pub fn replace(&mut self, device: &Device, params: &[LayerParams]) -> Result<(), NcaError> {
        let fresh = Self::decode_all(device, params, &self.shapes)?;
        let retired = std::mem::replace(&mut self.layers, fresh);
        for layer in retired {
            debug!(texture = layer.texture.id(), "releasing dense weights");
        }
        self.generation += 1;
        info!(generation = self.generation, "hot-swapped dense weights");
        Ok(())
    }

    /// Layer `index` (0 = perception → hidden, 1 = hidden → update).
    #[must_use]
    pub fn layer(&self, index: usize) -> &DenseLayer {
        &self.layers[index]
    }

    /// Number of successful replacements since load.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn decode_all(
        device: &Device,
        params: &[LayerParams],
        shapes: &[(u32, u32); LAYER_COUNT],
    ) -> Result<Vec<DenseLayer>, NcaError> {
        if params.len() != LAYER_COUNT {
            return Err(NcaError::MalformedWeights {
                layer: params.len().min(LAYER_COUNT),
                reason: format!("expected {LAYER_COUNT} layers, found {}", params.len()),
            });
        }
        let mut layers = Vec::with_capacity(LAYER_COUNT);
        for (index, (layer, &(in_ch, out_ch))) in params.iter().zip(shapes).enumerate() {
            if (layer.in_ch, layer.out_ch) != (in_ch, out_ch) {
                return Err(NcaError::MalformedWeights {
                    layer: index,
                    reason: format!(
                        "shape {}x{} does not match architecture {in_ch}x{out_ch}",
                        layer.in_ch, layer.out_ch
                    ),
                });
            }
            layers.push(DenseLayer::load(device, index, layer)?);
        }
        Ok(layers)
    }
}
