//! Software compute device owning every packed texture.
//!
//! The device hands out [`TextureBuffer`] guards and keeps a running tally of
//! live bytes so hot-swap paths can be checked for leaks. An optional memory
//! limit turns oversized allocations into [`NcaError::ResourceExhausted`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::trace;

use crate::NcaError;

/// One RGBA8 texel.
pub type Texel = [u8; 4];

/// Bytes occupied by a single texel.
pub const TEXEL_BYTES: usize = 4;

#[derive(Debug)]
struct DeviceInner {
    live_bytes: AtomicUsize,
    live_textures: AtomicUsize,
    next_texture: AtomicU64,
    memory_limit: Option<usize>,
}

/// Cloneable handle to the compute device.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    /// Device without a memory cap (host allocation failures still surface).
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Device that refuses allocations pushing live bytes past `bytes`.
    #[must_use]
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(memory_limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                live_bytes: AtomicUsize::new(0),
                live_textures: AtomicUsize::new(0),
                next_texture: AtomicU64::new(1),
                memory_limit,
            }),
        }
    }

    /// Bytes currently held by live textures.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.inner.live_bytes.load(Ordering::Acquire)
    }

    /// Number of textures not yet released.
    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.inner.live_textures.load(Ordering::Acquire)
    }

    /// Allocate a zero-filled `width × height` RGBA8 texture.
    pub fn allocate(&self, width: u32, height: u32) -> Result<TextureBuffer, NcaError> {
        let Some(texel_count) = (width as usize).checked_mul(height as usize) else {
            return Err(NcaError::ResourceExhausted {
                requested: usize::MAX,
                available: self.available(),
            });
        };
        let Some(bytes) = texel_count.checked_mul(TEXEL_BYTES) else {
            return Err(NcaError::ResourceExhausted {
                requested: usize::MAX,
                available: self.available(),
            });
        };
        self.reserve(bytes)?;

        let mut texels: Vec<Texel> = Vec::new();
        if texels.try_reserve_exact(texel_count).is_err() {
            self.release(bytes);
            return Err(NcaError::ResourceExhausted {
                requested: bytes,
                available: self.available(),
            });
        }
        texels.resize(texel_count, [0; 4]);

        let id = self.inner.next_texture.fetch_add(1, Ordering::Relaxed);
        self.inner.live_textures.fetch_add(1, Ordering::AcqRel);
        trace!(texture = id, width, height, bytes, "allocated texture");
        Ok(TextureBuffer {
            device: self.clone(),
            id,
            width,
            height,
            texels,
        })
    }

    /// Read back a single texel, forcing all queued work on `buffer` to finish.
    pub fn flush(&self, buffer: &TextureBuffer) -> Texel {
        std::hint::black_box(buffer.texels.first().copied().unwrap_or_default())
    }

    fn available(&self) -> usize {
        match self.inner.memory_limit {
            Some(limit) => limit.saturating_sub(self.live_bytes()),
            None => usize::MAX,
        }
    }

    fn reserve(&self, bytes: usize) -> Result<(), NcaError> {
        let Some(limit) = self.inner.memory_limit else {
            self.inner.live_bytes.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        };
        self.inner
            .live_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(bytes).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|live| NcaError::ResourceExhausted {
                requested: bytes,
                available: limit.saturating_sub(live),
            })
    }

    fn release(&self, bytes: usize) {
        self.inner.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Scoped texture allocation; dropping it returns the bytes to the device.
pub struct TextureBuffer {
    device: Device,
    id: u64,
    width: u32,
    height: u32,
    texels: Vec<Texel>,
}

impl TextureBuffer {
    /// Device-unique texture id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Texels in row-major order.
    #[must_use]
    pub fn texels(&self) -> &[Texel] {
        &self.texels
    }

    pub fn texels_mut(&mut self) -> &mut [Texel] {
        &mut self.texels
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.texels.len() * TEXEL_BYTES
    }

    /// Texel at a clamped coordinate (clamp-to-edge sampling).
    #[must_use]
    pub fn sample(&self, x: i64, y: i64) -> Texel {
        let x = x.clamp(0, i64::from(self.width) - 1) as usize;
        let y = y.clamp(0, i64::from(self.height) - 1) as usize;
        self.texels[y * self.width as usize + x]
    }
}

impl Drop for TextureBuffer {
    fn drop(&mut self) {
        let bytes = self.byte_len();
        self.device.release(bytes);
        self.device
            .inner
            .live_textures
            .fetch_sub(1, Ordering::AcqRel);
        trace!(texture = self.id, bytes, "released texture");
    }
}

impl fmt::Debug for TextureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureBuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_tracked_and_released() {
        let device = Device::new();
        let texture = device.allocate(4, 3).expect("texture");
        assert_eq!(texture.texels().len(), 12);
        assert_eq!(device.live_bytes(), 48);
        assert_eq!(device.live_textures(), 1);
        drop(texture);
        assert_eq!(device.live_bytes(), 0);
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn memory_limit_rejects_oversized_allocation() {
        let device = Device::with_memory_limit(64);
        let first = device.allocate(4, 4).expect("fits exactly");
        let err = device.allocate(1, 1).expect_err("limit reached");
        match err {
            NcaError::ResourceExhausted {
                requested,
                available,
            } => {
                assert_eq!(requested, 4);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        drop(first);
        device.allocate(1, 1).expect("room after release");
    }

    #[test]
    fn sampling_clamps_to_edge() {
        let device = Device::new();
        let mut texture = device.allocate(2, 2).expect("texture");
        texture.texels_mut()[3] = [9, 9, 9, 9];
        assert_eq!(texture.sample(5, 5), [9, 9, 9, 9]);
        assert_eq!(texture.sample(-1, -1), [0, 0, 0, 0]);
        assert_eq!(device.flush(&texture), [0, 0, 0, 0]);
    }

    #[test]
    fn texture_ids_are_unique() {
        let device = Device::new();
        let a = device.allocate(1, 1).expect("a");
        let b = device.allocate(1, 1).expect("b");
        assert_ne!(a.id(), b.id());
    }
}
