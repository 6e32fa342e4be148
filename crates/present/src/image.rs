//! Gpu images uploaded by callers.
//!
//! Callers add and remove images from any thread through [`ImageArena`], guarded by a lock
//! the render thread only ever `try_lock`s. Gpu textures are created and destroyed on the render
//! thread and kept in [`Textures`], which is owned by the render state.

use core::mem;

use slotmap::{SecondaryMap, SlotMap, new_key_type};
use tracing::{debug, error};

use crate::{error::ImageError, renderer::RenderDriver};

new_key_type! {
    pub(crate) struct ImageKey;
}

/// Non owning reference to a backend texture.
///
/// A handle is invalidated when released, and when its backend detaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(ImageKey);

/// Gpu texture created from an uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTexture {
    /// `IDirect3DTexture9`, `ID3D1xTexture2D`, `ID3D12Resource`, gl texture name, `VkImage`
    /// or `MTLTexture`.
    pub handle: u64,
    /// Shader resource view, `VkImageView` or zero.
    pub view: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub(crate) struct PendingImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
enum ImageSlot {
    Pending(PendingImage),
    Uploaded,
}

/// Texture work collected from the arena for the render thread.
#[derive(Debug, Default)]
pub(crate) struct ImageWork {
    pub retired: Vec<ImageKey>,
    pub pending: Vec<(ImageKey, PendingImage)>,
}

impl ImageWork {
    pub fn is_empty(&self) -> bool {
        self.retired.is_empty() && self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ImageArena {
    slots: SlotMap<ImageKey, ImageSlot>,
    retired: Vec<ImageKey>,
}

impl ImageArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue rgba8 `pixels` for upload on the next frame.
    pub fn insert(
        &mut self,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<ImageHandle, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::Empty);
        }

        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|size| size.checked_mul(4))
            .unwrap_or(usize::MAX);
        if pixels.len() != expected {
            return Err(ImageError::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        let key = self.slots.insert(ImageSlot::Pending(PendingImage {
            pixels,
            width,
            height,
        }));
        Ok(ImageHandle(key))
    }

    /// Release an image. Returns `false` if the handle is stale.
    pub fn release(&mut self, handle: ImageHandle) -> bool {
        match self.slots.remove(handle.0) {
            Some(ImageSlot::Uploaded) => {
                self.retired.push(handle.0);
                true
            }
            Some(ImageSlot::Pending(_)) => true,
            None => false,
        }
    }

    #[cfg(test)]
    fn contains(&self, handle: ImageHandle) -> bool {
        self.slots.contains_key(handle.0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Take releases and pending uploads, marking pending images uploaded.
    pub fn take_work(&mut self) -> ImageWork {
        let mut work = ImageWork {
            retired: mem::take(&mut self.retired),
            pending: Vec::new(),
        };

        for (key, slot) in self.slots.iter_mut() {
            if let ImageSlot::Pending(_) = slot {
                let ImageSlot::Pending(image) = mem::replace(slot, ImageSlot::Uploaded) else {
                    continue;
                };
                work.pending.push((key, image));
            }
        }

        work
    }

    /// Invalidate every handle.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.retired.clear();
    }
}

/// Textures alive on the gpu, keyed by image.
#[derive(Debug, Default)]
pub(crate) struct Textures {
    map: SecondaryMap<ImageKey, NativeTexture>,
}

impl Textures {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, handle: ImageHandle) -> Option<NativeTexture> {
        self.map.get(handle.0).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Apply work on the render thread. Releases go first so a reused slot never replaces
    /// a live texture.
    pub fn apply(&mut self, work: ImageWork, driver: &mut dyn RenderDriver) {
        for key in work.retired {
            if let Some(texture) = self.map.remove(key) {
                driver.destroy_texture(texture);
            }
        }

        for (key, image) in work.pending {
            match driver.create_texture(&image.pixels, image.width, image.height) {
                Ok(texture) => {
                    debug!("texture created. {:?}", texture);
                    self.map.insert(key, texture);
                }
                Err(err) => {
                    error!("texture creation failed. err: {err:?}");
                }
            }
        }
    }

    pub fn destroy_all(&mut self, driver: &mut dyn RenderDriver) {
        for (_, texture) in self.map.drain() {
            driver.destroy_texture(texture);
        }
    }

    /// Forget textures without a driver to destroy them.
    pub fn forget(&mut self) {
        self.map.clear();
    }
}
