//! Objects of an intercepted presentation call.

use core::{cell::Cell, ffi::c_void, fmt};

use ash::vk;
use scopeguard::defer;

use crate::{
    image::{ImageHandle, NativeTexture, Textures},
    types::Api,
};

/// Live objects exposed by an intercepted presentation call.
///
/// Only valid for the duration of that call.
#[derive(Clone, Copy)]
pub enum Frame<'a> {
    Dx9 {
        device: *mut c_void,
        /// `true` if presented from `EndScene`, where a scene is already open.
        in_scene: bool,
    },
    Dxgi {
        swapchain: *mut c_void,
        /// Captured Direct3D 12 command queue.
        queue: Option<*mut c_void>,
    },
    Gl {
        /// `HDC` on wgl, `Display*` on glx.
        surface: *mut c_void,
        /// glx drawable, zero on wgl.
        drawable: usize,
        /// Context current while presenting.
        context: usize,
    },
    Vulkan {
        queue: vk::Queue,
        present_info: &'a vk::PresentInfoKHR<'a>,
        /// Semaphore the present waits on instead of the host ones, set by the driver.
        wait: &'a Cell<vk::Semaphore>,
    },
    Metal {
        drawable: *mut c_void,
    },
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Frame::Dx9 { device, in_scene } => f
                .debug_struct("Dx9")
                .field("device", &device)
                .field("in_scene", &in_scene)
                .finish(),
            Frame::Dxgi { swapchain, queue } => f
                .debug_struct("Dxgi")
                .field("swapchain", &swapchain)
                .field("queue", &queue)
                .finish(),
            Frame::Gl {
                surface,
                drawable,
                context,
            } => f
                .debug_struct("Gl")
                .field("surface", &surface)
                .field("drawable", &drawable)
                .field("context", &context)
                .finish(),
            // ash structs only implement Debug with its `debug` feature
            Frame::Vulkan {
                queue,
                present_info,
                ..
            } => f
                .debug_struct("Vulkan")
                .field("queue", &queue)
                .field("swapchains", &present_info.swapchain_count)
                .finish_non_exhaustive(),
            Frame::Metal { drawable } => {
                f.debug_struct("Metal").field("drawable", &drawable).finish()
            }
        }
    }
}

/// Native handles bound while the render callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTarget {
    pub api: Api,
    /// `IDirect3DDevice9`, `ID3D1xDevice`, `HGLRC`, `VkDevice` or `MTLDevice`.
    pub device: usize,
    /// Recording object if the api has one. `ID3D11DeviceContext`,
    /// `ID3D12GraphicsCommandList`, `VkCommandBuffer` or `MTLCommandQueue`.
    pub context: usize,
    /// Bound render target. Back buffer surface, render target view, rtv descriptor,
    /// `VkImageView` or `MTLTexture`. Zero for the default gl framebuffer.
    pub render_target: u64,
    pub width: u32,
    pub height: u32,
}

thread_local! {
    static CURRENT: Cell<Option<NativeTarget>> = const { Cell::new(None) };
}

/// Target bound on this thread, if called inside a render callback.
pub fn current() -> Option<NativeTarget> {
    CURRENT.get()
}

pub(crate) fn with_current<R>(target: NativeTarget, f: impl FnOnce() -> R) -> R {
    let last = CURRENT.replace(Some(target));
    defer!(CURRENT.set(last));

    f()
}

/// Argument of [`crate::overlay::Overlay::render`].
pub struct FrameContext<'a> {
    target: NativeTarget,
    textures: &'a Textures,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn new(target: NativeTarget, textures: &'a Textures) -> Self {
        Self { target, textures }
    }

    #[inline]
    pub fn target(&self) -> &NativeTarget {
        &self.target
    }

    /// Gpu texture of an uploaded image.
    ///
    /// Returns `None` if the handle is stale or its upload is not applied yet.
    pub fn texture(&self, handle: ImageHandle) -> Option<NativeTexture> {
        self.textures.get(handle)
    }
}
