//! Backends of confirmed graphics apis.
//!
//! A backend hooks every frame boundary, resize and teardown point of its api, drives the
//! overlay callback on each presented frame and owns the gpu objects created for it.

pub(crate) mod dx9;
pub(crate) mod dxgi;
pub(crate) mod lifecycle;
mod metal;
pub(crate) mod opengl;
pub(crate) mod vulkan;

use core::{fmt, time::Duration};
use std::sync::Arc;

use asdf_present_hook::HookSet;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    dispatch::{self, Slot},
    error::{AttachError, ImageError},
    frame::Frame,
    image::ImageHandle,
    overlay::Overlay,
    platform::Platform,
    renderer::Release,
    types::Api,
};

pub(crate) use dxgi::{DXGI_PRESENT_TEST, device_api};
pub use lifecycle::Lifecycle;
use lifecycle::BackendCore;

#[cfg(windows)]
pub(crate) use dxgi::call_original_execute_command_lists;

pub struct Backend {
    core: Arc<BackendCore>,
    hooks: HookSet,
    platform: Platform,
    drain_timeout: Duration,
    // serializes attach and detach
    attach_lock: Mutex<()>,
}

impl Backend {
    pub(crate) fn new(
        api: Api,
        platform: Platform,
        overlay: Arc<dyn Overlay>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            core: Arc::new(BackendCore::new(api, overlay, platform.drivers.clone())),
            hooks: HookSet::new(platform.patcher.clone()),
            platform,
            drain_timeout,
            attach_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn api(&self) -> Api {
        self.core.api()
    }

    /// Human readable api name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.core.api().name()
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// `true` between a successful [`Backend::attach`] and [`Backend::detach`].
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.lifecycle() != Lifecycle::Uninitialized
    }

    /// Number of hooks this backend keeps installed.
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    fn slots(&self) -> &'static [&'static Slot<BackendCore>] {
        match self.core.api() {
            Api::Dx9 => &dx9::SLOTS,
            Api::Dx10 | Api::Dx11 | Api::Dx12 => &dxgi::SLOTS,
            Api::OpenGl => &opengl::WGL_SLOTS,
            Api::Glx => &opengl::GLX_SLOTS,
            Api::Vulkan => &vulkan::SLOTS,
            Api::Metal => &metal::SLOTS,
        }
    }

    fn remove_hooks(&self) -> bool {
        let capture = &self.core.vk_capture;
        vulkan::disarm_capture(capture);

        // detach from the render callback runs inside one of our replacements
        let own = usize::from(lifecycle::is_rendering());
        let removed = dispatch::teardown(
            self.slots(),
            &self.core,
            &self.hooks,
            &self.core.in_flight,
            own,
            self.drain_timeout,
        );

        vulkan::drain_capture(capture, self.drain_timeout) && removed
    }

    /// Install every hook of the api. Either all of them are installed or none.
    ///
    /// Attaching an attached backend does nothing.
    #[tracing::instrument(skip(self), fields(api = %self.api()))]
    pub fn attach(&self) -> Result<(), AttachError> {
        let _lock = self.attach_lock.lock();
        if self.is_attached() {
            return Ok(());
        }

        let res = self.hooks.batch(|hooks| {
            let core = &self.core;
            let platform = &self.platform;

            match core.api() {
                Api::Dx9 => dx9::attach(core, hooks, platform),
                Api::Dx10 | Api::Dx11 | Api::Dx12 => dxgi::attach(core, hooks, platform),
                Api::OpenGl => opengl::attach_wgl(core, hooks, platform),
                Api::Glx => opengl::attach_glx(core, hooks, platform),
                Api::Vulkan => vulkan::attach(core, hooks, platform),
                Api::Metal => metal::attach(core, hooks, platform),
            }
        });

        if let Err(err) = res {
            error!("attach failed, removing installed hooks. err: {err}");
            self.remove_hooks();
            return Err(err);
        }

        self.core.set_attached();
        debug!("attached with {} hooks", self.hooks.len());
        Ok(())
    }

    /// Remove every hook and release every gpu object. Outstanding image handles become stale.
    ///
    /// Detaching a detached backend does nothing.
    #[tracing::instrument(skip(self), fields(api = %self.api()))]
    pub fn detach(&self) {
        let _lock = self.attach_lock.lock();
        if !self.is_attached() {
            return;
        }

        if !self.remove_hooks() {
            error!("hooks could not be removed cleanly");
        }

        self.core.teardown();
        debug!("detached");
    }

    /// Render one frame of an intercepted presentation call.
    ///
    /// Called by the installed hooks. Hosts hooking presentation themselves may call it too.
    pub fn render_frame(&self, frame: &Frame<'_>) {
        self.core.render_frame(frame);
    }

    /// Release render targets after the host resized or reset its swap chain.
    pub fn reset(&self) {
        self.core.reset(Release::RenderTargets);
    }

    /// Queue rgba8 `pixels` for upload. The texture is created on a following frame.
    pub fn upload_image(
        &self,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<ImageHandle, ImageError> {
        self.core.upload_image(pixels, width, height)
    }

    /// Release an uploaded image. Returns `false` if the handle is stale.
    pub fn release_image(&self, handle: ImageHandle) -> bool {
        self.core.release_image(handle)
    }

    /// Number of live image handles.
    pub fn image_count(&self) -> usize {
        self.core.image_count()
    }

    /// Number of textures alive on the gpu.
    pub fn texture_count(&self) -> usize {
        self.core.texture_count()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("api", &self.api())
            .field("lifecycle", &self.lifecycle())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.detach();
    }
}
