//! Per api gpu drivers.
//!
//! A driver owns the gpu objects of one backend. It derives render targets from the live frame,
//! binds them around the render callback and creates textures for uploaded images.

#[cfg(windows)]
pub mod dx10;
#[cfg(windows)]
pub mod dx11;
#[cfg(windows)]
pub mod dx12;
#[cfg(windows)]
pub mod dx9;
pub mod metal;
pub mod opengl;
pub mod vulkan;

use std::sync::Arc;

use anyhow::bail;

use crate::{
    frame::{Frame, NativeTarget},
    image::NativeTexture,
    module::ModuleIntrospection,
    types::Api,
};

/// Objects released by [`RenderDriver::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Objects derived from the swap chain or back buffers. Released on resize and reset.
    RenderTargets,
    /// Every gpu object. Released on detach.
    All,
}

pub trait RenderDriver: Send {
    /// Derive render objects from the live frame.
    fn init(&mut self, frame: &Frame<'_>) -> anyhow::Result<()>;

    fn release(&mut self, scope: Release);

    /// Bind the render target of `frame` and call `draw` inside it.
    fn render(
        &mut self,
        frame: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()>;

    /// Create a texture from rgba8 pixels.
    fn create_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture>;

    fn destroy_texture(&mut self, texture: NativeTexture);
}

/// Creates the driver of a confirmed api on its first frame.
pub trait DriverFactory: Send + Sync {
    fn create(&self, api: Api, frame: &Frame<'_>) -> anyhow::Result<Box<dyn RenderDriver>>;
}

/// Drivers talking to the real graphics apis.
pub struct NativeDrivers {
    modules: Arc<dyn ModuleIntrospection>,
}

impl NativeDrivers {
    pub fn new(modules: Arc<dyn ModuleIntrospection>) -> Self {
        Self { modules }
    }
}

impl DriverFactory for NativeDrivers {
    #[tracing::instrument(skip(self, frame))]
    fn create(&self, api: Api, frame: &Frame<'_>) -> anyhow::Result<Box<dyn RenderDriver>> {
        Ok(match (api, frame) {
            #[cfg(windows)]
            (Api::Dx9, Frame::Dx9 { device, .. }) => Box::new(dx9::Dx9Driver::new(*device)?),
            #[cfg(windows)]
            (Api::Dx10, Frame::Dxgi { swapchain, .. }) => {
                Box::new(dx10::Dx10Driver::new(*swapchain)?)
            }
            #[cfg(windows)]
            (Api::Dx11, Frame::Dxgi { swapchain, .. }) => {
                Box::new(dx11::Dx11Driver::new(*swapchain)?)
            }
            #[cfg(windows)]
            (Api::Dx12, Frame::Dxgi { swapchain, .. }) => {
                Box::new(dx12::Dx12Driver::new(*swapchain)?)
            }
            (Api::OpenGl | Api::Glx, Frame::Gl { .. }) => {
                Box::new(opengl::GlDriver::new(api, &*self.modules)?)
            }
            (Api::Vulkan, Frame::Vulkan { queue, .. }) => {
                Box::new(vulkan::VulkanDriver::new(*queue, &*self.modules)?)
            }
            (Api::Metal, Frame::Metal { .. }) => {
                Box::new(metal::MetalDriver::new(&*self.modules)?)
            }
            _ => bail!("no {api} driver for {frame:?}"),
        })
    }
}
