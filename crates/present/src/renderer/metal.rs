use core::ffi::{CStr, c_void};

use anyhow::{Context, bail};
use tracing::debug;

use super::{Release, RenderDriver};
use crate::{
    frame::{Frame, NativeTarget},
    image::NativeTexture,
    module::ModuleIntrospection,
    objc::ObjcRuntime,
    types::Api,
};

const MTL_PIXEL_FORMAT_RGBA8_UNORM: usize = 70;

#[repr(C)]
#[derive(Clone, Copy)]
struct MtlOrigin {
    x: usize,
    y: usize,
    z: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MtlSize {
    width: usize,
    height: usize,
    depth: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MtlRegion {
    origin: MtlOrigin,
    size: MtlSize,
}

type Id = *mut c_void;
type Sel = *mut c_void;

type SendUsizeFn = unsafe extern "C" fn(Id, Sel) -> usize;
type SendObjectFn = unsafe extern "C" fn(Id, Sel, Id) -> Id;
type DescriptorFn = unsafe extern "C" fn(Id, Sel, usize, usize, usize, bool) -> Id;
type ReplaceRegionFn = unsafe extern "C" fn(Id, Sel, MtlRegion, usize, *const c_void, usize);

pub struct MetalDriver {
    runtime: ObjcRuntime,
    /// Retained `MTLDevice` of the presented drawables.
    device: Option<Id>,
    /// Owned `MTLCommandQueue` handed to the overlay.
    queue: Option<Id>,
}

impl MetalDriver {
    #[tracing::instrument(skip(modules))]
    pub fn new(modules: &dyn ModuleIntrospection) -> anyhow::Result<Self> {
        Ok(Self {
            runtime: ObjcRuntime::load(modules)?,
            device: None,
            queue: None,
        })
    }

    fn send_usize(&self, receiver: Id, sel: &CStr) -> usize {
        unsafe { self.runtime.msg_send::<SendUsizeFn>()(receiver, self.runtime.sel(sel)) }
    }

    fn release_objects(&mut self) {
        for object in [self.queue.take(), self.device.take()].into_iter().flatten() {
            unsafe { self.runtime.send_id(object, c"release") };
        }
    }
}

impl RenderDriver for MetalDriver {
    fn init(&mut self, frame: &Frame<'_>) -> anyhow::Result<()> {
        let &Frame::Metal { drawable } = frame else {
            bail!("not a metal frame");
        };

        let runtime = self.runtime;
        unsafe {
            let texture = runtime.send_id(drawable, c"texture");
            if texture.is_null() {
                bail!("drawable has no texture");
            }

            let device = runtime.send_id(texture, c"device");
            if device.is_null() {
                bail!("drawable texture has no device");
            }

            self.release_objects();
            self.device = Some(runtime.send_id(device, c"retain"));
            let queue = runtime.send_id(device, c"newCommandQueue");
            self.queue = (!queue.is_null()).then_some(queue);
        }

        debug!("metal device {:?}", self.device);
        Ok(())
    }

    fn release(&mut self, scope: Release) {
        if scope == Release::All {
            self.release_objects();
        }
    }

    fn render(
        &mut self,
        frame: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        let &Frame::Metal { drawable } = frame else {
            return Ok(());
        };
        let (Some(device), Some(queue)) = (self.device, self.queue) else {
            return Ok(());
        };

        let texture = unsafe { self.runtime.send_id(drawable, c"texture") };
        if texture.is_null() {
            return Ok(());
        }

        draw(&NativeTarget {
            api: Api::Metal,
            device: device as usize,
            context: queue as usize,
            render_target: texture as u64,
            width: self.send_usize(texture, c"width") as u32,
            height: self.send_usize(texture, c"height") as u32,
        });

        Ok(())
    }

    fn create_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture> {
        let device = self.device.context("metal device not initialized")?;
        let runtime = &self.runtime;

        let texture = unsafe {
            let class = runtime
                .class(c"MTLTextureDescriptor")
                .context("MTLTextureDescriptor not found")?;
            let descriptor = runtime.msg_send::<DescriptorFn>()(
                class,
                runtime.sel(c"texture2DDescriptorWithPixelFormat:width:height:mipmapped:"),
                MTL_PIXEL_FORMAT_RGBA8_UNORM,
                width as usize,
                height as usize,
                false,
            );
            if descriptor.is_null() {
                bail!("cannot create texture descriptor");
            }

            runtime.msg_send::<SendObjectFn>()(
                device,
                runtime.sel(c"newTextureWithDescriptor:"),
                descriptor,
            )
        };
        if texture.is_null() {
            bail!("cannot create {width}x{height} texture");
        }

        unsafe {
            runtime.msg_send::<ReplaceRegionFn>()(
                texture,
                runtime.sel(c"replaceRegion:mipmapLevel:withBytes:bytesPerRow:"),
                MtlRegion {
                    origin: MtlOrigin { x: 0, y: 0, z: 0 },
                    size: MtlSize {
                        width: width as usize,
                        height: height as usize,
                        depth: 1,
                    },
                },
                0,
                pixels.as_ptr().cast(),
                width as usize * 4,
            );
        }

        Ok(NativeTexture {
            handle: texture as u64,
            view: 0,
            width,
            height,
        })
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        unsafe {
            self.runtime
                .send_id(texture.handle as usize as Id, c"release");
        }
    }
}

impl Drop for MetalDriver {
    fn drop(&mut self) {
        self.release_objects();
    }
}

unsafe impl Send for MetalDriver {}
