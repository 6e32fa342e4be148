use core::ffi::{CStr, c_char, c_int, c_uint, c_ulong, c_void};
use std::ffi::CString;

use anyhow::Context;
use asdf_present_hook::FnPtr;
use scopeguard::defer;
use tracing::{debug, trace};

use super::{Release, RenderDriver};
use crate::{
    backend::opengl::GetCurrentContextFn,
    frame::{Frame, NativeTarget},
    gl::{self, Gl, types::GLuint},
    image::NativeTexture,
    module::{self, ModuleHandle, ModuleIntrospection},
    types::Api,
};

type WglGetProcAddressFn = unsafe extern "system" fn(*const c_char) -> *const c_void;
type GlxGetProcAddressFn = unsafe extern "C" fn(*const c_char) -> *const c_void;
type GlxQueryDrawableFn = unsafe extern "C" fn(*mut c_void, c_ulong, c_int, *mut c_uint);

const GLX_WIDTH: c_int = 0x801D;
const GLX_HEIGHT: c_int = 0x801E;

/// Load gl functions through the platform loader, falling back to module exports.
fn load_gl(
    api: Api,
    modules: &dyn ModuleIntrospection,
    module: ModuleHandle,
) -> anyhow::Result<Gl> {
    let get_proc = match api {
        Api::OpenGl => modules.symbol(module, c"wglGetProcAddress"),
        _ => modules
            .symbol(module, c"glXGetProcAddressARB")
            .or_else(|| modules.symbol(module, c"glXGetProcAddress")),
    }
    .context("gl loader function not found")?;

    Ok(Gl::load_with(|name| {
        let Ok(name) = CString::new(name) else {
            return core::ptr::null();
        };

        let func = unsafe {
            match api {
                Api::OpenGl => get_proc.cast::<WglGetProcAddressFn>()(name.as_ptr()),
                _ => get_proc.cast::<GlxGetProcAddressFn>()(name.as_ptr()),
            }
        };

        // wglGetProcAddress returns small sentinels for gl 1.1 functions
        if matches!(func as isize, -1..=3) {
            return modules
                .symbol(module, &name)
                .map_or(core::ptr::null(), FnPtr::as_ptr);
        }

        func
    }))
}

/// Run `f`, restoring the gl state the overlay is allowed to touch afterwards.
fn with_saved_state<R>(gl: &Gl, f: impl FnOnce() -> R) -> R {
    macro_rules! get_gl_int {
        ($name:ident = $expr:expr) => {
            let mut $name = 0;
            gl.GetIntegerv($expr, &mut $name);
            let $name = $name as u32;
        };
    }

    macro_rules! is_gl_enabled {
        ($name:ident = $expr:expr) => {
            let $name = gl.IsEnabled($expr) == gl::TRUE;
        };
    }

    macro_rules! restore_cap {
        ($cap:expr, $enabled:expr) => {
            if $enabled {
                gl.Enable($cap);
            } else {
                gl.Disable($cap);
            }
        };
    }

    unsafe {
        let mut last_viewport = [0_i32; 4];
        gl.GetIntegerv(gl::VIEWPORT, last_viewport.as_mut_ptr());

        get_gl_int!(last_framebuffer = gl::DRAW_FRAMEBUFFER_BINDING);
        get_gl_int!(last_active_texture = gl::ACTIVE_TEXTURE);
        get_gl_int!(last_program = gl::CURRENT_PROGRAM);
        get_gl_int!(last_texture = gl::TEXTURE_BINDING_2D);
        get_gl_int!(last_array_buffer = gl::ARRAY_BUFFER_BINDING);
        get_gl_int!(last_vertex_array_object = gl::VERTEX_ARRAY_BINDING);

        get_gl_int!(last_blend_src_rgb = gl::BLEND_SRC_RGB);
        get_gl_int!(last_blend_dst_rgb = gl::BLEND_DST_RGB);
        get_gl_int!(last_blend_src_alpha = gl::BLEND_SRC_ALPHA);
        get_gl_int!(last_blend_dst_alpha = gl::BLEND_DST_ALPHA);
        get_gl_int!(last_blend_equation_rgb = gl::BLEND_EQUATION_RGB);
        get_gl_int!(last_blend_equation_alpha = gl::BLEND_EQUATION_ALPHA);
        is_gl_enabled!(last_blend = gl::BLEND);
        is_gl_enabled!(last_cull_face = gl::CULL_FACE);
        is_gl_enabled!(last_depth_test = gl::DEPTH_TEST);
        is_gl_enabled!(last_stencil = gl::STENCIL_TEST);
        is_gl_enabled!(last_scissor_test = gl::SCISSOR_TEST);
        is_gl_enabled!(last_srgb = gl::FRAMEBUFFER_SRGB);

        defer!({
            // https://github.com/ocornut/imgui/issues/6220
            if last_program == 0 || gl.IsProgram(last_program) != 0 {
                gl.UseProgram(last_program);
            }

            gl.ActiveTexture(gl::TEXTURE0);
            gl.BindTexture(gl::TEXTURE_2D, last_texture);
            gl.ActiveTexture(last_active_texture);

            gl.BindBuffer(gl::ARRAY_BUFFER, last_array_buffer);
            gl.BindVertexArray(last_vertex_array_object);
            gl.BindFramebuffer(gl::DRAW_FRAMEBUFFER, last_framebuffer);

            gl.BlendEquationSeparate(last_blend_equation_rgb, last_blend_equation_alpha);
            gl.BlendFuncSeparate(
                last_blend_src_rgb,
                last_blend_dst_rgb,
                last_blend_src_alpha,
                last_blend_dst_alpha,
            );
            restore_cap!(gl::BLEND, last_blend);
            restore_cap!(gl::CULL_FACE, last_cull_face);
            restore_cap!(gl::DEPTH_TEST, last_depth_test);
            restore_cap!(gl::STENCIL_TEST, last_stencil);
            restore_cap!(gl::SCISSOR_TEST, last_scissor_test);
            restore_cap!(gl::FRAMEBUFFER_SRGB, last_srgb);

            gl.Viewport(
                last_viewport[0],
                last_viewport[1],
                last_viewport[2],
                last_viewport[3],
            );
        });

        f()
    }
}

pub struct GlDriver {
    api: Api,
    gl: Gl,
    get_current_context: GetCurrentContextFn,
    query_drawable: Option<GlxQueryDrawableFn>,
    /// Context every gl object of this driver lives in.
    context: usize,
}

impl GlDriver {
    #[tracing::instrument(skip(modules))]
    pub fn new(api: Api, modules: &dyn ModuleIntrospection) -> anyhow::Result<Self> {
        let (name, module) = module::first_loaded(modules, api.candidate().modules())
            .context("gl module not loaded")?;
        debug!("loading gl functions from {name}");

        let symbol = |name: &CStr| {
            modules
                .symbol(module, name)
                .with_context(|| format!("{name:?} not found"))
        };

        let (get_current_context, query_drawable) = match api {
            Api::OpenGl => (symbol(c"wglGetCurrentContext")?, None),
            _ => (
                symbol(c"glXGetCurrentContext")?,
                modules.symbol(module, c"glXQueryDrawable"),
            ),
        };

        Ok(Self {
            api,
            gl: load_gl(api, modules, module)?,
            get_current_context: unsafe { get_current_context.cast() },
            query_drawable: query_drawable.map(|func| unsafe { func.cast() }),
            context: 0,
        })
    }

    fn current_context(&self) -> usize {
        unsafe { (self.get_current_context)() as usize }
    }

    /// `true` if gl calls reach the context owning this driver objects.
    fn is_current(&self) -> bool {
        self.context != 0 && self.current_context() == self.context
    }

    fn surface_size(&self, surface: *mut c_void, drawable: usize) -> Option<(u32, u32)> {
        match self.api {
            #[cfg(windows)]
            Api::OpenGl => {
                use windows::Win32::{
                    Foundation::RECT,
                    Graphics::Gdi::{HDC, WindowFromDC},
                    UI::WindowsAndMessaging::GetClientRect,
                };

                let hwnd = unsafe { WindowFromDC(HDC(surface)) };
                let mut rect = RECT::default();
                unsafe { GetClientRect(hwnd, &mut rect) }.ok()?;
                Some((
                    (rect.right - rect.left) as u32,
                    (rect.bottom - rect.top) as u32,
                ))
            }

            Api::Glx => {
                let query = self.query_drawable?;
                let (mut width, mut height) = (0, 0);
                unsafe {
                    query(surface, drawable as c_ulong, GLX_WIDTH, &mut width);
                    query(surface, drawable as c_ulong, GLX_HEIGHT, &mut height);
                }
                Some((width, height))
            }

            _ => None,
        }
    }

    fn viewport_size(&self) -> (u32, u32) {
        let mut viewport = [0_i32; 4];
        unsafe { self.gl.GetIntegerv(gl::VIEWPORT, viewport.as_mut_ptr()) };
        (viewport[2].max(0) as u32, viewport[3].max(0) as u32)
    }
}

impl RenderDriver for GlDriver {
    fn init(&mut self, frame: &Frame<'_>) -> anyhow::Result<()> {
        let &Frame::Gl { context, .. } = frame else {
            anyhow::bail!("not a gl frame");
        };

        self.context = context;
        debug!("gl objects bound to context {context:#x}");
        Ok(())
    }

    fn release(&mut self, scope: Release) {
        if scope == Release::All {
            self.context = 0;
        }
    }

    fn render(
        &mut self,
        frame: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        let &Frame::Gl {
            surface,
            drawable,
            context,
        } = frame
        else {
            return Ok(());
        };

        if context != self.context {
            trace!("skipping frame of foreign context {context:#x}");
            return Ok(());
        }

        let gl = &self.gl;
        with_saved_state(gl, || {
            let (width, height) = self
                .surface_size(surface, drawable)
                .filter(|&(width, height)| width != 0 && height != 0)
                .unwrap_or_else(|| self.viewport_size());
            if width == 0 || height == 0 {
                return;
            }

            unsafe {
                gl.BindFramebuffer(gl::DRAW_FRAMEBUFFER, 0);
                gl.Viewport(0, 0, width as _, height as _);
                gl.Disable(gl::CULL_FACE);
                gl.Disable(gl::DEPTH_TEST);
                gl.Disable(gl::STENCIL_TEST);
                gl.Disable(gl::SCISSOR_TEST);
                // disable srgb gamma correction enabled in some games
                gl.Disable(gl::FRAMEBUFFER_SRGB);
            }

            draw(&NativeTarget {
                api: self.api,
                device: context,
                context: 0,
                render_target: 0,
                width,
                height,
            });
        });

        Ok(())
    }

    fn create_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture> {
        if !self.is_current() {
            anyhow::bail!("render context is not current");
        }

        let gl = &self.gl;
        let mut texture: GLuint = 0;
        unsafe {
            let mut last_texture = 0;
            gl.GetIntegerv(gl::TEXTURE_BINDING_2D, &mut last_texture);
            let mut last_unpack_buffer = 0;
            gl.GetIntegerv(gl::PIXEL_UNPACK_BUFFER_BINDING, &mut last_unpack_buffer);
            let mut last_row_length = 0;
            gl.GetIntegerv(gl::UNPACK_ROW_LENGTH, &mut last_row_length);
            let mut last_alignment = 0;
            gl.GetIntegerv(gl::UNPACK_ALIGNMENT, &mut last_alignment);
            defer!({
                gl.BindTexture(gl::TEXTURE_2D, last_texture as _);
                gl.BindBuffer(gl::PIXEL_UNPACK_BUFFER, last_unpack_buffer as _);
                gl.PixelStorei(gl::UNPACK_ROW_LENGTH, last_row_length);
                gl.PixelStorei(gl::UNPACK_ALIGNMENT, last_alignment);
            });

            gl.BindBuffer(gl::PIXEL_UNPACK_BUFFER, 0);
            gl.PixelStorei(gl::UNPACK_ROW_LENGTH, 0);
            gl.PixelStorei(gl::UNPACK_ALIGNMENT, 4);

            gl.GenTextures(1, &mut texture);
            gl.BindTexture(gl::TEXTURE_2D, texture);
            gl.TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as _);
            gl.TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as _);
            gl.TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as _);
            gl.TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as _);
            gl.TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA8 as _,
                width as _,
                height as _,
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                pixels.as_ptr().cast(),
            );

            let err = gl.GetError();
            if err != gl::NO_ERROR {
                gl.DeleteTextures(1, &texture);
                anyhow::bail!("glTexImage2D failed. error: {err:#x}");
            }
        }

        Ok(NativeTexture {
            handle: texture as u64,
            view: 0,
            width,
            height,
        })
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        if !self.is_current() {
            // names are freed with their context
            trace!("leaving texture {} to its context", texture.handle);
            return;
        }

        let name = texture.handle as GLuint;
        unsafe { self.gl.DeleteTextures(1, &name) };
    }
}

unsafe impl Send for GlDriver {}
