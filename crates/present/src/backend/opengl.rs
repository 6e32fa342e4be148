//! OpenGL backend of wgl and glx.
//!
//! Swap functions may call each other (`SwapBuffers` calls `wglSwapBuffers`), so only the
//! outermost swap on a thread draws.

use core::{
    cell::Cell,
    ffi::{CStr, c_int, c_uint, c_ulong, c_void},
    sync::atomic::Ordering,
};
use std::sync::Arc;

use asdf_present_hook::{FnPtr, HookSet};
use scopeguard::defer;
use tracing::{debug, trace};

use super::lifecycle::BackendCore;
use crate::{
    dispatch::Slot,
    error::{AttachError, ProbeError},
    frame::Frame,
    module::{self, ModuleHandle, ModuleIntrospection},
    platform::Platform,
    renderer::Release,
    types::CandidateKind,
};

pub(crate) type WglSwapBuffersFn = unsafe extern "system" fn(*mut c_void) -> c_int;
pub(crate) type WglSwapLayerBuffersFn = unsafe extern "system" fn(*mut c_void, c_uint) -> c_int;
pub(crate) type WglDeleteContextFn = unsafe extern "system" fn(*mut c_void) -> c_int;
pub(crate) type GlxSwapBuffersFn = unsafe extern "C" fn(*mut c_void, c_ulong);
pub(crate) type GlxDestroyContextFn = unsafe extern "C" fn(*mut c_void, *mut c_void);
pub(crate) type GetCurrentContextFn = unsafe extern "system" fn() -> *mut c_void;
pub(crate) type GetStringFn = unsafe extern "system" fn(c_uint) -> *const u8;

pub(crate) const GL_VERSION: c_uint = 0x1F02;

const WGL_SWAP_MAIN_PLANE: c_uint = 0x1;

static WGL_SWAP_BUFFERS: Slot<BackendCore> = Slot::new();
static WGL_SWAP_LAYER_BUFFERS: Slot<BackendCore> = Slot::new();
static WGL_DELETE_CONTEXT: Slot<BackendCore> = Slot::new();
static GLX_SWAP_BUFFERS: Slot<BackendCore> = Slot::new();
static GLX_DESTROY_CONTEXT: Slot<BackendCore> = Slot::new();

pub(super) static WGL_SLOTS: [&Slot<BackendCore>; 3] = [
    &WGL_SWAP_BUFFERS,
    &WGL_SWAP_LAYER_BUFFERS,
    &WGL_DELETE_CONTEXT,
];
pub(super) static GLX_SLOTS: [&Slot<BackendCore>; 2] = [&GLX_SWAP_BUFFERS, &GLX_DESTROY_CONTEXT];

thread_local! {
    static SWAP_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Run `f` with the number of swap calls already running on this thread.
fn with_swap_depth<R>(f: impl FnOnce(usize) -> R) -> R {
    let depth = SWAP_DEPTH.get();
    SWAP_DEPTH.set(depth + 1);
    defer!(SWAP_DEPTH.set(depth));

    f(depth)
}

/// Parse `major.minor` out of a `GL_VERSION` string.
///
/// Accepts vendor prefixes such as `OpenGL ES 3.2 ...`.
pub(crate) fn parse_gl_version(version: &CStr) -> Option<(u32, u32)> {
    let version = version.to_str().ok()?;
    let start = version.find(|c: char| c.is_ascii_digit())?;
    let mut parts = version[start..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty());

    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Resolve an exported symbol of `module`.
pub(crate) fn resolve_symbol(
    modules: &dyn ModuleIntrospection,
    module: ModuleHandle,
    name: &'static CStr,
) -> Result<FnPtr, ProbeError> {
    modules
        .symbol(module, name)
        .ok_or_else(|| ProbeError::SymbolMissing(name.to_str().unwrap_or("?")))
}

fn loaded_module(
    modules: &dyn ModuleIntrospection,
    kind: CandidateKind,
) -> Result<ModuleHandle, ProbeError> {
    module::first_loaded(modules, kind.modules())
        .map(|(_, handle)| handle)
        .ok_or(ProbeError::SymbolMissing(kind.name()))
}

#[tracing::instrument(skip_all)]
pub(super) fn attach_wgl(
    core: &Arc<BackendCore>,
    hooks: &HookSet,
    platform: &Platform,
) -> Result<(), AttachError> {
    let modules = &*platform.modules;
    let entry_point = || AttachError::entry_point(core.api());

    let module = loaded_module(modules, CandidateKind::Wgl).map_err(entry_point())?;
    let swap_buffers = resolve_symbol(modules, module, c"wglSwapBuffers").map_err(entry_point())?;
    let delete_context =
        resolve_symbol(modules, module, c"wglDeleteContext").map_err(entry_point())?;
    let get_current_context =
        resolve_symbol(modules, module, c"wglGetCurrentContext").map_err(entry_point())?;
    let swap_layer_buffers = modules.symbol(module, c"wglSwapLayerBuffers");

    unsafe {
        WGL_SWAP_BUFFERS.install(
            hooks,
            swap_buffers,
            hooked_wgl_swap_buffers as WglSwapBuffersFn as _,
            core,
            Some(get_current_context),
        )?;
        WGL_DELETE_CONTEXT.install(
            hooks,
            delete_context,
            hooked_wgl_delete_context as WglDeleteContextFn as _,
            core,
            None,
        )?;

        if let Some(swap_layer_buffers) = swap_layer_buffers {
            WGL_SWAP_LAYER_BUFFERS.install(
                hooks,
                swap_layer_buffers,
                hooked_wgl_swap_layer_buffers as WglSwapLayerBuffersFn as _,
                core,
                Some(get_current_context),
            )?;
        }
    }

    Ok(())
}

#[tracing::instrument(skip_all)]
pub(super) fn attach_glx(
    core: &Arc<BackendCore>,
    hooks: &HookSet,
    platform: &Platform,
) -> Result<(), AttachError> {
    let modules = &*platform.modules;
    let entry_point = || AttachError::entry_point(core.api());

    let module = loaded_module(modules, CandidateKind::Glx).map_err(entry_point())?;
    let swap_buffers = resolve_symbol(modules, module, c"glXSwapBuffers").map_err(entry_point())?;
    let destroy_context =
        resolve_symbol(modules, module, c"glXDestroyContext").map_err(entry_point())?;
    let get_current_context =
        resolve_symbol(modules, module, c"glXGetCurrentContext").map_err(entry_point())?;

    unsafe {
        GLX_SWAP_BUFFERS.install(
            hooks,
            swap_buffers,
            hooked_glx_swap_buffers as GlxSwapBuffersFn as _,
            core,
            Some(get_current_context),
        )?;
        GLX_DESTROY_CONTEXT.install(
            hooks,
            destroy_context,
            hooked_glx_destroy_context as GlxDestroyContextFn as _,
            core,
            None,
        )?;
    }

    Ok(())
}

fn draw(
    core: &BackendCore,
    get_current_context: Option<FnPtr>,
    surface: *mut c_void,
    drawable: usize,
) {
    let Some(get_current_context) = get_current_context else {
        return;
    };

    let context = unsafe { get_current_context.cast::<GetCurrentContextFn>()() } as usize;
    if context == 0 {
        trace!("no current context");
        return;
    }

    let last = core.gl_context.swap(context, Ordering::AcqRel);
    if last != 0 && last != context {
        debug!("context switched from {last:#x} to {context:#x}");
        core.reset(Release::All);
    }

    core.render_frame(&Frame::Gl {
        surface,
        drawable,
        context,
    });
}

fn context_deleted(core: &BackendCore, context: *mut c_void) {
    if core
        .gl_context
        .compare_exchange(context as usize, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        debug!("render context {:p} deleted", context);
        core.reset(Release::All);
    }
}

#[tracing::instrument]
extern "system" fn hooked_wgl_swap_buffers(hdc: *mut c_void) -> c_int {
    trace!("wglSwapBuffers called");

    let entry = WGL_SWAP_BUFFERS.wait();
    with_swap_depth(|depth| {
        {
            let _in_flight = entry.owner.in_flight.enter();
            if depth == 0 && WGL_SWAP_BUFFERS.armed() {
                draw(&entry.owner, entry.extra, hdc, 0);
            }
        }

        unsafe { entry.trampoline.cast::<WglSwapBuffersFn>()(hdc) }
    })
}

#[tracing::instrument]
extern "system" fn hooked_wgl_swap_layer_buffers(hdc: *mut c_void, planes: c_uint) -> c_int {
    trace!("wglSwapLayerBuffers called");

    let entry = WGL_SWAP_LAYER_BUFFERS.wait();
    with_swap_depth(|depth| {
        {
            let _in_flight = entry.owner.in_flight.enter();
            if depth == 0 && planes & WGL_SWAP_MAIN_PLANE != 0 && WGL_SWAP_LAYER_BUFFERS.armed() {
                draw(&entry.owner, entry.extra, hdc, 0);
            }
        }

        unsafe { entry.trampoline.cast::<WglSwapLayerBuffersFn>()(hdc, planes) }
    })
}

#[tracing::instrument]
extern "system" fn hooked_wgl_delete_context(hglrc: *mut c_void) -> c_int {
    trace!("wglDeleteContext called");

    let entry = WGL_DELETE_CONTEXT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if WGL_DELETE_CONTEXT.armed() {
            context_deleted(&entry.owner, hglrc);
        }
    }

    unsafe { entry.trampoline.cast::<WglDeleteContextFn>()(hglrc) }
}

#[tracing::instrument]
extern "C" fn hooked_glx_swap_buffers(dpy: *mut c_void, drawable: c_ulong) {
    trace!("glXSwapBuffers called");

    let entry = GLX_SWAP_BUFFERS.wait();
    with_swap_depth(|depth| {
        {
            let _in_flight = entry.owner.in_flight.enter();
            if depth == 0 && GLX_SWAP_BUFFERS.armed() {
                draw(&entry.owner, entry.extra, dpy, drawable as usize);
            }
        }

        unsafe { entry.trampoline.cast::<GlxSwapBuffersFn>()(dpy, drawable) }
    })
}

#[tracing::instrument]
extern "C" fn hooked_glx_destroy_context(dpy: *mut c_void, context: *mut c_void) {
    trace!("glXDestroyContext called");

    let entry = GLX_DESTROY_CONTEXT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if GLX_DESTROY_CONTEXT.armed() {
            context_deleted(&entry.owner, context);
        }
    }

    unsafe { entry.trampoline.cast::<GlxDestroyContextFn>()(dpy, context) }
}
