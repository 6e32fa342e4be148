//! Temporary hooks confirming which api presents frames.
//!
//! A probe always forwards to the real call first and confirms from its result.

use core::{
    cell::Cell,
    ffi::{CStr, c_int, c_ulong, c_void},
};
use std::sync::Arc;

use ash::vk;
use asdf_present_hook::{FnPtr, HookSet};
use scopeguard::defer;
use tracing::{debug, trace};

use super::state::Shared;
use crate::{
    backend::{
        self, DXGI_PRESENT_TEST,
        dx9::{self, EndSceneFn},
        dxgi::{self, Present1Fn, PresentFn},
        opengl::{self, GL_VERSION, GetStringFn, GlxSwapBuffersFn, WglSwapBuffersFn},
        vulkan,
    },
    dispatch::Slot,
    error::ProbeError,
    module::ModuleHandle,
    objc::{self, ObjcRuntime, PresentImp},
    platform::Platform,
    types::{Api, CandidateKind},
};

static DXGI_PRESENT: Slot<Shared> = Slot::new();
static DXGI_PRESENT1: Slot<Shared> = Slot::new();
static DX9_END_SCENE: Slot<Shared> = Slot::new();
static WGL_SWAP_BUFFERS: Slot<Shared> = Slot::new();
static GLX_SWAP_BUFFERS: Slot<Shared> = Slot::new();
static VK_QUEUE_PRESENT: Slot<Shared> = Slot::new();
static METAL_PRESENT: Slot<Shared> = Slot::new();

pub(super) static SLOTS: [&Slot<Shared>; 7] = [
    &DXGI_PRESENT,
    &DXGI_PRESENT1,
    &DX9_END_SCENE,
    &WGL_SWAP_BUFFERS,
    &GLX_SWAP_BUFFERS,
    &VK_QUEUE_PRESENT,
    &METAL_PRESENT,
];

/// Probe slots of one candidate.
pub(super) fn slots(kind: CandidateKind) -> &'static [&'static Slot<Shared>] {
    match kind {
        CandidateKind::Dxgi => &SLOTS[0..2],
        CandidateKind::Dx9 => &SLOTS[2..3],
        CandidateKind::Wgl => &SLOTS[3..4],
        CandidateKind::Glx => &SLOTS[4..5],
        CandidateKind::Vulkan => &SLOTS[5..6],
        CandidateKind::Metal => &SLOTS[6..7],
    }
}

thread_local! {
    // set while a gl or vulkan probe runs the real call
    static FOREIGN_PRESENT: Cell<bool> = const { Cell::new(false) };
}

fn with_foreign_present<R>(f: impl FnOnce() -> R) -> R {
    let last = FOREIGN_PRESENT.replace(true);
    defer!(FOREIGN_PRESENT.set(last));

    f()
}

/// Install the probe hooks of `kind` for `module`. Returns the hooked targets.
///
/// Nothing stays installed on error.
#[tracing::instrument(skip(hooks, shared, platform))]
pub(super) fn install(
    kind: CandidateKind,
    module: ModuleHandle,
    hooks: &HookSet,
    shared: &Arc<Shared>,
    platform: &Platform,
) -> Result<Vec<FnPtr>, ProbeError> {
    let before = hooks.records();
    let res = hooks.batch(|hooks| install_inner(kind, module, hooks, shared, platform));

    let targets = hooks
        .records()
        .into_iter()
        .map(|record| record.target)
        .filter(|target| !before.iter().any(|record| record.target == *target))
        .collect::<Vec<_>>();

    match res {
        Ok(()) => {
            debug!("{kind} probe installed on {} targets", targets.len());
            Ok(targets)
        }

        Err(err) => {
            for slot in slots(kind) {
                slot.disarm_owned(shared);
            }
            if kind == CandidateKind::Vulkan {
                vulkan::disarm_capture(&shared.capture);
            }
            for target in targets {
                hooks.remove(target);
            }

            Err(err)
        }
    }
}

fn install_inner(
    kind: CandidateKind,
    module: ModuleHandle,
    hooks: &HookSet,
    shared: &Arc<Shared>,
    platform: &Platform,
) -> Result<(), ProbeError> {
    let modules = &*platform.modules;

    match kind {
        CandidateKind::Dxgi => {
            let entries = dxgi::resolve_swapchain(&*platform.offscreen)?;
            unsafe {
                DXGI_PRESENT.install(
                    hooks,
                    entries.present,
                    probe_dxgi_present as PresentFn as _,
                    shared,
                    None,
                )?;

                if let Some(present1) = entries.present1 {
                    DXGI_PRESENT1.install(
                        hooks,
                        present1,
                        probe_dxgi_present1 as Present1Fn as _,
                        shared,
                        None,
                    )?;
                }
            }
        }

        CandidateKind::Dx9 => {
            let entries = dx9::resolve_device(&*platform.offscreen)?;
            unsafe {
                DX9_END_SCENE.install(
                    hooks,
                    entries.end_scene,
                    probe_dx9_end_scene as EndSceneFn as _,
                    shared,
                    None,
                )?;
            }
        }

        CandidateKind::Wgl => {
            let swap_buffers = opengl::resolve_symbol(modules, module, c"wglSwapBuffers")?;
            let get_string = opengl::resolve_symbol(modules, module, c"glGetString")?;
            unsafe {
                WGL_SWAP_BUFFERS.install(
                    hooks,
                    swap_buffers,
                    probe_wgl_swap_buffers as WglSwapBuffersFn as _,
                    shared,
                    Some(get_string),
                )?;
            }
        }

        CandidateKind::Glx => {
            let swap_buffers = opengl::resolve_symbol(modules, module, c"glXSwapBuffers")?;
            let get_string = opengl::resolve_symbol(modules, module, c"glGetString")?;
            unsafe {
                GLX_SWAP_BUFFERS.install(
                    hooks,
                    swap_buffers,
                    probe_glx_swap_buffers as GlxSwapBuffersFn as _,
                    shared,
                    Some(get_string),
                )?;
            }
        }

        CandidateKind::Vulkan => {
            let queue_present = vulkan::loader_symbol(modules, module, c"vkQueuePresentKHR")?;
            unsafe {
                VK_QUEUE_PRESENT.install(
                    hooks,
                    queue_present,
                    probe_vk_queue_present as vk::PFN_vkQueuePresentKHR as _,
                    shared,
                    None,
                )?;
            }

            vulkan::install_capture(hooks, modules, module, &shared.capture)?;
        }

        CandidateKind::Metal => {
            let runtime = ObjcRuntime::load(modules)?;
            let present = objc::drawable_present(&runtime, modules)?;
            unsafe {
                METAL_PRESENT.install(
                    hooks,
                    present,
                    probe_metal_present as PresentImp as _,
                    shared,
                    None,
                )?;
            }
        }
    }

    Ok(())
}

fn confirm_dxgi(shared: &Shared, swapchain: *mut c_void, flags: u32) {
    if flags & DXGI_PRESENT_TEST != 0 {
        return;
    }

    // gl or vulkan presenting through dxgi
    if FOREIGN_PRESENT.get() {
        trace!("ignoring dxgi present inside foreign present");
        return;
    }

    match unsafe { backend::device_api(swapchain) } {
        Some(api) => shared.confirm(CandidateKind::Dxgi, api),
        None => trace!("swap chain device is not a known direct3d device"),
    }
}

/// Confirm from `GL_VERSION` of the current context.
fn confirm_gl(shared: &Shared, kind: CandidateKind, api: Api, get_string: Option<FnPtr>) {
    let Some(get_string) = get_string else {
        return;
    };

    let version = unsafe { get_string.cast::<GetStringFn>()(GL_VERSION) };
    if version.is_null() {
        // no current context
        return;
    }

    let version = unsafe { CStr::from_ptr(version.cast()) };
    match opengl::parse_gl_version(version) {
        Some(parsed) if parsed >= shared.min_gl_version => shared.confirm(kind, api),
        Some(parsed) => {
            debug!("gl version {:?} is too old", parsed);
            shared.exhaust(kind);
        }
        None => trace!("unknown gl version {:?}", version),
    }
}

#[tracing::instrument]
extern "system" fn probe_dxgi_present(this: *mut c_void, sync_interval: u32, flags: u32) -> i32 {
    trace!("probe Present called");

    let entry = DXGI_PRESENT.wait();
    let _in_flight = entry.owner.in_flight.enter();
    let hr = unsafe { entry.trampoline.cast::<PresentFn>()(this, sync_interval, flags) };

    if hr >= 0 && DXGI_PRESENT.armed() {
        confirm_dxgi(&entry.owner, this, flags);
    }

    hr
}

#[tracing::instrument]
extern "system" fn probe_dxgi_present1(
    this: *mut c_void,
    sync_interval: u32,
    flags: u32,
    present_params: *const c_void,
) -> i32 {
    trace!("probe Present1 called");

    let entry = DXGI_PRESENT1.wait();
    let _in_flight = entry.owner.in_flight.enter();
    let hr = unsafe {
        entry.trampoline.cast::<Present1Fn>()(this, sync_interval, flags, present_params)
    };

    if hr >= 0 && DXGI_PRESENT1.armed() {
        confirm_dxgi(&entry.owner, this, flags);
    }

    hr
}

#[tracing::instrument]
extern "system" fn probe_dx9_end_scene(this: *mut c_void) -> i32 {
    trace!("probe EndScene called");

    let entry = DX9_END_SCENE.wait();
    let _in_flight = entry.owner.in_flight.enter();
    let hr = unsafe { entry.trampoline.cast::<EndSceneFn>()(this) };

    if hr >= 0 && DX9_END_SCENE.armed() {
        entry.owner.confirm(CandidateKind::Dx9, Api::Dx9);
    }

    hr
}

#[tracing::instrument]
extern "system" fn probe_wgl_swap_buffers(hdc: *mut c_void) -> c_int {
    trace!("probe wglSwapBuffers called");

    let entry = WGL_SWAP_BUFFERS.wait();
    let _in_flight = entry.owner.in_flight.enter();
    let res = with_foreign_present(|| unsafe {
        entry.trampoline.cast::<WglSwapBuffersFn>()(hdc)
    });

    if res != 0 && WGL_SWAP_BUFFERS.armed() {
        confirm_gl(&entry.owner, CandidateKind::Wgl, Api::OpenGl, entry.extra);
    }

    res
}

#[tracing::instrument]
extern "C" fn probe_glx_swap_buffers(dpy: *mut c_void, drawable: c_ulong) {
    trace!("probe glXSwapBuffers called");

    let entry = GLX_SWAP_BUFFERS.wait();
    let _in_flight = entry.owner.in_flight.enter();
    with_foreign_present(|| unsafe {
        entry.trampoline.cast::<GlxSwapBuffersFn>()(dpy, drawable)
    });

    if GLX_SWAP_BUFFERS.armed() {
        confirm_gl(&entry.owner, CandidateKind::Glx, Api::Glx, entry.extra);
    }
}

#[tracing::instrument]
unsafe extern "system" fn probe_vk_queue_present(
    queue: vk::Queue,
    present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    trace!("probe vkQueuePresentKHR called");

    let entry = VK_QUEUE_PRESENT.wait();
    let _in_flight = entry.owner.in_flight.enter();
    let res = with_foreign_present(|| unsafe {
        entry.trampoline.cast::<vk::PFN_vkQueuePresentKHR>()(queue, present_info)
    });

    if matches!(res, vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR) && VK_QUEUE_PRESENT.armed()
    {
        // the device of a queue retrieved before capture is unknown and cannot be drawn on
        if vulkan::queue_info(queue).is_some() {
            entry.owner.confirm(CandidateKind::Vulkan, Api::Vulkan);
        } else {
            debug!(?queue, "presenting queue was not captured");
            entry.owner.exhaust(CandidateKind::Vulkan);
        }
    }

    res
}

#[tracing::instrument]
extern "C" fn probe_metal_present(this: *mut c_void, sel: *mut c_void) {
    trace!("probe -[CAMetalDrawable present] called");

    let entry = METAL_PRESENT.wait();
    let _in_flight = entry.owner.in_flight.enter();
    unsafe { entry.trampoline.cast::<PresentImp>()(this, sel) };

    if METAL_PRESENT.armed() {
        entry.owner.confirm(CandidateKind::Metal, Api::Metal);
    }
}
