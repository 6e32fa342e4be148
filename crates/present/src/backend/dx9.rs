//! Direct3D 9 backend.
//!
//! Direct3D 9 has two frame boundaries, `EndScene` and `Present`. The backend latches onto
//! whichever is observed first and draws only from that one. Hosts may present through the
//! device or through `IDirect3DSwapChain9::Present`, both count as `Present`.

use core::{
    cell::Cell,
    ffi::c_void,
    ptr,
    sync::atomic::Ordering,
};
use std::sync::Arc;

use asdf_present_hook::{FnPtr, HookSet};
use scopeguard::defer;
use tracing::{debug, trace, warn};

use super::lifecycle::BackendCore;
use crate::{
    dispatch::Slot,
    error::{AttachError, ProbeError},
    frame::Frame,
    platform::{OffscreenDevices, Platform},
    renderer::Release,
    vtable::{self, ComObject, Guid, Interface},
};

pub(crate) const DEVICE9: Interface = Interface {
    name: "IDirect3DDevice9",
    slots: 119,
};
pub(crate) const DEVICE9EX: Interface = Interface {
    name: "IDirect3DDevice9Ex",
    slots: 134,
};

pub(crate) const SWAPCHAIN9: Interface = Interface {
    name: "IDirect3DSwapChain9",
    slots: 10,
};

pub(crate) const GET_SWAP_CHAIN: usize = 14;
pub(crate) const RESET: usize = 16;
pub(crate) const PRESENT: usize = 17;
pub(crate) const END_SCENE: usize = 42;
pub(crate) const PRESENT_EX: usize = 121;
pub(crate) const RESET_EX: usize = 132;

pub(crate) const SWAPCHAIN_PRESENT: usize = 3;
pub(crate) const SWAPCHAIN_GET_DEVICE: usize = 8;

pub(crate) const IID_DEVICE9EX: Guid = Guid::from_u128(0xb18b10ce_2649_405a_870f_95f777d4313a);

pub(crate) type EndSceneFn = unsafe extern "system" fn(*mut c_void) -> i32;
pub(crate) type PresentFn = unsafe extern "system" fn(
    *mut c_void,
    *const c_void,
    *const c_void,
    *mut c_void,
    *const c_void,
) -> i32;
pub(crate) type PresentExFn = unsafe extern "system" fn(
    *mut c_void,
    *const c_void,
    *const c_void,
    *mut c_void,
    *const c_void,
    u32,
) -> i32;
pub(crate) type SwapchainPresentFn = unsafe extern "system" fn(
    *mut c_void,
    *const c_void,
    *const c_void,
    *mut c_void,
    *const c_void,
    u32,
) -> i32;
type GetSwapChainFn = unsafe extern "system" fn(*mut c_void, u32, *mut *mut c_void) -> i32;
type GetDeviceFn = unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> i32;
pub(crate) type ResetFn = unsafe extern "system" fn(*mut c_void, *mut c_void) -> i32;
pub(crate) type ResetExFn =
    unsafe extern "system" fn(*mut c_void, *mut c_void, *mut c_void) -> i32;

const SIGNAL_NONE: u8 = 0;
const SIGNAL_END_SCENE: u8 = 1;
const SIGNAL_PRESENT: u8 = 2;

static END_SCENE_SLOT: Slot<BackendCore> = Slot::new();
static PRESENT_SLOT: Slot<BackendCore> = Slot::new();
static PRESENT_EX_SLOT: Slot<BackendCore> = Slot::new();
static RESET_SLOT: Slot<BackendCore> = Slot::new();
static RESET_EX_SLOT: Slot<BackendCore> = Slot::new();
static SWAPCHAIN_PRESENT_SLOT: Slot<BackendCore> = Slot::new();

pub(super) static SLOTS: [&Slot<BackendCore>; 6] = [
    &END_SCENE_SLOT,
    &PRESENT_SLOT,
    &PRESENT_EX_SLOT,
    &RESET_SLOT,
    &RESET_EX_SLOT,
    &SWAPCHAIN_PRESENT_SLOT,
];

thread_local! {
    static PRESENT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Run `f` with the number of present calls already running on this thread.
///
/// The runtime may forward a device present into its swap chain.
fn with_present_depth<R>(f: impl FnOnce(usize) -> R) -> R {
    let depth = PRESENT_DEPTH.get();
    PRESENT_DEPTH.set(depth + 1);
    defer!(PRESENT_DEPTH.set(depth));

    f(depth)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceEntries {
    pub end_scene: FnPtr,
    pub present: FnPtr,
    pub reset: FnPtr,
    pub present_ex: Option<FnPtr>,
    pub reset_ex: Option<FnPtr>,
    /// `Present` of the implicit swap chain.
    pub swapchain_present: Option<FnPtr>,
}

/// Implicit swap chain of `device`.
///
/// # Safety
/// `device` must be a live `IDirect3DDevice9`.
unsafe fn implicit_swapchain(device: *mut c_void) -> Option<ComObject> {
    let get_swap_chain = unsafe {
        vtable::read_slot(device, &DEVICE9, GET_SWAP_CHAIN)
            .ok()?
            .cast::<GetSwapChainFn>()
    };

    let mut swapchain = ptr::null_mut();
    if unsafe { get_swap_chain(device, 0, &mut swapchain) } < 0 {
        return None;
    }

    unsafe { ComObject::from_raw(swapchain) }
}

/// Device owning `swapchain`.
///
/// # Safety
/// `swapchain` must be a live `IDirect3DSwapChain9`.
unsafe fn swapchain_device(swapchain: *mut c_void) -> Option<ComObject> {
    let get_device = unsafe {
        vtable::read_slot(swapchain, &SWAPCHAIN9, SWAPCHAIN_GET_DEVICE)
            .ok()?
            .cast::<GetDeviceFn>()
    };

    let mut device = ptr::null_mut();
    if unsafe { get_device(swapchain, &mut device) } < 0 {
        return None;
    }

    unsafe { ComObject::from_raw(device) }
}

#[tracing::instrument(skip(offscreen))]
pub(crate) fn resolve_device(
    offscreen: &dyn OffscreenDevices,
) -> Result<DeviceEntries, ProbeError> {
    let device = offscreen.d3d9_device().map_err(ProbeError::Offscreen)?;
    let raw = device.as_raw();

    let (present_ex, reset_ex) = match device.query(&IID_DEVICE9EX) {
        Some(device_ex) => unsafe {
            (
                vtable::read_slot(device_ex.as_raw(), &DEVICE9EX, PRESENT_EX).ok(),
                vtable::read_slot(device_ex.as_raw(), &DEVICE9EX, RESET_EX).ok(),
            )
        },
        None => (None, None),
    };

    let swapchain_present = unsafe { implicit_swapchain(raw) }.and_then(|swapchain| unsafe {
        vtable::read_slot(swapchain.as_raw(), &SWAPCHAIN9, SWAPCHAIN_PRESENT).ok()
    });

    let entries = unsafe {
        DeviceEntries {
            end_scene: vtable::read_slot(raw, &DEVICE9, END_SCENE)?,
            present: vtable::read_slot(raw, &DEVICE9, PRESENT)?,
            reset: vtable::read_slot(raw, &DEVICE9, RESET)?,
            present_ex,
            reset_ex,
            swapchain_present,
        }
    };
    debug!("device entries: {:?}", entries);
    Ok(entries)
}

#[tracing::instrument(skip_all)]
pub(super) fn attach(
    core: &Arc<BackendCore>,
    hooks: &HookSet,
    platform: &Platform,
) -> Result<(), AttachError> {
    let entries = resolve_device(&*platform.offscreen)
        .map_err(AttachError::entry_point(core.api()))?;

    unsafe {
        END_SCENE_SLOT.install(
            hooks,
            entries.end_scene,
            hooked_end_scene as EndSceneFn as _,
            core,
            None,
        )?;
        PRESENT_SLOT.install(
            hooks,
            entries.present,
            hooked_present as PresentFn as _,
            core,
            None,
        )?;
        RESET_SLOT.install(hooks, entries.reset, hooked_reset as ResetFn as _, core, None)?;

        if let Some(present_ex) = entries.present_ex {
            PRESENT_EX_SLOT.install(
                hooks,
                present_ex,
                hooked_present_ex as PresentExFn as _,
                core,
                None,
            )?;
        }

        if let Some(reset_ex) = entries.reset_ex {
            RESET_EX_SLOT.install(
                hooks,
                reset_ex,
                hooked_reset_ex as ResetExFn as _,
                core,
                None,
            )?;
        }

        match entries.swapchain_present {
            Some(swapchain_present) => {
                SWAPCHAIN_PRESENT_SLOT.install(
                    hooks,
                    swapchain_present,
                    hooked_swapchain_present as SwapchainPresentFn as _,
                    core,
                    None,
                )?;
            }
            None => warn!("implicit swap chain unavailable, swap chain presents are not seen"),
        }
    }

    Ok(())
}

/// Latch `signal` if nothing is latched yet. Returns `true` if `signal` is the latched one.
fn latch(core: &BackendCore, signal: u8) -> bool {
    match core.dx9_signal.compare_exchange(
        SIGNAL_NONE,
        signal,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            debug!("frame signal latched: {signal}");
            true
        }
        Err(latched) => latched == signal,
    }
}

fn on_end_scene(core: &BackendCore, device: *mut c_void) {
    if !latch(core, SIGNAL_END_SCENE) {
        return;
    }

    // once presents are seen, draw on the first scene end of each frame only
    if core.dx9_presented.load(Ordering::Acquire) && core.dx9_drawn.swap(true, Ordering::AcqRel) {
        return;
    }

    core.render_frame(&Frame::Dx9 {
        device,
        in_scene: true,
    });
}

fn on_present(core: &BackendCore, device: *mut c_void) {
    if latch(core, SIGNAL_PRESENT) {
        core.render_frame(&Frame::Dx9 {
            device,
            in_scene: false,
        });
    } else {
        core.dx9_presented.store(true, Ordering::Release);
        core.dx9_drawn.store(false, Ordering::Release);
    }
}

#[tracing::instrument]
extern "system" fn hooked_end_scene(this: *mut c_void) -> i32 {
    trace!("EndScene called");

    let entry = END_SCENE_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if END_SCENE_SLOT.armed() {
            on_end_scene(&entry.owner, this);
        }
    }

    unsafe { entry.trampoline.cast::<EndSceneFn>()(this) }
}

#[tracing::instrument]
extern "system" fn hooked_present(
    this: *mut c_void,
    source_rect: *const c_void,
    dest_rect: *const c_void,
    dest_window: *mut c_void,
    dirty_region: *const c_void,
) -> i32 {
    trace!("Present called");

    let entry = PRESENT_SLOT.wait();
    with_present_depth(|depth| {
        {
            let _in_flight = entry.owner.in_flight.enter();
            if depth == 0 && PRESENT_SLOT.armed() {
                on_present(&entry.owner, this);
            }
        }

        unsafe {
            entry.trampoline.cast::<PresentFn>()(
                this,
                source_rect,
                dest_rect,
                dest_window,
                dirty_region,
            )
        }
    })
}

#[tracing::instrument]
extern "system" fn hooked_present_ex(
    this: *mut c_void,
    source_rect: *const c_void,
    dest_rect: *const c_void,
    dest_window: *mut c_void,
    dirty_region: *const c_void,
    flags: u32,
) -> i32 {
    trace!("PresentEx called");

    let entry = PRESENT_EX_SLOT.wait();
    with_present_depth(|depth| {
        {
            let _in_flight = entry.owner.in_flight.enter();
            if depth == 0 && PRESENT_EX_SLOT.armed() {
                on_present(&entry.owner, this);
            }
        }

        unsafe {
            entry.trampoline.cast::<PresentExFn>()(
                this,
                source_rect,
                dest_rect,
                dest_window,
                dirty_region,
                flags,
            )
        }
    })
}

#[tracing::instrument]
extern "system" fn hooked_swapchain_present(
    this: *mut c_void,
    source_rect: *const c_void,
    dest_rect: *const c_void,
    dest_window: *mut c_void,
    dirty_region: *const c_void,
    flags: u32,
) -> i32 {
    trace!("IDirect3DSwapChain9::Present called");

    let entry = SWAPCHAIN_PRESENT_SLOT.wait();
    with_present_depth(|depth| {
        {
            let _in_flight = entry.owner.in_flight.enter();
            if depth == 0 && SWAPCHAIN_PRESENT_SLOT.armed() {
                match unsafe { swapchain_device(this) } {
                    Some(device) => on_present(&entry.owner, device.as_raw()),
                    None => trace!("swap chain without device"),
                }
            }
        }

        unsafe {
            entry.trampoline.cast::<SwapchainPresentFn>()(
                this,
                source_rect,
                dest_rect,
                dest_window,
                dirty_region,
                flags,
            )
        }
    })
}

#[tracing::instrument]
extern "system" fn hooked_reset(this: *mut c_void, params: *mut c_void) -> i32 {
    trace!("Reset called");

    let entry = RESET_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if RESET_SLOT.armed() {
            entry.owner.reset(Release::RenderTargets);
        }
    }

    unsafe { entry.trampoline.cast::<ResetFn>()(this, params) }
}

#[tracing::instrument]
extern "system" fn hooked_reset_ex(
    this: *mut c_void,
    params: *mut c_void,
    fullscreen_mode: *mut c_void,
) -> i32 {
    trace!("ResetEx called");

    let entry = RESET_EX_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if RESET_EX_SLOT.armed() {
            entry.owner.reset(Release::RenderTargets);
        }
    }

    unsafe { entry.trampoline.cast::<ResetExFn>()(this, params, fullscreen_mode) }
}
