//! Direct3D 10, 11 and 12 backend, hooking the dxgi swap chain.

use core::{
    ffi::c_void,
    ptr,
    sync::atomic::Ordering,
};
use std::sync::Arc;

use asdf_present_hook::{FnPtr, HookSet};
use tracing::{debug, trace};

use super::lifecycle::BackendCore;
use crate::{
    dispatch::Slot,
    error::{AttachError, ProbeError},
    frame::Frame,
    platform::{OffscreenDevices, Platform},
    renderer::Release,
    types::Api,
    vtable::{self, Guid, Interface},
};

pub(crate) const SWAPCHAIN: Interface = Interface {
    name: "IDXGISwapChain",
    slots: 18,
};
pub(crate) const SWAPCHAIN1: Interface = Interface {
    name: "IDXGISwapChain1",
    slots: 29,
};
pub(crate) const SWAPCHAIN3: Interface = Interface {
    name: "IDXGISwapChain3",
    slots: 40,
};
pub(crate) const COMMAND_QUEUE: Interface = Interface {
    name: "ID3D12CommandQueue",
    slots: 19,
};

pub(crate) const GET_DEVICE: usize = 7;
pub(crate) const PRESENT: usize = 8;
pub(crate) const RESIZE_BUFFERS: usize = 13;
pub(crate) const PRESENT1: usize = 22;
pub(crate) const RESIZE_BUFFERS1: usize = 39;
pub(crate) const EXECUTE_COMMAND_LISTS: usize = 10;
pub(crate) const GET_DESC: usize = 18;

pub(crate) const IID_SWAPCHAIN1: Guid = Guid::from_u128(0x790a45f7_0d42_4876_983a_0a55cfe6f4aa);
pub(crate) const IID_SWAPCHAIN3: Guid = Guid::from_u128(0x94d99bdb_f1f8_4ab0_b236_7da0170edab1);
pub(crate) const IID_D3D12_DEVICE: Guid = Guid::from_u128(0x189819f1_1db6_4b57_be54_1821339b85f7);
pub(crate) const IID_D3D11_DEVICE: Guid = Guid::from_u128(0xdb6f6ddb_ac77_4e88_8253_819df9bbf140);
pub(crate) const IID_D3D10_DEVICE: Guid = Guid::from_u128(0x9b7e4c0f_342c_4106_a19f_4f2704f689f0);

/// `DXGI_PRESENT_TEST`. Presents nothing.
pub(crate) const DXGI_PRESENT_TEST: u32 = 0x1;

// D3D12_COMMAND_LIST_TYPE_DIRECT
const COMMAND_LIST_TYPE_DIRECT: i32 = 0;

pub(crate) type GetDeviceFn =
    unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> i32;
pub(crate) type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> i32;
pub(crate) type Present1Fn =
    unsafe extern "system" fn(*mut c_void, u32, u32, *const c_void) -> i32;
pub(crate) type ResizeBuffersFn =
    unsafe extern "system" fn(*mut c_void, u32, u32, u32, i32, u32) -> i32;
pub(crate) type ResizeBuffers1Fn = unsafe extern "system" fn(
    *mut c_void,
    u32,
    u32,
    u32,
    i32,
    u32,
    *const u32,
    *const *mut c_void,
) -> i32;
pub(crate) type ExecuteCommandListsFn =
    unsafe extern "system" fn(*mut c_void, u32, *const *mut c_void);

/// `D3D12_COMMAND_QUEUE_DESC`
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub(crate) struct CommandQueueDesc {
    pub kind: i32,
    pub priority: i32,
    pub flags: i32,
    pub node_mask: u32,
}

// struct returning methods take a hidden out pointer
pub(crate) type GetDescFn =
    unsafe extern "system" fn(*mut c_void, *mut CommandQueueDesc) -> *mut CommandQueueDesc;

static PRESENT_SLOT: Slot<BackendCore> = Slot::new();
static PRESENT1_SLOT: Slot<BackendCore> = Slot::new();
static RESIZE_BUFFERS_SLOT: Slot<BackendCore> = Slot::new();
static RESIZE_BUFFERS1_SLOT: Slot<BackendCore> = Slot::new();
static EXECUTE_COMMAND_LISTS_SLOT: Slot<BackendCore> = Slot::new();

pub(super) static SLOTS: [&Slot<BackendCore>; 5] = [
    &PRESENT_SLOT,
    &PRESENT1_SLOT,
    &RESIZE_BUFFERS_SLOT,
    &RESIZE_BUFFERS1_SLOT,
    &EXECUTE_COMMAND_LISTS_SLOT,
];

/// Swap chain methods read from an offscreen swap chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SwapChainEntries {
    pub present: FnPtr,
    pub present1: Option<FnPtr>,
    pub resize_buffers: FnPtr,
    pub resize_buffers1: Option<FnPtr>,
}

#[tracing::instrument(skip(offscreen))]
pub(crate) fn resolve_swapchain(
    offscreen: &dyn OffscreenDevices,
) -> Result<SwapChainEntries, ProbeError> {
    let swapchain = offscreen.dxgi_swapchain().map_err(ProbeError::Offscreen)?;
    let raw = swapchain.as_raw();

    let present = unsafe { vtable::read_slot(raw, &SWAPCHAIN, PRESENT)? };
    let resize_buffers = unsafe { vtable::read_slot(raw, &SWAPCHAIN, RESIZE_BUFFERS)? };

    let present1 = swapchain
        .query(&IID_SWAPCHAIN1)
        .and_then(|swapchain1| unsafe {
            vtable::read_slot(swapchain1.as_raw(), &SWAPCHAIN1, PRESENT1).ok()
        });
    let resize_buffers1 = swapchain
        .query(&IID_SWAPCHAIN3)
        .and_then(|swapchain3| unsafe {
            vtable::read_slot(swapchain3.as_raw(), &SWAPCHAIN3, RESIZE_BUFFERS1).ok()
        });

    let entries = SwapChainEntries {
        present,
        present1,
        resize_buffers,
        resize_buffers1,
    };
    debug!("swap chain entries: {:?}", entries);
    Ok(entries)
}

#[tracing::instrument(skip(offscreen))]
pub(crate) fn resolve_execute_command_lists(
    offscreen: &dyn OffscreenDevices,
) -> Result<FnPtr, ProbeError> {
    let queue = offscreen
        .d3d12_command_queue()
        .map_err(ProbeError::Offscreen)?;

    unsafe { vtable::read_slot(queue.as_raw(), &COMMAND_QUEUE, EXECUTE_COMMAND_LISTS) }
}

/// Find the Direct3D version of the device owning `swapchain`.
///
/// # Safety
/// `swapchain` must be a live `IDXGISwapChain`.
pub(crate) unsafe fn device_api(swapchain: *mut c_void) -> Option<Api> {
    let get_device = unsafe { vtable::read_slot(swapchain, &SWAPCHAIN, GET_DEVICE).ok()? };
    let get_device = unsafe { get_device.cast::<GetDeviceFn>() };

    [
        (&IID_D3D12_DEVICE, Api::Dx12),
        (&IID_D3D11_DEVICE, Api::Dx11),
        (&IID_D3D10_DEVICE, Api::Dx10),
    ]
    .into_iter()
    .find_map(|(iid, api)| {
        let mut device = ptr::null_mut();
        if unsafe { get_device(swapchain, iid, &mut device) } < 0 || device.is_null() {
            return None;
        }

        unsafe { vtable::release(device) };
        Some(api)
    })
}

#[tracing::instrument(skip_all)]
pub(super) fn attach(
    core: &Arc<BackendCore>,
    hooks: &HookSet,
    platform: &Platform,
) -> Result<(), AttachError> {
    let entries = resolve_swapchain(&*platform.offscreen)
        .map_err(AttachError::entry_point(core.api()))?;

    // queue must be captured before the first frame can be drawn
    if core.api() == Api::Dx12 {
        let execute_command_lists = resolve_execute_command_lists(&*platform.offscreen)
            .map_err(AttachError::entry_point(core.api()))?;

        unsafe {
            EXECUTE_COMMAND_LISTS_SLOT.install(
                hooks,
                execute_command_lists,
                hooked_execute_command_lists as ExecuteCommandListsFn as _,
                core,
                None,
            )?;
        }
    }

    unsafe {
        PRESENT_SLOT.install(
            hooks,
            entries.present,
            hooked_present as PresentFn as _,
            core,
            None,
        )?;

        RESIZE_BUFFERS_SLOT.install(
            hooks,
            entries.resize_buffers,
            hooked_resize_buffers as ResizeBuffersFn as _,
            core,
            None,
        )?;

        if let Some(present1) = entries.present1 {
            PRESENT1_SLOT.install(
                hooks,
                present1,
                hooked_present1 as Present1Fn as _,
                core,
                None,
            )?;
        }

        if let Some(resize_buffers1) = entries.resize_buffers1 {
            RESIZE_BUFFERS1_SLOT.install(
                hooks,
                resize_buffers1,
                hooked_resize_buffers1 as ResizeBuffers1Fn as _,
                core,
                None,
            )?;
        }
    }

    Ok(())
}

fn draw(core: &BackendCore, swapchain: *mut c_void, flags: u32) {
    if flags & DXGI_PRESENT_TEST != 0 {
        return;
    }

    let queue = match core.api() {
        Api::Dx12 => {
            let queue = core.dx12_queue.load(Ordering::Acquire);
            if queue.is_null() {
                trace!("command queue not captured yet");
                return;
            }

            Some(queue)
        }

        _ => None,
    };

    core.render_frame(&Frame::Dxgi { swapchain, queue });
}

fn resize(core: &BackendCore) {
    core.reset(Release::RenderTargets);
    core.dx12_queue.store(ptr::null_mut(), Ordering::Release);
}

#[tracing::instrument]
extern "system" fn hooked_present(this: *mut c_void, sync_interval: u32, flags: u32) -> i32 {
    trace!("Present called");

    let entry = PRESENT_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if PRESENT_SLOT.armed() {
            draw(&entry.owner, this, flags);
        }
    }

    unsafe { entry.trampoline.cast::<PresentFn>()(this, sync_interval, flags) }
}

#[tracing::instrument]
extern "system" fn hooked_present1(
    this: *mut c_void,
    sync_interval: u32,
    flags: u32,
    present_params: *const c_void,
) -> i32 {
    trace!("Present1 called");

    let entry = PRESENT1_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if PRESENT1_SLOT.armed() {
            draw(&entry.owner, this, flags);
        }
    }

    unsafe { entry.trampoline.cast::<Present1Fn>()(this, sync_interval, flags, present_params) }
}

#[tracing::instrument]
extern "system" fn hooked_resize_buffers(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: i32,
    flags: u32,
) -> i32 {
    trace!("ResizeBuffers called");

    let entry = RESIZE_BUFFERS_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if RESIZE_BUFFERS_SLOT.armed() {
            resize(&entry.owner);
        }
    }

    unsafe {
        entry.trampoline.cast::<ResizeBuffersFn>()(
            this,
            buffer_count,
            width,
            height,
            format,
            flags,
        )
    }
}

#[tracing::instrument]
extern "system" fn hooked_resize_buffers1(
    this: *mut c_void,
    buffer_count: u32,
    width: u32,
    height: u32,
    format: i32,
    flags: u32,
    creation_node_mask: *const u32,
    present_queue: *const *mut c_void,
) -> i32 {
    trace!("ResizeBuffers1 called");

    let entry = RESIZE_BUFFERS1_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if RESIZE_BUFFERS1_SLOT.armed() {
            resize(&entry.owner);
        }
    }

    unsafe {
        entry.trampoline.cast::<ResizeBuffers1Fn>()(
            this,
            buffer_count,
            width,
            height,
            format,
            flags,
            creation_node_mask,
            present_queue,
        )
    }
}

/// `true` for queues accepting direct command lists.
unsafe fn is_direct_queue(queue: *mut c_void) -> bool {
    let Ok(get_desc) = (unsafe { vtable::read_slot(queue, &COMMAND_QUEUE, GET_DESC) }) else {
        return false;
    };

    let mut desc = CommandQueueDesc::default();
    unsafe { get_desc.cast::<GetDescFn>()(queue, &mut desc) };
    desc.kind == COMMAND_LIST_TYPE_DIRECT
}

#[tracing::instrument]
extern "system" fn hooked_execute_command_lists(
    this: *mut c_void,
    count: u32,
    lists: *const *mut c_void,
) {
    trace!("ExecuteCommandLists called");

    let entry = EXECUTE_COMMAND_LISTS_SLOT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if EXECUTE_COMMAND_LISTS_SLOT.armed()
            && entry.owner.dx12_queue.load(Ordering::Acquire).is_null()
            && unsafe { is_direct_queue(this) }
            && entry
                .owner
                .dx12_queue
                .compare_exchange(ptr::null_mut(), this, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!("direct command queue captured: {:p}", this);
        }
    }

    unsafe { entry.trampoline.cast::<ExecuteCommandListsFn>()(this, count, lists) }
}

/// Submit command lists without passing through the capture hook.
///
/// # Safety
/// `queue` must be a live `ID3D12CommandQueue` and `lists` must point to `count` command lists.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) unsafe fn call_original_execute_command_lists(
    queue: *mut c_void,
    count: u32,
    lists: *const *mut c_void,
) {
    let func = match EXECUTE_COMMAND_LISTS_SLOT.owner() {
        Some(_) => EXECUTE_COMMAND_LISTS_SLOT.wait().trampoline,
        None => match unsafe { vtable::read_slot(queue, &COMMAND_QUEUE, EXECUTE_COMMAND_LISTS) } {
            Ok(func) => func,
            Err(err) => {
                tracing::error!("cannot submit command lists. {err}");
                return;
            }
        },
    };

    unsafe { func.cast::<ExecuteCommandListsFn>()(queue, count, lists) }
}
