//! Vulkan backend.
//!
//! `vkQueuePresentKHR` does not expose the device, so device, queue and swap chain creation are
//! captured into process wide maps. The capture hooks are installed by the Vulkan probe too, so
//! objects created while probing are known once the backend attaches. A queue retrieved before
//! the probe was installed is never known, its presents do not confirm Vulkan.

use core::{cell::Cell, ffi::CStr, ptr, time::Duration};
use std::sync::Arc;

use ash::vk::{self, Handle};
use asdf_present_hook::{FnPtr, HookSet};
use once_cell::sync::Lazy;
use tracing::{debug, trace};

use super::lifecycle::BackendCore;
use crate::{
    dispatch::{InFlight, Slot},
    error::{AttachError, ProbeError},
    frame::Frame,
    module::{self, ModuleHandle, ModuleIntrospection},
    platform::Platform,
    renderer::Release,
    types::{CandidateKind, IntDashMap},
};

/// Device created by the host.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceInfo {
    pub physical_device: vk::PhysicalDevice,
}

/// Queue retrieved by the host.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueInfo {
    pub device: vk::Device,
    pub family: u32,
}

/// Swap chain created by the host.
#[derive(Clone, Copy)]
pub(crate) struct SwapchainInfo {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

static DEVICES: Lazy<IntDashMap<u64, DeviceInfo>> = Lazy::new(IntDashMap::default);
static QUEUES: Lazy<IntDashMap<u64, QueueInfo>> = Lazy::new(IntDashMap::default);
static SWAPCHAINS: Lazy<IntDashMap<u64, SwapchainInfo>> = Lazy::new(IntDashMap::default);

pub(crate) fn device_info(device: vk::Device) -> Option<DeviceInfo> {
    DEVICES.get(&device.as_raw()).map(|entry| *entry)
}

pub(crate) fn queue_info(queue: vk::Queue) -> Option<QueueInfo> {
    QUEUES.get(&queue.as_raw()).map(|entry| *entry)
}

pub(crate) fn swapchain_info(swapchain: vk::SwapchainKHR) -> Option<SwapchainInfo> {
    SWAPCHAINS.get(&swapchain.as_raw()).map(|entry| *entry)
}

/// Owner of capture hooks installed into one hook set.
#[derive(Debug, Default)]
pub(crate) struct Capture {
    in_flight: InFlight,
}

static CREATE_DEVICE: Slot<Capture> = Slot::new();
static GET_DEVICE_QUEUE: Slot<Capture> = Slot::new();
static CREATE_SWAPCHAIN: Slot<Capture> = Slot::new();

static CAPTURE_SLOTS: [&Slot<Capture>; 3] = [&CREATE_DEVICE, &GET_DEVICE_QUEUE, &CREATE_SWAPCHAIN];

static QUEUE_PRESENT: Slot<BackendCore> = Slot::new();
static DESTROY_SWAPCHAIN: Slot<BackendCore> = Slot::new();

pub(super) static SLOTS: [&Slot<BackendCore>; 2] = [&QUEUE_PRESENT, &DESTROY_SWAPCHAIN];

pub(crate) fn loader(modules: &dyn ModuleIntrospection) -> Result<ModuleHandle, ProbeError> {
    module::first_loaded(modules, CandidateKind::Vulkan.modules())
        .map(|(_, handle)| handle)
        .ok_or(ProbeError::SymbolMissing(CandidateKind::Vulkan.name()))
}

pub(crate) fn loader_symbol(
    modules: &dyn ModuleIntrospection,
    loader: ModuleHandle,
    name: &'static CStr,
) -> Result<FnPtr, ProbeError> {
    modules
        .symbol(loader, name)
        .ok_or_else(|| ProbeError::SymbolMissing(name.to_str().unwrap_or("?")))
}

/// Install device, queue and swap chain capture hooks into `hooks` on behalf of `owner`.
#[tracing::instrument(skip_all)]
pub(crate) fn install_capture(
    hooks: &HookSet,
    modules: &dyn ModuleIntrospection,
    loader: ModuleHandle,
    owner: &Arc<Capture>,
) -> Result<(), ProbeError> {
    let create_device = loader_symbol(modules, loader, c"vkCreateDevice")?;
    let get_device_queue = loader_symbol(modules, loader, c"vkGetDeviceQueue")?;
    let create_swapchain = loader_symbol(modules, loader, c"vkCreateSwapchainKHR")?;

    unsafe {
        CREATE_DEVICE.install(
            hooks,
            create_device,
            hooked_create_device as vk::PFN_vkCreateDevice as _,
            owner,
            None,
        )?;
        GET_DEVICE_QUEUE.install(
            hooks,
            get_device_queue,
            hooked_get_device_queue as vk::PFN_vkGetDeviceQueue as _,
            owner,
            None,
        )?;
        CREATE_SWAPCHAIN.install(
            hooks,
            create_swapchain,
            hooked_create_swapchain as vk::PFN_vkCreateSwapchainKHR as _,
            owner,
            None,
        )?;
    }

    Ok(())
}

/// Disarm the capture hooks of `owner`. Called before the hook set owning them removes its
/// hooks.
pub(crate) fn disarm_capture(owner: &Arc<Capture>) {
    for slot in CAPTURE_SLOTS {
        slot.disarm_owned(owner);
    }
}

/// Wait for running capture hooks of `owner` after removal.
pub(crate) fn drain_capture(owner: &Capture, timeout: Duration) -> bool {
    owner.in_flight.drain(timeout)
}

#[tracing::instrument(skip_all)]
pub(super) fn attach(
    core: &Arc<BackendCore>,
    hooks: &HookSet,
    platform: &Platform,
) -> Result<(), AttachError> {
    let modules = &*platform.modules;
    let entry_point = || AttachError::entry_point(core.api());

    let loader = loader(modules).map_err(entry_point())?;
    let queue_present =
        loader_symbol(modules, loader, c"vkQueuePresentKHR").map_err(entry_point())?;
    let destroy_swapchain =
        loader_symbol(modules, loader, c"vkDestroySwapchainKHR").map_err(entry_point())?;

    install_capture(hooks, modules, loader, &core.vk_capture).map_err(|err| match err {
        ProbeError::Hook(err) => AttachError::Hook(err),
        err => entry_point()(err),
    })?;

    unsafe {
        QUEUE_PRESENT.install(
            hooks,
            queue_present,
            hooked_queue_present as vk::PFN_vkQueuePresentKHR as _,
            core,
            None,
        )?;
        DESTROY_SWAPCHAIN.install(
            hooks,
            destroy_swapchain,
            hooked_destroy_swapchain as vk::PFN_vkDestroySwapchainKHR as _,
            core,
            None,
        )?;
    }

    Ok(())
}

#[tracing::instrument]
unsafe extern "system" fn hooked_create_device(
    physical_device: vk::PhysicalDevice,
    create_info: *const vk::DeviceCreateInfo<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    device: *mut vk::Device,
) -> vk::Result {
    trace!("vkCreateDevice called");

    let entry = CREATE_DEVICE.wait();
    let _in_flight = entry.owner.in_flight.enter();
    let res = unsafe {
        entry.trampoline.cast::<vk::PFN_vkCreateDevice>()(
            physical_device,
            create_info,
            allocator,
            device,
        )
    };

    if res == vk::Result::SUCCESS && !device.is_null() {
        let device = unsafe { *device };
        debug!("device captured: {:?}", device);
        DEVICES.insert(device.as_raw(), DeviceInfo { physical_device });
    }

    res
}

#[tracing::instrument]
unsafe extern "system" fn hooked_get_device_queue(
    device: vk::Device,
    family: u32,
    index: u32,
    queue: *mut vk::Queue,
) {
    trace!("vkGetDeviceQueue called");

    let entry = GET_DEVICE_QUEUE.wait();
    let _in_flight = entry.owner.in_flight.enter();
    unsafe { entry.trampoline.cast::<vk::PFN_vkGetDeviceQueue>()(device, family, index, queue) };

    if !queue.is_null() {
        let queue = unsafe { *queue };
        if queue != vk::Queue::null() {
            QUEUES.insert(queue.as_raw(), QueueInfo { device, family });
        }
    }
}

#[tracing::instrument]
unsafe extern "system" fn hooked_create_swapchain(
    device: vk::Device,
    create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    allocator: *const vk::AllocationCallbacks<'_>,
    swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    trace!("vkCreateSwapchainKHR called");

    let entry = CREATE_SWAPCHAIN.wait();
    let _in_flight = entry.owner.in_flight.enter();
    let res = unsafe {
        entry.trampoline.cast::<vk::PFN_vkCreateSwapchainKHR>()(
            device,
            create_info,
            allocator,
            swapchain,
        )
    };

    if res == vk::Result::SUCCESS && !swapchain.is_null() && !create_info.is_null() {
        let (swapchain, info) = unsafe { (*swapchain, &*create_info) };
        debug!("swap chain captured: {:?}", swapchain);
        SWAPCHAINS.insert(
            swapchain.as_raw(),
            SwapchainInfo {
                format: info.image_format,
                extent: info.image_extent,
            },
        );
    }

    res
}

#[tracing::instrument]
unsafe extern "system" fn hooked_destroy_swapchain(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    allocator: *const vk::AllocationCallbacks<'_>,
) {
    trace!("vkDestroySwapchainKHR called");

    let entry = DESTROY_SWAPCHAIN.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if DESTROY_SWAPCHAIN.armed() {
            entry.owner.reset(Release::RenderTargets);
        }
        SWAPCHAINS.remove(&swapchain.as_raw());
    }

    unsafe {
        entry.trampoline.cast::<vk::PFN_vkDestroySwapchainKHR>()(device, swapchain, allocator)
    }
}

#[tracing::instrument]
unsafe extern "system" fn hooked_queue_present(
    queue: vk::Queue,
    present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    trace!("vkQueuePresentKHR called");

    let entry = QUEUE_PRESENT.wait();
    let original = unsafe { entry.trampoline.cast::<vk::PFN_vkQueuePresentKHR>() };

    let wait = Cell::new(vk::Semaphore::null());
    {
        let _in_flight = entry.owner.in_flight.enter();
        if QUEUE_PRESENT.armed() && !present_info.is_null() {
            entry.owner.render_frame(&Frame::Vulkan {
                queue,
                present_info: unsafe { &*present_info },
                wait: &wait,
            });
        }
    }

    let semaphore = wait.get();
    if semaphore == vk::Semaphore::null() {
        return unsafe { original(queue, present_info) };
    }

    // overlay commands waited on the host semaphores, present waits on ours instead
    let mut info = unsafe { *present_info };
    info.wait_semaphore_count = 1;
    info.p_wait_semaphores = ptr::from_ref(&semaphore);
    unsafe { original(queue, &info) }
}
