//! In process fakes of the host process.
//!
//! Hooks are simulated by [`RoutingPatcher`]: it never touches code, instead [`routed`] looks up
//! where a call to a fake host function currently lands. Dispatch slots are process wide, so
//! every test holds a [`Fixture`] which serializes them.

#![allow(dead_code)]

use core::{
    ffi::{CStr, c_char, c_int, c_uint, c_ulong, c_void},
    ptr,
    sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    collections::HashMap,
    ffi::CString,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Instant,
};

use anyhow::bail;
use ash::vk::{self, Handle};
use asdf_present::{
    Api, ComObject, DetectConfig, DetectionSession, DriverFactory, Frame, FrameContext,
    DetectOutcome, ImageHandle, ModuleHandle, ModuleIntrospection, NativeTarget, NativeTexture,
    OffscreenDevices, Overlay, OverlayState, PendingDetection, Platform, Release, RenderDriver,
    frame,
    hook::{FnPtr, Patcher},
    vtable::Guid,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

pub const IID_SWAPCHAIN1: Guid = Guid::from_u128(0x790a45f7_0d42_4876_983a_0a55cfe6f4aa);
pub const IID_SWAPCHAIN3: Guid = Guid::from_u128(0x94d99bdb_f1f8_4ab0_b236_7da0170edab1);
pub const IID_D3D12_DEVICE: Guid = Guid::from_u128(0x189819f1_1db6_4b57_be54_1821339b85f7);
pub const IID_D3D11_DEVICE: Guid = Guid::from_u128(0xdb6f6ddb_ac77_4e88_8253_819df9bbf140);
pub const IID_D3D10_DEVICE: Guid = Guid::from_u128(0x9b7e4c0f_342c_4106_a19f_4f2704f689f0);

pub const DXGI_PRESENT_TEST: u32 = 0x1;
pub const COMMAND_LIST_TYPE_DIRECT: i32 = 0;
pub const COMMAND_LIST_TYPE_COPY: i32 = 3;
pub const WGL_SWAP_MAIN_PLANE: c_uint = 0x1;

const E_NOINTERFACE: i32 = 0x80004002_u32 as i32;
const E_NOTIMPL: i32 = 0x80004001_u32 as i32;

pub type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> i32;
pub type Present1Fn = unsafe extern "system" fn(*mut c_void, u32, u32, *const c_void) -> i32;
pub type ResizeBuffersFn = unsafe extern "system" fn(*mut c_void, u32, u32, u32, i32, u32) -> i32;
pub type ExecuteCommandListsFn = unsafe extern "system" fn(*mut c_void, u32, *const *mut c_void);
pub type EndSceneFn = unsafe extern "system" fn(*mut c_void) -> i32;
pub type D3d9PresentFn = unsafe extern "system" fn(
    *mut c_void,
    *const c_void,
    *const c_void,
    *mut c_void,
    *const c_void,
) -> i32;
pub type D3d9SwapchainPresentFn = unsafe extern "system" fn(
    *mut c_void,
    *const c_void,
    *const c_void,
    *mut c_void,
    *const c_void,
    u32,
) -> i32;
pub type D3d9ResetFn = unsafe extern "system" fn(*mut c_void, *mut c_void) -> i32;
pub type WglSwapBuffersFn = unsafe extern "system" fn(*mut c_void) -> c_int;
pub type WglSwapLayerBuffersFn = unsafe extern "system" fn(*mut c_void, c_uint) -> c_int;
pub type WglDeleteContextFn = unsafe extern "system" fn(*mut c_void) -> c_int;
pub type GetStringFn = unsafe extern "system" fn(c_uint) -> *const u8;
pub type GetCurrentContextFn = unsafe extern "system" fn() -> *mut c_void;
pub type GlxSwapBuffersFn = unsafe extern "C" fn(*mut c_void, c_ulong);
pub type GlxDestroyContextFn = unsafe extern "C" fn(*mut c_void, *mut c_void);
pub type MetalPresentFn = unsafe extern "C" fn(*mut c_void, *mut c_void);

/// Test fast settings.
pub fn config() -> DetectConfig {
    DetectConfig {
        tick: Duration::from_millis(5),
        timeout: Duration::from_secs(10),
        cancel_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(1),
        ..DetectConfig::default()
    }
}

/// Poll `f` until it returns `true`. Returns `false` on timeout.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !f() {
        if Instant::now() >= deadline {
            return false;
        }

        thread::sleep(Duration::from_millis(1));
    }

    true
}

/// Call `frame` until `pending` resolves, as a host render loop would.
pub fn drive(pending: &PendingDetection, mut frame: impl FnMut()) -> DetectOutcome {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(outcome) = pending.try_outcome() {
            return outcome;
        }

        assert!(Instant::now() < deadline, "detection did not resolve");
        frame();
        thread::sleep(Duration::from_millis(1));
    }
}

/// Patch primitive redirecting calls made through [`routed`].
#[derive(Default)]
pub struct RoutingPatcher {
    routes: Mutex<HashMap<FnPtr, FnPtr>>,
    failing: Mutex<Vec<FnPtr>>,
    installs: Mutex<HashMap<FnPtr, usize>>,
}

impl RoutingPatcher {
    /// Where a call of `target` lands.
    pub fn route(&self, target: FnPtr) -> FnPtr {
        self.routes.lock().get(&target).copied().unwrap_or(target)
    }

    pub fn is_hooked(&self, target: FnPtr) -> bool {
        self.routes.lock().contains_key(&target)
    }

    /// Number of currently hooked targets.
    pub fn active(&self) -> usize {
        self.routes.lock().len()
    }

    /// Number of times `target` was ever hooked.
    pub fn installs_of(&self, target: FnPtr) -> usize {
        self.installs.lock().get(&target).copied().unwrap_or(0)
    }

    pub fn total_installs(&self) -> usize {
        self.installs.lock().values().sum()
    }

    /// Make every later install of `target` fail.
    pub fn fail(&self, target: FnPtr) {
        self.failing.lock().push(target);
    }

    fn reset(&self) {
        self.routes.lock().clear();
        self.failing.lock().clear();
        self.installs.lock().clear();
    }
}

impl Patcher for RoutingPatcher {
    unsafe fn install(&self, target: FnPtr, replacement: FnPtr) -> Option<FnPtr> {
        if self.failing.lock().contains(&target) {
            return None;
        }

        self.routes.lock().insert(target, replacement);
        *self.installs.lock().entry(target).or_default() += 1;
        // code of the fake is never patched, the original stays callable
        Some(target)
    }

    unsafe fn remove(&self, target: FnPtr) -> bool {
        self.routes.lock().remove(&target).is_some()
    }
}

pub static PATCHER: Lazy<Arc<RoutingPatcher>> = Lazy::new(Default::default);

/// Resolve where a call of the fake host function `func` lands.
pub fn routed<F: Copy>(func: F) -> F {
    let target = FnPtr::of(func).expect("function pointer");
    unsafe { PATCHER.route(target).cast::<F>() }
}

pub fn fn_ptr<F: Copy>(func: F) -> FnPtr {
    FnPtr::of(func).expect("function pointer")
}

/// Calls made into the fake host functions.
#[derive(Default)]
pub struct Calls {
    pub present: AtomicUsize,
    pub present1: AtomicUsize,
    pub resize_buffers: AtomicUsize,
    pub execute_command_lists: AtomicUsize,
    pub end_scene: AtomicUsize,
    pub d3d9_present: AtomicUsize,
    pub d3d9_swapchain_present: AtomicUsize,
    pub d3d9_reset: AtomicUsize,
    pub swap_buffers: AtomicUsize,
    pub swap_layer_buffers: AtomicUsize,
    pub delete_context: AtomicUsize,
    pub glx_swap_buffers: AtomicUsize,
    pub glx_destroy_context: AtomicUsize,
    pub vk_queue_present: AtomicUsize,
    pub vk_destroy_swapchain: AtomicUsize,
    pub metal_present: AtomicUsize,
}

impl Calls {
    fn reset(&self) {
        for counter in [
            &self.present,
            &self.present1,
            &self.resize_buffers,
            &self.execute_command_lists,
            &self.end_scene,
            &self.d3d9_present,
            &self.d3d9_swapchain_present,
            &self.d3d9_reset,
            &self.swap_buffers,
            &self.swap_layer_buffers,
            &self.delete_context,
            &self.glx_swap_buffers,
            &self.glx_destroy_context,
            &self.vk_queue_present,
            &self.vk_destroy_swapchain,
            &self.metal_present,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

pub static CALLS: Lazy<Calls> = Lazy::new(Default::default);

static GL_VERSION: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
static CURRENT_CONTEXT: AtomicUsize = AtomicUsize::new(0);
/// Swap chain presented from inside the fake `wglSwapBuffers`, as some drivers do.
static NESTED_SWAPCHAIN: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

pub fn set_gl_version(version: &'static CStr) {
    GL_VERSION.store(version.as_ptr() as *mut u8, Ordering::SeqCst);
}

pub fn set_current_context(context: usize) {
    CURRENT_CONTEXT.store(context, Ordering::SeqCst);
}

pub fn present_inside_swap(swapchain: Option<&'static FakeCom>) {
    NESTED_SWAPCHAIN.store(
        swapchain.map_or(ptr::null_mut(), FakeCom::as_raw),
        Ordering::SeqCst,
    );
}

/// Fake COM object with a real method table.
#[repr(C)]
pub struct FakeCom {
    vtable: *const *const c_void,
    refs: AtomicU32,
    /// Interfaces `QueryInterface` answers with this object.
    interfaces: Vec<Guid>,
    /// Devices `GetDevice` answers.
    devices: Vec<Guid>,
    /// `D3D12_COMMAND_QUEUE_DESC::Type` reported by `GetDesc`.
    queue_kind: i32,
    /// Implicit swap chain of a Direct3D 9 device, or the device of its swap chain.
    link: AtomicPtr<c_void>,
}

unsafe impl Send for FakeCom {}
unsafe impl Sync for FakeCom {}

impl FakeCom {
    fn leak(
        slots: usize,
        methods: &[(usize, *const c_void)],
        interfaces: &[Guid],
        devices: &[Guid],
        queue_kind: i32,
    ) -> &'static FakeCom {
        let mut vtable = vec![unused_method as EndSceneFn as *const c_void; slots];
        vtable[0] = query_interface as *const c_void;
        vtable[1] = add_ref as *const c_void;
        vtable[2] = release as *const c_void;
        for &(slot, method) in methods {
            vtable[slot] = method;
        }

        Box::leak(Box::new(FakeCom {
            vtable: Box::leak(vtable.into_boxed_slice()).as_ptr(),
            refs: AtomicU32::new(1),
            interfaces: interfaces.to_vec(),
            devices: devices.to_vec(),
            queue_kind,
            link: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    pub fn as_raw(&'static self) -> *mut c_void {
        ptr::from_ref(self).cast_mut().cast()
    }

    /// New owned reference.
    pub fn com(&'static self) -> ComObject {
        self.refs.fetch_add(1, Ordering::SeqCst);
        unsafe { ComObject::from_raw(self.as_raw()) }.expect("non null object")
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    fn linked(&self) -> Option<&'static FakeCom> {
        let link = self.link.load(Ordering::SeqCst);
        (!link.is_null()).then(|| unsafe { this(link) })
    }
}

unsafe fn this<'a>(object: *mut c_void) -> &'a FakeCom {
    unsafe { &*object.cast::<FakeCom>() }
}

extern "system" fn query_interface(
    object: *mut c_void,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> i32 {
    unsafe {
        let object_ref = this(object);
        if object_ref.interfaces.contains(&*iid) {
            object_ref.refs.fetch_add(1, Ordering::SeqCst);
            *out = object;
            0
        } else {
            *out = ptr::null_mut();
            E_NOINTERFACE
        }
    }
}

extern "system" fn add_ref(object: *mut c_void) -> u32 {
    unsafe { this(object).refs.fetch_add(1, Ordering::SeqCst) + 1 }
}

extern "system" fn release(object: *mut c_void) -> u32 {
    unsafe { this(object).refs.fetch_sub(1, Ordering::SeqCst) - 1 }
}

extern "system" fn unused_method(_: *mut c_void) -> i32 {
    E_NOTIMPL
}

static DEVICE: Lazy<&'static FakeCom> = Lazy::new(|| FakeCom::leak(3, &[], &[], &[], 0));

extern "system" fn get_device(object: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32 {
    unsafe {
        if this(object).devices.contains(&*iid) {
            *out = DEVICE.com().into_raw();
            0
        } else {
            *out = ptr::null_mut();
            E_NOINTERFACE
        }
    }
}

extern "system" fn fake_present(_: *mut c_void, _: u32, _: u32) -> i32 {
    CALLS.present.fetch_add(1, Ordering::SeqCst);
    0
}

extern "system" fn fake_present1(_: *mut c_void, _: u32, _: u32, _: *const c_void) -> i32 {
    CALLS.present1.fetch_add(1, Ordering::SeqCst);
    0
}

extern "system" fn fake_resize_buffers(
    _: *mut c_void,
    _: u32,
    _: u32,
    _: u32,
    _: i32,
    _: u32,
) -> i32 {
    CALLS.resize_buffers.fetch_add(1, Ordering::SeqCst);
    0
}

extern "system" fn fake_resize_buffers1(
    _: *mut c_void,
    _: u32,
    _: u32,
    _: u32,
    _: i32,
    _: u32,
    _: *const u32,
    _: *const *mut c_void,
) -> i32 {
    CALLS.resize_buffers.fetch_add(1, Ordering::SeqCst);
    0
}

/// Swap chain whose `GetDevice` answers `devices`.
pub fn swapchain(devices: &[Guid]) -> &'static FakeCom {
    FakeCom::leak(
        40,
        &[
            (7, get_device as *const c_void),
            (8, fake_present as PresentFn as *const c_void),
            (13, fake_resize_buffers as ResizeBuffersFn as *const c_void),
            (22, fake_present1 as Present1Fn as *const c_void),
            (39, fake_resize_buffers1 as *const c_void),
        ],
        &[IID_SWAPCHAIN1, IID_SWAPCHAIN3],
        devices,
        0,
    )
}

#[repr(C)]
struct CommandQueueDesc {
    kind: i32,
    priority: i32,
    flags: i32,
    node_mask: u32,
}

extern "system" fn get_desc(
    object: *mut c_void,
    out: *mut CommandQueueDesc,
) -> *mut CommandQueueDesc {
    unsafe {
        (*out).kind = this(object).queue_kind;
        (*out).priority = 0;
        (*out).flags = 0;
        (*out).node_mask = 0;
    }
    out
}

extern "system" fn fake_execute_command_lists(_: *mut c_void, _: u32, _: *const *mut c_void) {
    CALLS.execute_command_lists.fetch_add(1, Ordering::SeqCst);
}

/// Direct3D 12 command queue of list type `kind`.
pub fn command_queue(kind: i32) -> &'static FakeCom {
    FakeCom::leak(
        19,
        &[
            (10, fake_execute_command_lists as ExecuteCommandListsFn as *const c_void),
            (18, get_desc as *const c_void),
        ],
        &[],
        &[],
        kind,
    )
}

extern "system" fn fake_end_scene(_: *mut c_void) -> i32 {
    CALLS.end_scene.fetch_add(1, Ordering::SeqCst);
    0
}

extern "system" fn fake_d3d9_present(
    object: *mut c_void,
    source: *const c_void,
    dest: *const c_void,
    window: *mut c_void,
    dirty: *const c_void,
) -> i32 {
    CALLS.d3d9_present.fetch_add(1, Ordering::SeqCst);

    // the runtime presents the implicit swap chain
    match unsafe { this(object) }.linked() {
        Some(swapchain) => unsafe {
            routed(fake_d3d9_swapchain_present as D3d9SwapchainPresentFn)(
                swapchain.as_raw(),
                source,
                dest,
                window,
                dirty,
                0,
            )
        },
        None => 0,
    }
}

extern "system" fn fake_d3d9_swapchain_present(
    _: *mut c_void,
    _: *const c_void,
    _: *const c_void,
    _: *mut c_void,
    _: *const c_void,
    _: u32,
) -> i32 {
    CALLS.d3d9_swapchain_present.fetch_add(1, Ordering::SeqCst);
    0
}

/// Hand out the linked object, as `GetSwapChain` and `IDirect3DSwapChain9::GetDevice` do.
fn out_linked(object: *mut c_void, out: *mut *mut c_void) -> i32 {
    unsafe {
        match this(object).linked() {
            Some(linked) => {
                *out = linked.com().into_raw();
                0
            }
            None => {
                *out = ptr::null_mut();
                E_NOTIMPL
            }
        }
    }
}

extern "system" fn fake_d3d9_get_swap_chain(
    object: *mut c_void,
    _: u32,
    out: *mut *mut c_void,
) -> i32 {
    out_linked(object, out)
}

extern "system" fn fake_d3d9_swapchain_get_device(
    object: *mut c_void,
    out: *mut *mut c_void,
) -> i32 {
    out_linked(object, out)
}

extern "system" fn fake_d3d9_reset(_: *mut c_void, _: *mut c_void) -> i32 {
    CALLS.d3d9_reset.fetch_add(1, Ordering::SeqCst);
    0
}

/// `IDirect3DDevice9` without the Ex interface, linked to its implicit swap chain.
pub fn d3d9_device() -> &'static FakeCom {
    let device = FakeCom::leak(
        119,
        &[
            (14, fake_d3d9_get_swap_chain as *const c_void),
            (16, fake_d3d9_reset as D3d9ResetFn as *const c_void),
            (17, fake_d3d9_present as D3d9PresentFn as *const c_void),
            (42, fake_end_scene as EndSceneFn as *const c_void),
        ],
        &[],
        &[],
        0,
    );

    let swapchain = FakeCom::leak(
        10,
        &[
            (3, fake_d3d9_swapchain_present as D3d9SwapchainPresentFn as *const c_void),
            (8, fake_d3d9_swapchain_get_device as *const c_void),
        ],
        &[],
        &[],
        0,
    );
    device.link.store(swapchain.as_raw(), Ordering::SeqCst);
    swapchain.link.store(device.as_raw(), Ordering::SeqCst);
    device
}

extern "system" fn fake_wgl_swap_buffers(_: *mut c_void) -> c_int {
    CALLS.swap_buffers.fetch_add(1, Ordering::SeqCst);

    let nested = NESTED_SWAPCHAIN.load(Ordering::SeqCst);
    if !nested.is_null() {
        unsafe { routed(fake_present as PresentFn)(nested, 0, 0) };
    }

    1
}

extern "system" fn fake_wgl_swap_layer_buffers(hdc: *mut c_void, _: c_uint) -> c_int {
    CALLS.swap_layer_buffers.fetch_add(1, Ordering::SeqCst);
    // SwapBuffers style forwarding into wglSwapBuffers
    unsafe { routed(fake_wgl_swap_buffers as WglSwapBuffersFn)(hdc) }
}

extern "system" fn fake_wgl_delete_context(_: *mut c_void) -> c_int {
    CALLS.delete_context.fetch_add(1, Ordering::SeqCst);
    1
}

extern "C" fn fake_glx_swap_buffers(_: *mut c_void, _: c_ulong) {
    CALLS.glx_swap_buffers.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn fake_glx_destroy_context(_: *mut c_void, _: *mut c_void) {
    CALLS.glx_destroy_context.fetch_add(1, Ordering::SeqCst);
}

extern "system" fn fake_gl_get_string(_: c_uint) -> *const u8 {
    GL_VERSION.load(Ordering::SeqCst)
}

extern "system" fn fake_wgl_get_current_context() -> *mut c_void {
    CURRENT_CONTEXT.load(Ordering::SeqCst) as *mut c_void
}

pub fn present(swapchain: &'static FakeCom, flags: u32) -> i32 {
    unsafe { routed(fake_present as PresentFn)(swapchain.as_raw(), 0, flags) }
}

pub fn resize_buffers(swapchain: &'static FakeCom) -> i32 {
    unsafe {
        routed(fake_resize_buffers as ResizeBuffersFn)(swapchain.as_raw(), 0, 800, 600, 0, 0)
    }
}

pub fn execute_command_lists(queue: &'static FakeCom) {
    let lists = [ptr::null_mut()];
    unsafe {
        routed(fake_execute_command_lists as ExecuteCommandListsFn)(
            queue.as_raw(),
            1,
            lists.as_ptr(),
        )
    }
}

pub fn end_scene(device: &'static FakeCom) -> i32 {
    unsafe { routed(fake_end_scene as EndSceneFn)(device.as_raw()) }
}

pub fn d3d9_present(device: &'static FakeCom) -> i32 {
    unsafe {
        routed(fake_d3d9_present as D3d9PresentFn)(
            device.as_raw(),
            ptr::null(),
            ptr::null(),
            ptr::null_mut(),
            ptr::null(),
        )
    }
}

/// Present through the implicit swap chain of `device`.
pub fn d3d9_swapchain_present(device: &'static FakeCom) -> i32 {
    let swapchain = device.linked().expect("implicit swap chain");
    unsafe {
        routed(fake_d3d9_swapchain_present as D3d9SwapchainPresentFn)(
            swapchain.as_raw(),
            ptr::null(),
            ptr::null(),
            ptr::null_mut(),
            ptr::null(),
            0,
        )
    }
}

pub fn d3d9_reset(device: &'static FakeCom) -> i32 {
    unsafe { routed(fake_d3d9_reset as D3d9ResetFn)(device.as_raw(), ptr::null_mut()) }
}

pub fn swap_buffers() -> c_int {
    unsafe { routed(fake_wgl_swap_buffers as WglSwapBuffersFn)(0xdc as *mut c_void) }
}

pub fn swap_layer_buffers(planes: c_uint) -> c_int {
    unsafe {
        routed(fake_wgl_swap_layer_buffers as WglSwapLayerBuffersFn)(0xdc as *mut c_void, planes)
    }
}

pub fn delete_context(context: usize) -> c_int {
    unsafe { routed(fake_wgl_delete_context as WglDeleteContextFn)(context as *mut c_void) }
}

pub fn glx_swap_buffers(dpy: usize, drawable: c_ulong) {
    unsafe { routed(fake_glx_swap_buffers as GlxSwapBuffersFn)(dpy as *mut c_void, drawable) }
}

pub fn glx_destroy_context(context: usize) {
    unsafe {
        routed(fake_glx_destroy_context as GlxDestroyContextFn)(
            0xd15 as *mut c_void,
            context as *mut c_void,
        )
    }
}

pub fn glx_swap_buffers_target() -> FnPtr {
    fn_ptr(fake_glx_swap_buffers as GlxSwapBuffersFn)
}

pub fn wgl_swap_buffers_target() -> FnPtr {
    fn_ptr(fake_wgl_swap_buffers as WglSwapBuffersFn)
}

pub fn present_target() -> FnPtr {
    fn_ptr(fake_present as PresentFn)
}

pub fn present1_target() -> FnPtr {
    fn_ptr(fake_present1 as Present1Fn)
}

pub fn end_scene_target() -> FnPtr {
    fn_ptr(fake_end_scene as EndSceneFn)
}

struct FakeModule {
    handle: ModuleHandle,
    symbols: HashMap<CString, FnPtr>,
}

/// Module table of the fake process.
#[derive(Default)]
pub struct FakeModules {
    modules: Mutex<HashMap<String, FakeModule>>,
}

impl FakeModules {
    pub fn load(&self, name: &str, handle: usize, symbols: &[(&CStr, FnPtr)]) {
        self.modules.lock().insert(
            name.to_string(),
            FakeModule {
                handle: ModuleHandle::new(handle).expect("non zero handle"),
                symbols: symbols
                    .iter()
                    .map(|&(name, func)| (name.to_owned(), func))
                    .collect(),
            },
        );
    }

    pub fn unload(&self, name: &str) {
        self.modules.lock().remove(name);
    }

    /// `opengl32.dll` exporting every wgl function except `missing`.
    pub fn load_wgl(&self, handle: usize, missing: &[&CStr]) {
        let symbols = [
            (c"wglSwapBuffers", wgl_swap_buffers_target()),
            (
                c"wglSwapLayerBuffers",
                fn_ptr(fake_wgl_swap_layer_buffers as WglSwapLayerBuffersFn),
            ),
            (
                c"wglDeleteContext",
                fn_ptr(fake_wgl_delete_context as WglDeleteContextFn),
            ),
            (
                c"wglGetCurrentContext",
                fn_ptr(fake_wgl_get_current_context as GetCurrentContextFn),
            ),
            (c"glGetString", fn_ptr(fake_gl_get_string as GetStringFn)),
        ]
        .into_iter()
        .filter(|(name, _)| !missing.contains(name))
        .collect::<Vec<_>>();

        self.load("opengl32.dll", handle, &symbols);
    }

    /// `libGL.so.1` exporting the glx functions.
    pub fn load_glx(&self, handle: usize) {
        self.load(
            "libGL.so.1",
            handle,
            &[
                (c"glXSwapBuffers", glx_swap_buffers_target()),
                (
                    c"glXDestroyContext",
                    fn_ptr(fake_glx_destroy_context as GlxDestroyContextFn),
                ),
                (
                    c"glXGetCurrentContext",
                    fn_ptr(fake_wgl_get_current_context as GetCurrentContextFn),
                ),
                (c"glGetString", fn_ptr(fake_gl_get_string as GetStringFn)),
            ],
        );
    }

    /// `libvulkan.so.1` exporting the loader functions.
    pub fn load_vulkan(&self, handle: usize) {
        self.load(
            "libvulkan.so.1",
            handle,
            &[
                (c"vkQueuePresentKHR", vk_queue_present_target()),
                (
                    c"vkDestroySwapchainKHR",
                    fn_ptr(fake_vk_destroy_swapchain as vk::PFN_vkDestroySwapchainKHR),
                ),
                (
                    c"vkCreateDevice",
                    fn_ptr(fake_vk_create_device as vk::PFN_vkCreateDevice),
                ),
                (c"vkGetDeviceQueue", vk_get_device_queue_target()),
                (
                    c"vkCreateSwapchainKHR",
                    fn_ptr(fake_vk_create_swapchain as vk::PFN_vkCreateSwapchainKHR),
                ),
            ],
        );
    }

    /// Objective-C runtime and Metal framework.
    ///
    /// Without `drawable_class` the drawable class is only found through a drawable.
    pub fn load_metal(&self, drawable_class: bool) {
        EXPORT_DRAWABLE_CLASS.store(drawable_class, Ordering::SeqCst);
        self.load(
            "/usr/lib/libobjc.A.dylib",
            0x0b1c,
            &[
                (c"objc_getClass", fn_ptr(fake_objc_get_class as ObjcNameFn)),
                (c"sel_registerName", fn_ptr(fake_sel_register_name as ObjcNameFn)),
                (
                    c"class_getMethodImplementation",
                    fn_ptr(fake_class_method as ObjcMethodFn),
                ),
                (c"object_getClass", fn_ptr(fake_object_class as ObjcObjectFn)),
                (
                    c"objc_autoreleasePoolPush",
                    fn_ptr(fake_pool_push as ObjcPoolPushFn),
                ),
                (
                    c"objc_autoreleasePoolPop",
                    fn_ptr(fake_pool_pop as ObjcPoolPopFn),
                ),
                (c"objc_msgSend", fn_ptr(fake_msg_send as ObjcSendFn)),
            ],
        );
        self.load(
            "/System/Library/Frameworks/Metal.framework/Metal",
            0x3e7a,
            &[(
                c"MTLCreateSystemDefaultDevice",
                fn_ptr(fake_create_system_device as ObjcPoolPushFn),
            )],
        );
    }
}

impl ModuleIntrospection for FakeModules {
    fn open(&self, path: &str) -> Option<ModuleHandle> {
        self.loaded(path)
    }

    fn symbol(&self, module: ModuleHandle, name: &CStr) -> Option<FnPtr> {
        self.modules
            .lock()
            .values()
            .find(|entry| entry.handle == module)
            .and_then(|entry| entry.symbols.get(name).copied())
    }

    fn loaded(&self, name: &str) -> Option<ModuleHandle> {
        self.modules.lock().get(name).map(|entry| entry.handle)
    }

    fn path(&self, module: ModuleHandle) -> Option<PathBuf> {
        self.modules
            .lock()
            .iter()
            .find(|(_, entry)| entry.handle == module)
            .map(|(name, _)| PathBuf::from(name))
    }
}

/// Offscreen devices handing out fake COM objects.
#[derive(Default)]
pub struct FakeOffscreen {
    pub swapchain: Mutex<Option<&'static FakeCom>>,
    pub d3d9: Mutex<Option<&'static FakeCom>>,
    pub queue: Mutex<Option<&'static FakeCom>>,
    pub created: AtomicUsize,
}

impl FakeOffscreen {
    fn get(&self, object: &Mutex<Option<&'static FakeCom>>) -> anyhow::Result<ComObject> {
        let Some(object) = *object.lock() else {
            bail!("device creation failed");
        };

        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(object.com())
    }
}

impl OffscreenDevices for FakeOffscreen {
    fn dxgi_swapchain(&self) -> anyhow::Result<ComObject> {
        self.get(&self.swapchain)
    }

    fn d3d9_device(&self) -> anyhow::Result<ComObject> {
        self.get(&self.d3d9)
    }

    fn d3d12_command_queue(&self) -> anyhow::Result<ComObject> {
        self.get(&self.queue)
    }
}

/// Gpu objects created by [`CountingDriver`]s.
#[derive(Default)]
pub struct DriverStats {
    pub created: AtomicUsize,
    pub inits: AtomicUsize,
    pub target_releases: AtomicUsize,
    pub full_releases: AtomicUsize,
    pub renders: AtomicUsize,
    pub live_targets: AtomicIsize,
    pub live_textures: AtomicIsize,
    pub next_texture: AtomicU64,
    /// Direct3D 12 queue of the last rendered frame.
    pub last_queue: AtomicUsize,
    pub fail_create: AtomicBool,
    /// Driver creations asked for, failed ones included.
    pub attempts: AtomicUsize,
}

#[derive(Default)]
pub struct FakeDrivers {
    pub stats: Arc<DriverStats>,
}

impl DriverFactory for FakeDrivers {
    fn create(&self, api: Api, _: &Frame<'_>) -> anyhow::Result<Box<dyn RenderDriver>> {
        self.stats.attempts.fetch_add(1, Ordering::SeqCst);
        if self.stats.fail_create.load(Ordering::SeqCst) {
            bail!("driver creation failed");
        }

        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingDriver {
            api,
            stats: self.stats.clone(),
            targets: false,
        }))
    }
}

pub struct CountingDriver {
    api: Api,
    stats: Arc<DriverStats>,
    targets: bool,
}

impl CountingDriver {
    fn drop_targets(&mut self) {
        if self.targets {
            self.targets = false;
            self.stats.live_targets.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl RenderDriver for CountingDriver {
    fn init(&mut self, _: &Frame<'_>) -> anyhow::Result<()> {
        self.stats.inits.fetch_add(1, Ordering::SeqCst);
        if !self.targets {
            self.targets = true;
            self.stats.live_targets.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    fn release(&mut self, scope: Release) {
        match scope {
            Release::RenderTargets => self.stats.target_releases.fetch_add(1, Ordering::SeqCst),
            Release::All => self.stats.full_releases.fetch_add(1, Ordering::SeqCst),
        };
        self.drop_targets();
    }

    fn render(
        &mut self,
        frame: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        if let Frame::Dxgi {
            queue: Some(queue), ..
        } = frame
        {
            self.stats.last_queue.store(*queue as usize, Ordering::SeqCst);
        }

        self.stats.renders.fetch_add(1, Ordering::SeqCst);
        draw(&NativeTarget {
            api: self.api,
            device: 0xde0,
            context: 0,
            render_target: 0x7a,
            width: 640,
            height: 480,
        });
        Ok(())
    }

    fn create_texture(
        &mut self,
        _: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture> {
        self.stats.live_textures.fetch_add(1, Ordering::SeqCst);
        Ok(NativeTexture {
            handle: self.stats.next_texture.fetch_add(1, Ordering::SeqCst) + 1,
            view: 0,
            width,
            height,
        })
    }

    fn destroy_texture(&mut self, _: NativeTexture) {
        self.stats.live_textures.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for CountingDriver {
    fn drop(&mut self) {
        self.drop_targets();
    }
}

/// Overlay recording what it was called with.
#[derive(Default)]
pub struct RecordingOverlay {
    pub renders: AtomicUsize,
    pub transitions: Mutex<Vec<OverlayState>>,
    pub panic: AtomicBool,
    /// Target of the frame context and the one bound on the thread.
    pub targets: Mutex<Vec<(NativeTarget, Option<NativeTarget>)>>,
    /// Image looked up on every frame.
    pub image: Mutex<Option<ImageHandle>>,
    pub textures: Mutex<Vec<Option<NativeTexture>>>,
}

impl RecordingOverlay {
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn transitions(&self) -> Vec<OverlayState> {
        self.transitions.lock().clone()
    }
}

impl Overlay for RecordingOverlay {
    fn render(&self, cx: &FrameContext<'_>) {
        self.renders.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push((*cx.target(), frame::current()));
        if let Some(image) = *self.image.lock() {
            self.textures.lock().push(cx.texture(image));
        }

        if self.panic.load(Ordering::SeqCst) {
            panic!("overlay failure");
        }
    }

    fn transition(&self, state: OverlayState) {
        self.transitions.lock().push(state);
    }
}

static SERIAL: Mutex<()> = parking_lot::const_mutex(());

/// Fake process shared by one test.
pub struct Fixture {
    pub patcher: Arc<RoutingPatcher>,
    pub modules: Arc<FakeModules>,
    pub offscreen: Arc<FakeOffscreen>,
    pub drivers: Arc<FakeDrivers>,
    pub overlay: Arc<RecordingOverlay>,
    _serial: MutexGuard<'static, ()>,
}

impl Fixture {
    pub fn new() -> Self {
        let serial = SERIAL.lock();

        PATCHER.reset();
        CALLS.reset();
        set_gl_version(c"4.6.0 Fake");
        set_current_context(0x1000);
        present_inside_swap(None);

        Self {
            patcher: PATCHER.clone(),
            modules: Arc::default(),
            offscreen: Arc::default(),
            drivers: Arc::default(),
            overlay: Arc::default(),
            _serial: serial,
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            patcher: self.patcher.clone(),
            modules: self.modules.clone(),
            offscreen: self.offscreen.clone(),
            drivers: self.drivers.clone(),
        }
    }

    pub fn session(&self) -> DetectionSession {
        self.session_with(config())
    }

    pub fn session_with(&self, config: DetectConfig) -> DetectionSession {
        DetectionSession::new(self.platform(), self.overlay.clone(), config)
    }

    pub fn stats(&self) -> &DriverStats {
        &self.drivers.stats
    }

    /// Load `dxgi.dll` with an offscreen swap chain answering `devices`.
    pub fn with_dxgi(&self, devices: &[Guid]) -> &'static FakeCom {
        let swapchain = swapchain(devices);
        *self.offscreen.swapchain.lock() = Some(swapchain);
        self.modules.load("dxgi.dll", 0xd61, &[]);
        swapchain
    }

    /// Offscreen Direct3D 12 queue read on attach.
    pub fn with_queue(&self) -> &'static FakeCom {
        let queue = command_queue(COMMAND_LIST_TYPE_DIRECT);
        *self.offscreen.queue.lock() = Some(queue);
        queue
    }

    /// Load `d3d9.dll` with an offscreen device.
    pub fn with_d3d9(&self) -> &'static FakeCom {
        let device = d3d9_device();
        *self.offscreen.d3d9.lock() = Some(device);
        self.modules.load("d3d9.dll", 0xd39, &[]);
        device
    }
}

static NEXT_VK_HANDLE: AtomicU64 = AtomicU64::new(0x7000);

/// Fresh handle value, dispatchable handles are shared process wide.
fn vk_handle() -> u64 {
    NEXT_VK_HANDLE.fetch_add(0x10, Ordering::SeqCst)
}

unsafe extern "system" fn fake_vk_create_device(
    _: vk::PhysicalDevice,
    _: *const vk::DeviceCreateInfo<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    device: *mut vk::Device,
) -> vk::Result {
    unsafe { *device = vk::Device::from_raw(vk_handle()) };
    vk::Result::SUCCESS
}

unsafe extern "system" fn fake_vk_get_device_queue(
    device: vk::Device,
    family: u32,
    _: u32,
    queue: *mut vk::Queue,
) {
    unsafe { *queue = vk::Queue::from_raw(device.as_raw() + 1 + u64::from(family)) };
}

unsafe extern "system" fn fake_vk_create_swapchain(
    _: vk::Device,
    _: *const vk::SwapchainCreateInfoKHR<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    unsafe { *swapchain = vk::SwapchainKHR::from_raw(vk_handle()) };
    vk::Result::SUCCESS
}

unsafe extern "system" fn fake_vk_destroy_swapchain(
    _: vk::Device,
    _: vk::SwapchainKHR,
    _: *const vk::AllocationCallbacks<'_>,
) {
    CALLS.vk_destroy_swapchain.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "system" fn fake_vk_queue_present(
    _: vk::Queue,
    _: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    CALLS.vk_queue_present.fetch_add(1, Ordering::SeqCst);
    vk::Result::SUCCESS
}

pub fn vk_queue_present_target() -> FnPtr {
    fn_ptr(fake_vk_queue_present as vk::PFN_vkQueuePresentKHR)
}

pub fn vk_get_device_queue_target() -> FnPtr {
    fn_ptr(fake_vk_get_device_queue as vk::PFN_vkGetDeviceQueue)
}

pub fn vk_create_device() -> vk::Device {
    let mut device = vk::Device::null();
    let res = unsafe {
        routed(fake_vk_create_device as vk::PFN_vkCreateDevice)(
            vk::PhysicalDevice::from_raw(0x9d),
            ptr::null(),
            ptr::null(),
            &mut device,
        )
    };
    assert_eq!(res, vk::Result::SUCCESS);
    device
}

pub fn vk_get_device_queue(device: vk::Device) -> vk::Queue {
    let mut queue = vk::Queue::null();
    unsafe {
        routed(fake_vk_get_device_queue as vk::PFN_vkGetDeviceQueue)(device, 0, 0, &mut queue)
    };
    queue
}

pub fn vk_create_swapchain(device: vk::Device) -> vk::SwapchainKHR {
    let info = vk::SwapchainCreateInfoKHR::default()
        .image_format(vk::Format::B8G8R8A8_UNORM)
        .image_extent(vk::Extent2D {
            width: 640,
            height: 480,
        });

    let mut swapchain = vk::SwapchainKHR::null();
    let res = unsafe {
        routed(fake_vk_create_swapchain as vk::PFN_vkCreateSwapchainKHR)(
            device,
            &info,
            ptr::null(),
            &mut swapchain,
        )
    };
    assert_eq!(res, vk::Result::SUCCESS);
    swapchain
}

pub fn vk_destroy_swapchain(device: vk::Device, swapchain: vk::SwapchainKHR) {
    unsafe {
        routed(fake_vk_destroy_swapchain as vk::PFN_vkDestroySwapchainKHR)(
            device,
            swapchain,
            ptr::null(),
        )
    }
}

pub fn vk_queue_present(queue: vk::Queue, swapchain: vk::SwapchainKHR) -> vk::Result {
    let swapchains = [swapchain];
    let indices = [0];
    let info = vk::PresentInfoKHR::default()
        .swapchains(&swapchains)
        .image_indices(&indices);

    unsafe { routed(fake_vk_queue_present as vk::PFN_vkQueuePresentKHR)(queue, &info) }
}

type ObjcNameFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type ObjcMethodFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> *const c_void;
type ObjcObjectFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type ObjcPoolPushFn = unsafe extern "C" fn() -> *mut c_void;
type ObjcPoolPopFn = unsafe extern "C" fn(*mut c_void);
type ObjcSendFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void;

const DRAWABLE_CLASS: usize = 0xc1a0;
const LAYER_CLASS: usize = 0xc1a1;
const METAL_DEVICE: usize = 0xde71;
const METAL_LAYER: usize = 0x1a7e;
pub const METAL_DRAWABLE: usize = 0xd7a0;

static EXPORT_DRAWABLE_CLASS: AtomicBool = AtomicBool::new(true);
/// Selectors by name. Each selector points at its leaked name.
static SELECTORS: Lazy<Mutex<HashMap<CString, usize>>> = Lazy::new(Default::default);
/// Autorelease pools pushed and not popped.
pub static OPEN_POOLS: AtomicIsize = AtomicIsize::new(0);

unsafe extern "C" fn fake_objc_get_class(name: *const c_char) -> *mut c_void {
    let name = unsafe { CStr::from_ptr(name) };
    let class = match name.to_bytes() {
        b"CAMetalLayerDrawable" if EXPORT_DRAWABLE_CLASS.load(Ordering::SeqCst) => DRAWABLE_CLASS,
        b"CAMetalLayer" => LAYER_CLASS,
        _ => 0,
    };
    class as *mut c_void
}

unsafe extern "C" fn fake_sel_register_name(name: *const c_char) -> *mut c_void {
    let name = unsafe { CStr::from_ptr(name) };
    *SELECTORS
        .lock()
        .entry(name.to_owned())
        .or_insert_with(|| CString::into_raw(name.to_owned()) as usize) as *mut c_void
}

fn selector_name(sel: *mut c_void) -> &'static CStr {
    unsafe { CStr::from_ptr(sel.cast()) }
}

unsafe extern "C" fn fake_class_method(class: *mut c_void, sel: *mut c_void) -> *const c_void {
    if class as usize == DRAWABLE_CLASS && selector_name(sel) == c"present" {
        fake_metal_present as MetalPresentFn as *const c_void
    } else {
        ptr::null()
    }
}

unsafe extern "C" fn fake_object_class(object: *mut c_void) -> *mut c_void {
    match object as usize {
        METAL_DRAWABLE => DRAWABLE_CLASS as *mut c_void,
        METAL_LAYER => LAYER_CLASS as *mut c_void,
        _ => ptr::null_mut(),
    }
}

unsafe extern "C" fn fake_pool_push() -> *mut c_void {
    OPEN_POOLS.fetch_add(1, Ordering::SeqCst);
    0x9001 as *mut c_void
}

unsafe extern "C" fn fake_pool_pop(_: *mut c_void) {
    OPEN_POOLS.fetch_sub(1, Ordering::SeqCst);
}

unsafe extern "C" fn fake_create_system_device() -> *mut c_void {
    METAL_DEVICE as *mut c_void
}

/// Answers the messages sent while looking up the drawable class. Arguments past the
/// selector are ignored.
unsafe extern "C" fn fake_msg_send(receiver: *mut c_void, sel: *mut c_void) -> *mut c_void {
    let answer = match (receiver as usize, selector_name(sel).to_bytes()) {
        (LAYER_CLASS, b"new") => METAL_LAYER,
        (METAL_LAYER, b"nextDrawable") => METAL_DRAWABLE,
        _ => 0,
    };
    answer as *mut c_void
}

unsafe extern "C" fn fake_metal_present(_: *mut c_void, _: *mut c_void) {
    CALLS.metal_present.fetch_add(1, Ordering::SeqCst);
}

pub fn metal_present_target() -> FnPtr {
    fn_ptr(fake_metal_present as MetalPresentFn)
}

/// `[drawable present]`.
pub fn metal_present(drawable: usize) {
    let sel = unsafe { fake_sel_register_name(c"present".as_ptr()) };
    unsafe { routed(fake_metal_present as MetalPresentFn)(drawable as *mut c_void, sel) }
}

/// Host device, queue and swap chain created once the Vulkan capture hooks are in.
pub fn vk_host(patcher: &RoutingPatcher) -> (vk::Device, vk::Queue, vk::SwapchainKHR) {
    assert!(wait_until(Duration::from_secs(5), || {
        patcher.is_hooked(vk_get_device_queue_target())
    }));

    let device = vk_create_device();
    let queue = vk_get_device_queue(device);
    let swapchain = vk_create_swapchain(device);
    (device, queue, swapchain)
}
