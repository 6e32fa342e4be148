//! Objective-C runtime resolved by symbol.

use core::ffi::{CStr, c_char, c_void};

use asdf_present_hook::FnPtr;
use scopeguard::defer;
use tracing::debug;

use crate::{
    error::ProbeError,
    module::{ModuleHandle, ModuleIntrospection},
    types::CandidateKind,
};

pub(crate) const OBJC_RUNTIME: &str = "/usr/lib/libobjc.A.dylib";

type GetClassFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type RegisterNameFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type MethodImplementationFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> *const c_void;
type ObjectClassFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type PoolPushFn = unsafe extern "C" fn() -> *mut c_void;
type PoolPopFn = unsafe extern "C" fn(*mut c_void);
type CreateDeviceFn = unsafe extern "C" fn() -> *mut c_void;

/// Class of the drawables `CAMetalLayer` hands out. `CAMetalDrawable` is only a protocol.
const DRAWABLE_CLASS: &CStr = c"CAMetalLayerDrawable";

#[repr(C)]
#[derive(Clone, Copy)]
struct CgSize {
    width: f64,
    height: f64,
}

/// `-[CAMetalDrawable present]` and friends.
pub(crate) type PresentImp = unsafe extern "C" fn(*mut c_void, *mut c_void);

#[derive(Clone, Copy)]
pub(crate) struct ObjcRuntime {
    get_class: GetClassFn,
    register_name: RegisterNameFn,
    method_implementation: MethodImplementationFn,
    object_class: ObjectClassFn,
    pool_push: PoolPushFn,
    pool_pop: PoolPopFn,
    msg_send: FnPtr,
}

impl ObjcRuntime {
    fn module(modules: &dyn ModuleIntrospection) -> Option<ModuleHandle> {
        modules
            .loaded(OBJC_RUNTIME)
            .or_else(|| modules.open(OBJC_RUNTIME))
    }

    #[tracing::instrument(skip(modules))]
    pub fn load(modules: &dyn ModuleIntrospection) -> Result<Self, ProbeError> {
        let module = Self::module(modules).ok_or(ProbeError::SymbolMissing(OBJC_RUNTIME))?;
        let symbol = |name: &'static CStr| {
            modules
                .symbol(module, name)
                .ok_or(ProbeError::SymbolMissing(name.to_str().unwrap_or("?")))
        };

        let runtime = unsafe {
            Self {
                get_class: symbol(c"objc_getClass")?.cast(),
                register_name: symbol(c"sel_registerName")?.cast(),
                method_implementation: symbol(c"class_getMethodImplementation")?.cast(),
                object_class: symbol(c"object_getClass")?.cast(),
                pool_push: symbol(c"objc_autoreleasePoolPush")?.cast(),
                pool_pop: symbol(c"objc_autoreleasePoolPop")?.cast(),
                msg_send: symbol(c"objc_msgSend")?,
            }
        };
        debug!("objc runtime loaded");
        Ok(runtime)
    }

    pub fn class(&self, name: &CStr) -> Option<*mut c_void> {
        let class = unsafe { (self.get_class)(name.as_ptr()) };
        (!class.is_null()).then_some(class)
    }

    /// Class of a live object.
    ///
    /// # Safety
    /// `object` must be a live object.
    pub unsafe fn class_of(&self, object: *mut c_void) -> Option<*mut c_void> {
        let class = unsafe { (self.object_class)(object) };
        (!class.is_null()).then_some(class)
    }

    pub fn sel(&self, name: &CStr) -> *mut c_void {
        unsafe { (self.register_name)(name.as_ptr()) }
    }

    /// Implementation of `sel` on instances of `class`.
    pub fn method(&self, class: *mut c_void, sel: *mut c_void) -> Option<FnPtr> {
        FnPtr::new(unsafe { (self.method_implementation)(class, sel) })
    }

    /// `objc_msgSend` cast to the signature of the sent method.
    ///
    /// # Safety
    /// `F` must match the signature of the method the result is called with.
    pub unsafe fn msg_send<F: Copy>(&self) -> F {
        unsafe { self.msg_send.cast::<F>() }
    }

    /// Send a message without arguments returning an object.
    ///
    /// # Safety
    /// `receiver` must be a live object responding to `sel` with an object result.
    pub unsafe fn send_id(&self, receiver: *mut c_void, sel: &CStr) -> *mut c_void {
        let send = unsafe {
            self.msg_send::<unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void>()
        };
        unsafe { send(receiver, self.sel(sel)) }
    }
}

/// Resolve `-[CAMetalDrawable present]` on the class drawables are created with.
pub(crate) fn drawable_present(
    runtime: &ObjcRuntime,
    modules: &dyn ModuleIntrospection,
) -> Result<FnPtr, ProbeError> {
    let class = match runtime.class(DRAWABLE_CLASS) {
        Some(class) => class,
        None => unsafe { drawable_class(runtime, modules)? },
    };

    runtime
        .method(class, runtime.sel(c"present"))
        .ok_or(ProbeError::SymbolMissing("-[CAMetalDrawable present]"))
}

/// Ask a throwaway layer for a drawable and take its class.
unsafe fn drawable_class(
    runtime: &ObjcRuntime,
    modules: &dyn ModuleIntrospection,
) -> Result<*mut c_void, ProbeError> {
    const MISSING: ProbeError = ProbeError::SymbolMissing("CAMetalLayerDrawable");

    let [metal] = CandidateKind::Metal.modules() else {
        return Err(MISSING);
    };
    let create_device = modules
        .loaded(metal)
        .and_then(|module| modules.symbol(module, c"MTLCreateSystemDefaultDevice"))
        .ok_or(ProbeError::SymbolMissing("MTLCreateSystemDefaultDevice"))?;
    let layer_class = runtime.class(c"CAMetalLayer").ok_or(MISSING)?;

    unsafe {
        let pool = (runtime.pool_push)();
        defer!((runtime.pool_pop)(pool));

        let device = create_device.cast::<CreateDeviceFn>()();
        if device.is_null() {
            return Err(MISSING);
        }
        defer!(runtime.send_id(device, c"release"););

        let layer = runtime.send_id(layer_class, c"new");
        if layer.is_null() {
            return Err(MISSING);
        }
        defer!(runtime.send_id(layer, c"release"););

        let set_device =
            runtime.msg_send::<unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void)>();
        set_device(layer, runtime.sel(c"setDevice:"), device);
        let set_size = runtime.msg_send::<unsafe extern "C" fn(*mut c_void, *mut c_void, CgSize)>();
        set_size(
            layer,
            runtime.sel(c"setDrawableSize:"),
            CgSize {
                width: 1.0,
                height: 1.0,
            },
        );

        let drawable = runtime.send_id(layer, c"nextDrawable");
        if drawable.is_null() {
            return Err(MISSING);
        }

        let class = runtime.class_of(drawable).ok_or(MISSING)?;
        debug!("drawable class {class:p}");
        Ok(class)
    }
}
