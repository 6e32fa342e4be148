//! Render object lifecycle shared by every backend.
//!
//! Presentation hooks call [`BackendCore::render_frame`] and resize hooks call
//! [`BackendCore::reset`]. Gpu objects are only created and destroyed on the host render
//! thread, except on detach.

use core::{
    cell::Cell,
    ffi::c_void,
    panic::AssertUnwindSafe,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering},
};
use std::{panic, sync::Arc};

use parking_lot::Mutex;
use scopeguard::defer;
use tracing::{debug, error, trace};

use super::vulkan::Capture;
use crate::{
    dispatch::InFlight,
    error::ImageError,
    frame::{self, Frame, FrameContext},
    image::{ImageArena, ImageHandle, Textures},
    overlay::{Overlay, OverlayState},
    renderer::{DriverFactory, Release, RenderDriver},
    types::Api,
};

/// Attachment state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// No hook installed.
    Uninitialized = 0,
    /// Hooks installed, no gpu render object.
    Attached = 1,
    /// Render objects created from a live frame.
    Initialized = 2,
}

impl Lifecycle {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Attached,
            2 => Lifecycle::Initialized,
            _ => Lifecycle::Uninitialized,
        }
    }
}

thread_local! {
    static RENDERING: Cell<bool> = const { Cell::new(false) };
}

/// `true` on a thread running a render callback.
pub(crate) fn is_rendering() -> bool {
    RENDERING.get()
}

/// Run `f`, logging instead of unwinding into the host.
pub(crate) fn contain(what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        error!("{what} panicked. {msg}");
    }
}

/// Frames skipped after repeated driver creation failures.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    skip: u32,
}

impl Backoff {
    const MAX_SKIP: u32 = 255;

    /// `true` if this frame should try again.
    fn ready(&mut self) -> bool {
        if self.skip == 0 {
            return true;
        }

        self.skip -= 1;
        false
    }

    /// Record a failure. Returns the number of consecutive failures.
    fn fail(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        // 0, 1, 3, 7, ... frames
        self.skip = 1u32
            .checked_shl(self.failures - 1)
            .map_or(Self::MAX_SKIP, |frames| (frames - 1).min(Self::MAX_SKIP));
        self.failures
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

struct RenderState {
    driver: Option<Box<dyn RenderDriver>>,
    backoff: Backoff,
    textures: Textures,
    ready: bool,
}

pub(crate) struct BackendCore {
    api: Api,
    overlay: Arc<dyn Overlay>,
    drivers: Arc<dyn DriverFactory>,
    lifecycle: AtomicU8,
    teardown_pending: AtomicBool,

    /// Taken by the render thread, and by detach.
    render: Mutex<RenderState>,
    /// Taken by image callers. The render thread only tries it.
    images: Mutex<ImageArena>,

    pub in_flight: InFlight,
    /// Owner of the Vulkan capture hooks installed by this backend.
    pub vk_capture: Arc<Capture>,

    /// Direct3D 12 queue observed in `ExecuteCommandLists`. Not owned.
    pub dx12_queue: AtomicPtr<c_void>,
    /// Direct3D 9 frame signal latched by the first one observed.
    pub dx9_signal: AtomicU8,
    /// Set once a `Present` is seen while `EndScene` is latched.
    pub dx9_presented: AtomicBool,
    pub dx9_drawn: AtomicBool,
    /// Gl context the render objects were created in.
    pub gl_context: AtomicUsize,
}

impl BackendCore {
    pub fn new(api: Api, overlay: Arc<dyn Overlay>, drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            api,
            overlay,
            drivers,
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
            teardown_pending: AtomicBool::new(false),

            render: Mutex::new(RenderState {
                driver: None,
                backoff: Backoff::default(),
                textures: Textures::new(),
                ready: false,
            }),
            images: Mutex::new(ImageArena::new()),

            in_flight: InFlight::new(),
            vk_capture: Arc::default(),

            dx12_queue: AtomicPtr::new(ptr::null_mut()),
            dx9_signal: AtomicU8::new(0),
            dx9_presented: AtomicBool::new(false),
            dx9_drawn: AtomicBool::new(false),
            gl_context: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn api(&self) -> Api {
        self.api
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    #[inline]
    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    pub fn set_attached(&self) {
        self.teardown_pending.store(false, Ordering::Release);
        self.set_lifecycle(Lifecycle::Attached);
    }

    fn transition(&self, state: OverlayState) {
        debug!("{} overlay {:?}", self.api, state);
        contain("overlay transition", || self.overlay.transition(state));
    }

    /// Render one frame. Called from presentation hooks on the host render thread.
    #[tracing::instrument(skip_all, fields(api = %self.api))]
    pub fn render_frame(&self, frame: &Frame<'_>) {
        if self.lifecycle() == Lifecycle::Uninitialized {
            return;
        }

        // nested presentation inside our own render
        if RENDERING.get() {
            trace!("skipping nested frame");
            return;
        }
        RENDERING.set(true);
        defer!(RENDERING.set(false));

        let mut render = self.render.lock();
        self.render_locked(&mut render, frame);

        if self.teardown_pending.swap(false, Ordering::AcqRel) {
            debug!("running teardown requested during render");
            self.teardown_locked(&mut render);
        }
    }

    fn render_locked(&self, render: &mut RenderState, frame: &Frame<'_>) {
        let RenderState {
            driver,
            backoff,
            textures,
            ready,
        } = render;

        if driver.is_none() {
            if !backoff.ready() {
                return;
            }

            match self.drivers.create(self.api, frame) {
                Ok(created) => {
                    backoff.clear();
                    *driver = Some(created);
                }
                Err(err) => {
                    if backoff.fail() == 1 {
                        error!("{} driver creation failed. err: {err:?}", self.api);
                    } else {
                        debug!("{} driver creation failed again. err: {err:?}", self.api);
                    }
                    return;
                }
            }
        }
        let Some(driver) = driver else {
            return;
        };

        if !*ready {
            if let Err(err) = driver.init(frame) {
                error!("{} render object creation failed. err: {err:?}", self.api);
                return;
            }

            *ready = true;
            self.set_lifecycle(Lifecycle::Initialized);
            self.transition(OverlayState::Ready);
        }

        if let Some(mut images) = self.images.try_lock() {
            let work = images.take_work();
            drop(images);

            if !work.is_empty() {
                textures.apply(work, &mut **driver);
            }
        }

        let overlay = &*self.overlay;
        let textures = &*textures;
        let res = driver.render(frame, &mut |target| {
            frame::with_current(*target, || {
                contain("overlay render", || {
                    overlay.render(&FrameContext::new(*target, textures))
                });
            });
        });

        if let Err(err) = res {
            error!("{} render failed. err: {err:?}", self.api);
        }
    }

    /// Release render objects after a resize or device reset.
    ///
    /// Objects are recreated on the next frame. [`Release::All`] also destroys every
    /// texture and invalidates image handles.
    #[tracing::instrument(skip(self), fields(api = %self.api))]
    pub fn reset(&self, scope: Release) {
        if RENDERING.get() {
            trace!("ignoring reset during render");
            return;
        }

        let mut render = self.render.lock();
        let RenderState {
            driver,
            backoff,
            textures,
            ready,
        } = &mut *render;

        let was_ready = *ready;
        *ready = false;
        if let Some(driver) = driver {
            match scope {
                Release::RenderTargets => driver.release(Release::RenderTargets),
                Release::All => {
                    textures.destroy_all(&mut **driver);
                    driver.release(Release::All);
                }
            }
        }

        if scope == Release::All {
            driver.take();
            backoff.clear();
            self.images.lock().clear();
        }

        if was_ready {
            self.set_lifecycle(Lifecycle::Attached);
            self.transition(OverlayState::TornDown);
        }
    }

    /// Release everything after the hooks of this backend are removed.
    pub fn teardown(&self) {
        if RENDERING.get() {
            // called from the render callback, finish after it returns
            self.teardown_pending.store(true, Ordering::Release);
            return;
        }

        let mut render = self.render.lock();
        self.teardown_locked(&mut render);
    }

    fn teardown_locked(&self, render: &mut RenderState) {
        if let Some(mut driver) = render.driver.take() {
            render.textures.destroy_all(&mut *driver);
            driver.release(Release::All);
        } else {
            render.textures.forget();
        }

        render.backoff.clear();
        self.images.lock().clear();
        self.dx12_queue.store(ptr::null_mut(), Ordering::Release);
        self.dx9_signal.store(0, Ordering::Release);
        self.dx9_presented.store(false, Ordering::Release);
        self.dx9_drawn.store(false, Ordering::Release);
        self.gl_context.store(0, Ordering::Release);

        let was_ready = render.ready;
        render.ready = false;
        self.set_lifecycle(Lifecycle::Uninitialized);
        if was_ready {
            self.transition(OverlayState::TornDown);
        }
    }

    pub fn upload_image(
        &self,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<ImageHandle, ImageError> {
        let mut images = self.images.lock();
        if self.lifecycle() == Lifecycle::Uninitialized {
            return Err(ImageError::Detached);
        }

        images.insert(pixels, width, height)
    }

    pub fn release_image(&self, handle: ImageHandle) -> bool {
        self.images.lock().release(handle)
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().len()
    }

    /// Textures alive on the gpu.
    pub fn texture_count(&self) -> usize {
        self.render.lock().textures.len()
    }
}
