//! Metal backend, hooking `-[CAMetalDrawable present]`.

use core::ffi::c_void;
use std::sync::Arc;

use asdf_present_hook::HookSet;
use tracing::trace;

use super::lifecycle::BackendCore;
use crate::{
    dispatch::Slot,
    error::AttachError,
    frame::Frame,
    objc::{self, ObjcRuntime, PresentImp},
    platform::Platform,
};

static PRESENT: Slot<BackendCore> = Slot::new();

pub(super) static SLOTS: [&Slot<BackendCore>; 1] = [&PRESENT];

#[tracing::instrument(skip_all)]
pub(super) fn attach(
    core: &Arc<BackendCore>,
    hooks: &HookSet,
    platform: &Platform,
) -> Result<(), AttachError> {
    let present = ObjcRuntime::load(&*platform.modules)
        .and_then(|runtime| objc::drawable_present(&runtime, &*platform.modules))
        .map_err(AttachError::entry_point(core.api()))?;

    unsafe {
        PRESENT.install(hooks, present, hooked_present as PresentImp as _, core, None)?;
    }

    Ok(())
}

#[tracing::instrument]
extern "C" fn hooked_present(this: *mut c_void, sel: *mut c_void) {
    trace!("-[CAMetalDrawable present] called");

    let entry = PRESENT.wait();
    {
        let _in_flight = entry.owner.in_flight.enter();
        if PRESENT.armed() {
            entry.owner.render_frame(&Frame::Metal { drawable: this });
        }
    }

    unsafe { entry.trampoline.cast::<PresentImp>()(this, sel) }
}
