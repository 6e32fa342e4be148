use std::collections::HashMap;

use parking_lot::Mutex;
use retour::RawDetour;
use tracing::error;

use crate::{FnPtr, Patcher};

/// [`Patcher`] rewriting function prologues with `retour`.
#[derive(Default)]
pub struct DetourPatcher {
    detours: Mutex<HashMap<FnPtr, RawDetour>>,
}

impl DetourPatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Patcher for DetourPatcher {
    unsafe fn install(&self, target: FnPtr, replacement: FnPtr) -> Option<FnPtr> {
        let mut detours = self.detours.lock();
        if detours.contains_key(&target) {
            return None;
        }

        let res = unsafe { RawDetour::new(target.as_ptr() as _, replacement.as_ptr() as _) };
        let detour = match res {
            Ok(detour) => detour,
            Err(err) => {
                error!("cannot create detour on {:?}. {err}", target);
                return None;
            }
        };

        if let Err(err) = unsafe { detour.enable() } {
            error!("cannot enable detour on {:?}. {err}", target);
            return None;
        }

        let trampoline = FnPtr::new(detour.trampoline() as *const _ as _)?;
        detours.insert(target, detour);
        Some(trampoline)
    }

    unsafe fn remove(&self, target: FnPtr) -> bool {
        let mut detours = self.detours.lock();
        let Some(detour) = detours.get(&target) else {
            return false;
        };

        if let Err(err) = unsafe { detour.disable() } {
            error!("cannot disable detour on {:?}. {err}", target);
            return false;
        }

        detours.remove(&target);
        true
    }
}
