//! Lock free cells read by hook replacements.
//!
//! `extern "system"` replacements cannot capture, so each intercepted function has one
//! static [`Slot`] holding its trampoline and the owner which installed it.
//! Slots are filled right after install and disarmed on removal. A disarmed slot still holds
//! its trampoline so a replacement entered before removal can always forward.

use core::{
    ffi::c_void,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    sync::Arc,
    thread,
    time::Instant,
};

use arc_swap::ArcSwapOption;
use asdf_present_hook::{FnPtr, HookError, HookSet};
use tracing::{debug, warn};

pub(crate) struct Entry<T> {
    pub trampoline: FnPtr,
    pub owner: Arc<T>,
    /// Additional function the replacement needs, resolved at install.
    pub extra: Option<FnPtr>,
}

pub(crate) struct Slot<T> {
    armed: AtomicBool,
    cell: ArcSwapOption<Entry<T>>,
}

impl<T> Slot<T> {
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            cell: ArcSwapOption::const_empty(),
        }
    }

    /// Load the slot entry, waiting for an install in progress to publish it.
    pub fn wait(&self) -> Arc<Entry<T>> {
        loop {
            if let Some(entry) = self.cell.load_full() {
                return entry;
            }

            thread::yield_now();
        }
    }

    #[inline]
    pub fn armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Disarm the slot if `owner` installed its current entry.
    pub fn disarm_owned(&self, owner: &Arc<T>) -> bool {
        let owned = self
            .cell
            .load()
            .as_ref()
            .is_some_and(|entry| Arc::ptr_eq(&entry.owner, owner));

        if owned {
            self.disarm();
        }
        owned
    }

    /// Owner of the current entry, if it is armed.
    pub fn owner(&self) -> Option<Arc<T>> {
        if !self.armed() {
            return None;
        }

        self.cell.load_full().map(|entry| entry.owner.clone())
    }

    /// Install a hook on `target` and publish it in this slot.
    ///
    /// # Safety
    /// `replacement` must read this slot and have the signature of `target`.
    pub unsafe fn install(
        &'static self,
        hooks: &HookSet,
        target: FnPtr,
        replacement: *const c_void,
        owner: &Arc<T>,
        extra: Option<FnPtr>,
    ) -> Result<FnPtr, HookError> {
        self.disarm();
        self.cell.store(None);

        let trampoline = unsafe { hooks.install_raw(target.as_ptr(), replacement)? };
        self.cell.store(Some(Arc::new(Entry {
            trampoline,
            owner: owner.clone(),
            extra,
        })));
        self.armed.store(true, Ordering::Release);

        Ok(trampoline)
    }
}

/// Number of replacements currently executing for one owner.
#[derive(Debug, Default)]
pub(crate) struct InFlight(AtomicUsize);

impl InFlight {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub fn enter(&self) -> InFlightGuard<'_> {
        self.0.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(self)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Wait until no replacement is running. Returns `false` on timeout.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.drain_to(0, timeout)
    }

    /// Wait until at most `floor` replacements are running.
    pub fn drain_to(&self, floor: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let count = self.count();
            if count <= floor {
                return true;
            }

            if Instant::now() >= deadline {
                warn!("{count} replacements still running after {timeout:?}");
                return false;
            }

            thread::yield_now();
        }
    }
}

pub(crate) struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Disarm the slots `owner` installed, remove every hook of `hooks` and wait for running
/// replacements of `owner`.
///
/// Slots another owner installed since are left alone.
/// `own` is the number of replacements the calling thread is running itself.
pub(crate) fn teardown<T>(
    slots: &[&Slot<T>],
    owner: &Arc<T>,
    hooks: &HookSet,
    in_flight: &InFlight,
    own: usize,
    timeout: Duration,
) -> bool {
    for slot in slots {
        slot.disarm_owned(owner);
    }

    let removed = hooks.remove_all();
    debug!("{removed} hooks removed");
    in_flight.drain_to(own, timeout) && hooks.is_empty()
}

#[cfg(test)]
mod tests {
    use asdf_present_hook::Patcher;

    use super::*;

    /// Patcher handing out fake trampolines without touching code.
    struct OffsetPatcher;

    impl Patcher for OffsetPatcher {
        unsafe fn install(&self, target: FnPtr, _: FnPtr) -> Option<FnPtr> {
            FnPtr::new((target.addr() + 0x1000) as _)
        }

        unsafe fn remove(&self, _: FnPtr) -> bool {
            true
        }
    }

    #[derive(Debug, Default)]
    struct Owner(InFlight);

    fn fn_ptr(addr: usize) -> FnPtr {
        FnPtr::new(addr as _).unwrap()
    }

    #[test]
    fn stale_owner_leaves_newer_install_armed() {
        static SLOT: Slot<Owner> = Slot::new();

        let stale = Arc::new(Owner::default());
        let stale_hooks = HookSet::new(Arc::new(OffsetPatcher));
        let live = Arc::new(Owner::default());
        let live_hooks = HookSet::new(Arc::new(OffsetPatcher));

        unsafe {
            SLOT.install(&stale_hooks, fn_ptr(0x10), 0x20 as _, &stale, None)
                .unwrap();
            SLOT.install(&live_hooks, fn_ptr(0x30), 0x40 as _, &live, None)
                .unwrap();
        }

        assert!(!SLOT.disarm_owned(&stale));
        assert!(teardown(
            &[&SLOT],
            &stale,
            &stale_hooks,
            &stale.0,
            0,
            Duration::ZERO
        ));
        assert!(stale_hooks.is_empty());
        assert!(SLOT.owner().is_some_and(|owner| Arc::ptr_eq(&owner, &live)));

        assert!(teardown(
            &[&SLOT],
            &live,
            &live_hooks,
            &live.0,
            0,
            Duration::ZERO
        ));
        assert!(!SLOT.armed());
        assert_eq!(SLOT.wait().trampoline, fn_ptr(0x1030));
    }
}
