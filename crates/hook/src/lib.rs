//! Function hook bookkeeping.
//!
//! This crate is intended to be used only as `asdf-present`'s internal dependency.
//! It keeps track of every interception installed through a [`Patcher`] so a group of
//! hooks can be installed atomically and removed together.

#[cfg(feature = "detour")]
mod detour;

#[cfg(feature = "detour")]
pub use detour::DetourPatcher;

use core::{
    ffi::c_void,
    fmt::{self, Debug, Formatter},
    mem,
    num::NonZeroUsize,
};
use std::sync::Arc;

use parking_lot::Mutex;
use scopeguard::defer;
use tracing::{debug, trace, warn};

/// Address of a function in the current process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FnPtr(NonZeroUsize);

impl FnPtr {
    /// Wrap a raw code address. Returns `None` for null.
    #[inline]
    pub fn new(ptr: *const c_void) -> Option<Self> {
        NonZeroUsize::new(ptr as usize).map(Self)
    }

    /// Take the address of a typed function pointer.
    #[inline]
    pub fn of<F: Copy>(func: F) -> Option<Self> {
        if mem::size_of::<F>() != mem::size_of::<usize>() {
            return None;
        }

        NonZeroUsize::new(unsafe { mem::transmute_copy::<F, usize>(&func) }).map(Self)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub const fn as_ptr(self) -> *const c_void {
        self.0.get() as _
    }

    /// Reinterpret the address as a typed function pointer.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the code at this address.
    #[inline]
    pub unsafe fn cast<F: Copy>(self) -> F {
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        unsafe { mem::transmute_copy::<usize, F>(&self.0.get()) }
    }
}

impl Debug for FnPtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

impl fmt::Pointer for FnPtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}

/// Code patching primitive performing the actual redirection.
pub trait Patcher: Send + Sync {
    /// Redirect calls of `target` to `replacement`.
    ///
    /// Returns a trampoline which still reaches the original code, or `None` if the
    /// target cannot be patched.
    ///
    /// # Safety
    /// `target` and `replacement` must be functions with the same signature and calling convention.
    unsafe fn install(&self, target: FnPtr, replacement: FnPtr) -> Option<FnPtr>;

    /// Restore the original code of `target`.
    ///
    /// # Safety
    /// The trampoline returned for `target` must not be called after this returns `true`.
    unsafe fn remove(&self, target: FnPtr) -> bool;

    /// Start collecting patches to apply at once. No-op for non transactional primitives.
    fn begin_transaction(&self) {}

    /// Apply patches collected since [`Patcher::begin_transaction`].
    fn commit_transaction(&self) {}
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    #[error("hook target is null")]
    NullTarget,

    #[error("target {0:?} is already hooked by this set")]
    AlreadyHooked(FnPtr),

    #[error("patch primitive failed to hook {0:?}")]
    PatchFailed(FnPtr),
}

/// A function interception owned by a [`HookSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRecord {
    pub target: FnPtr,
    pub replacement: FnPtr,
    pub trampoline: FnPtr,
    pub active: bool,
}

struct Inner {
    records: Vec<HookRecord>,
    batch_depth: u32,
}

/// Set of active function hooks installed through one [`Patcher`].
pub struct HookSet {
    patcher: Arc<dyn Patcher>,
    inner: Mutex<Inner>,
}

impl HookSet {
    pub fn new(patcher: Arc<dyn Patcher>) -> Self {
        Self {
            patcher,
            inner: Mutex::new(Inner {
                records: Vec::new(),
                batch_depth: 0,
            }),
        }
    }

    /// Hook `target` with `replacement` and return the trampoline to the original function.
    ///
    /// # Safety
    /// `F` must be a function pointer type, and `replacement` must be safe to call
    /// everywhere `target` is called.
    pub unsafe fn install<F: Copy>(&self, target: F, replacement: F) -> Result<F, HookError> {
        let target = FnPtr::of(target).ok_or(HookError::NullTarget)?;
        let replacement = FnPtr::of(replacement).ok_or(HookError::NullTarget)?;

        let trampoline = unsafe { self.install_ptr(target, replacement)? };
        Ok(unsafe { trampoline.cast::<F>() })
    }

    /// Hook a raw `target` address.
    ///
    /// # Safety
    /// See [`HookSet::install`].
    pub unsafe fn install_raw(
        &self,
        target: *const c_void,
        replacement: *const c_void,
    ) -> Result<FnPtr, HookError> {
        let target = FnPtr::new(target).ok_or(HookError::NullTarget)?;
        let replacement = FnPtr::new(replacement).ok_or(HookError::NullTarget)?;

        unsafe { self.install_ptr(target, replacement) }
    }

    #[tracing::instrument(skip(self))]
    unsafe fn install_ptr(&self, target: FnPtr, replacement: FnPtr) -> Result<FnPtr, HookError> {
        let mut inner = self.inner.lock();
        if inner.records.iter().any(|record| record.target == target) {
            return Err(HookError::AlreadyHooked(target));
        }

        let trampoline = unsafe { self.patcher.install(target, replacement) }
            .ok_or(HookError::PatchFailed(target))?;
        debug!("hook attached. trampoline: {:?}", trampoline);

        inner.records.push(HookRecord {
            target,
            replacement,
            trampoline,
            active: true,
        });

        Ok(trampoline)
    }

    /// Remove the hook on `target`, returning its now inactive record.
    ///
    /// Returns `None` if the target is not owned by this set or could not be restored.
    #[tracing::instrument(skip(self))]
    pub fn remove(&self, target: FnPtr) -> Option<HookRecord> {
        let mut inner = self.inner.lock();
        let index = inner
            .records
            .iter()
            .position(|record| record.target == target)?;

        if !unsafe { self.patcher.remove(target) } {
            warn!("failed to restore {:?}", target);
            return None;
        }

        let mut record = inner.records.swap_remove(index);
        record.active = false;
        debug!("hook detached");
        Some(record)
    }

    /// Restore every hooked function.
    ///
    /// Records that fail to restore are kept and stay active. Returns the number of removed hooks.
    #[tracing::instrument(skip(self))]
    pub fn remove_all(&self) -> usize {
        self.begin_batch();
        defer!(self.end_batch());

        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner.records.retain(|record| {
            if unsafe { self.patcher.remove(record.target) } {
                trace!("restored {:?}", record.target);
                false
            } else {
                warn!("failed to restore {:?}", record.target);
                true
            }
        });

        let removed = before - inner.records.len();
        debug!("{removed} hooks removed, {} left", inner.records.len());
        removed
    }

    /// Open an install batch. Batches nest, only the outermost one reaches the patcher.
    pub fn begin_batch(&self) {
        let mut inner = self.inner.lock();
        inner.batch_depth += 1;
        if inner.batch_depth == 1 {
            self.patcher.begin_transaction();
        }
    }

    /// Close an install batch opened with [`HookSet::begin_batch`].
    pub fn end_batch(&self) {
        let mut inner = self.inner.lock();
        match inner.batch_depth {
            0 => warn!("end_batch called without begin_batch"),
            1 => {
                inner.batch_depth = 0;
                self.patcher.commit_transaction();
            }
            _ => inner.batch_depth -= 1,
        }
    }

    /// Run `f` inside a batch which is always closed afterwards.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        self.begin_batch();
        defer!(self.end_batch());
        f(self)
    }

    #[inline]
    pub fn contains(&self, target: FnPtr) -> bool {
        self.inner
            .lock()
            .records
            .iter()
            .any(|record| record.target == target)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of active records.
    pub fn records(&self) -> Vec<HookRecord> {
        self.inner.lock().records.clone()
    }
}

impl Debug for HookSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("records", &self.inner.lock().records)
            .finish_non_exhaustive()
    }
}
