//! Process module lookup.

use core::{ffi::CStr, num::NonZeroUsize};
use std::path::PathBuf;

use asdf_present_hook::FnPtr;

/// Opaque handle of a module loaded in the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(NonZeroUsize);

impl ModuleHandle {
    #[inline]
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0.get()
    }
}

/// Module and symbol resolution of the host process.
pub trait ModuleIntrospection: Send + Sync {
    /// Load a module by path or name, increasing its reference count.
    fn open(&self, path: &str) -> Option<ModuleHandle>;

    /// Resolve an exported symbol.
    fn symbol(&self, module: ModuleHandle, name: &CStr) -> Option<FnPtr>;

    /// Find an already loaded module without changing its reference count.
    fn loaded(&self, name: &str) -> Option<ModuleHandle>;

    /// Path of a loaded module.
    fn path(&self, module: ModuleHandle) -> Option<PathBuf>;
}

/// First loaded module out of `names`.
pub fn first_loaded(
    modules: &dyn ModuleIntrospection,
    names: &[&'static str],
) -> Option<(&'static str, ModuleHandle)> {
    names
        .iter()
        .find_map(|&name| Some((name, modules.loaded(name)?)))
}
