//! `dlopen` based module lookup.

use core::ffi::{CStr, c_int};
use std::{ffi::CString, path::PathBuf};

use asdf_present_hook::FnPtr;
use tracing::debug;

use crate::{
    module::{ModuleHandle, ModuleIntrospection},
    types::IntDashMap,
};

#[derive(Default)]
pub struct DlModules {
    // handle -> name it was opened with
    names: IntDashMap<usize, PathBuf>,
}

impl DlModules {
    pub fn new() -> Self {
        Self::default()
    }

    fn dlopen(&self, name: &str, flags: c_int) -> Option<ModuleHandle> {
        let c_name = CString::new(name).ok()?;
        let handle = ModuleHandle::new(unsafe { libc::dlopen(c_name.as_ptr(), flags) } as usize)?;
        self.names.insert(handle.raw(), PathBuf::from(name));
        Some(handle)
    }
}

impl ModuleIntrospection for DlModules {
    fn open(&self, path: &str) -> Option<ModuleHandle> {
        let handle = self.dlopen(path, libc::RTLD_NOW | libc::RTLD_LOCAL)?;
        debug!("{path} opened: {:#x}", handle.raw());
        Some(handle)
    }

    fn symbol(&self, module: ModuleHandle, name: &CStr) -> Option<FnPtr> {
        FnPtr::new(unsafe { libc::dlsym(module.raw() as _, name.as_ptr()) })
    }

    fn loaded(&self, name: &str) -> Option<ModuleHandle> {
        let handle = self.dlopen(name, libc::RTLD_NOW | libc::RTLD_NOLOAD)?;
        // RTLD_NOLOAD still takes a reference
        unsafe { libc::dlclose(handle.raw() as _) };
        Some(handle)
    }

    fn path(&self, module: ModuleHandle) -> Option<PathBuf> {
        self.names.get(&module.raw()).map(|entry| entry.value().clone())
    }
}
