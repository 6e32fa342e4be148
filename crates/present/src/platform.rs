//! Collaborators injected into the detector and backends.

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod win32;

use std::sync::Arc;

use anyhow::bail;
use asdf_present_hook::Patcher;

use crate::{module::ModuleIntrospection, renderer::DriverFactory, vtable::ComObject};

/// Factory of throwaway devices whose method tables are read during probing and attach.
///
/// Devices are never used to render and are released right after reading.
pub trait OffscreenDevices: Send + Sync {
    /// `IDXGISwapChain` of an invisible 1x1 window.
    fn dxgi_swapchain(&self) -> anyhow::Result<ComObject>;

    /// `IDirect3DDevice9Ex` if available, otherwise `IDirect3DDevice9`.
    fn d3d9_device(&self) -> anyhow::Result<ComObject>;

    /// Direct `ID3D12CommandQueue`.
    fn d3d12_command_queue(&self) -> anyhow::Result<ComObject>;
}

/// [`OffscreenDevices`] of platforms without COM graphics apis.
#[derive(Debug, Default)]
pub struct NoOffscreenDevices;

impl OffscreenDevices for NoOffscreenDevices {
    fn dxgi_swapchain(&self) -> anyhow::Result<ComObject> {
        bail!("dxgi is not available on this platform")
    }

    fn d3d9_device(&self) -> anyhow::Result<ComObject> {
        bail!("direct3d 9 is not available on this platform")
    }

    fn d3d12_command_queue(&self) -> anyhow::Result<ComObject> {
        bail!("direct3d 12 is not available on this platform")
    }
}

/// Collaborator bundle handed to the detector and every backend it attaches.
#[derive(Clone)]
pub struct Platform {
    pub patcher: Arc<dyn Patcher>,
    pub modules: Arc<dyn ModuleIntrospection>,
    pub offscreen: Arc<dyn OffscreenDevices>,
    pub drivers: Arc<dyn DriverFactory>,
}

impl Platform {
    /// Collaborators of the running operating system, patching with `retour`.
    #[cfg(feature = "detour")]
    pub fn native() -> Self {
        use asdf_present_hook::DetourPatcher;

        use crate::renderer::NativeDrivers;

        #[cfg(windows)]
        let (modules, offscreen): (Arc<dyn ModuleIntrospection>, Arc<dyn OffscreenDevices>) = (
            Arc::new(win32::Win32Modules),
            Arc::new(win32::Win32OffscreenDevices),
        );

        #[cfg(unix)]
        let (modules, offscreen): (Arc<dyn ModuleIntrospection>, Arc<dyn OffscreenDevices>) =
            (Arc::new(unix::DlModules::new()), Arc::new(NoOffscreenDevices));

        Self {
            patcher: Arc::new(DetourPatcher::new()),
            drivers: Arc::new(NativeDrivers::new(modules.clone())),
            modules,
            offscreen,
        }
    }
}
