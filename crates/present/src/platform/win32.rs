//! Win32 module lookup and offscreen probe devices.

use core::{ffi::CStr, ptr};
use std::{ffi::CString, path::PathBuf};

use anyhow::{Context, bail};
use asdf_present_hook::FnPtr;
use scopeguard::defer;
use tracing::debug;
use windows::{
    Win32::{
        Foundation::{HINSTANCE, HMODULE, HWND, LPARAM, LRESULT, WPARAM},
        Graphics::{
            Direct3D::D3D_FEATURE_LEVEL_11_0,
            Direct3D9::{
                D3D_SDK_VERSION, D3DADAPTER_DEFAULT, D3DCREATE_HARDWARE_VERTEXPROCESSING,
                D3DDEVTYPE_HAL, D3DPRESENT_PARAMETERS, D3DSWAPEFFECT_DISCARD, Direct3DCreate9Ex,
            },
            Direct3D10::{
                D3D10_DRIVER_TYPE_HARDWARE, D3D10_SDK_VERSION, D3D10CreateDeviceAndSwapChain,
            },
            Direct3D12::{
                D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC,
                D3D12_COMMAND_QUEUE_FLAG_NONE, D3D12CreateDevice, ID3D12CommandQueue,
                ID3D12Device,
            },
            Dxgi::{
                Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_MODE_DESC, DXGI_SAMPLE_DESC},
                CreateDXGIFactory1, DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_EFFECT_DISCARD,
                DXGI_USAGE_RENDER_TARGET_OUTPUT, IDXGIFactory1,
            },
        },
        System::LibraryLoader::{
            GetModuleFileNameW, GetModuleHandleW, GetProcAddress, LoadLibraryW,
        },
        UI::WindowsAndMessaging::{
            CS_OWNDC, CreateWindowExA, DefWindowProcW, DestroyWindow, HWND_MESSAGE,
            RegisterClassA, UnregisterClassA, WINDOW_EX_STYLE, WNDCLASSA, WS_POPUP,
        },
    },
    core::{BOOL, HSTRING, Interface, PCSTR, PCWSTR, s},
};

use crate::{
    module::{ModuleHandle, ModuleIntrospection},
    platform::OffscreenDevices,
    vtable::ComObject,
};

#[inline]
fn to_hmodule(module: ModuleHandle) -> HMODULE {
    HMODULE(module.raw() as _)
}

/// `LoadLibrary` based module lookup.
#[derive(Debug, Default)]
pub struct Win32Modules;

impl ModuleIntrospection for Win32Modules {
    fn open(&self, path: &str) -> Option<ModuleHandle> {
        let module = unsafe { LoadLibraryW(&HSTRING::from(path)) }.ok()?;
        ModuleHandle::new(module.0 as usize)
    }

    fn symbol(&self, module: ModuleHandle, name: &CStr) -> Option<FnPtr> {
        let func = unsafe { GetProcAddress(to_hmodule(module), PCSTR(name.as_ptr().cast())) }?;
        FnPtr::new(func as *const _)
    }

    fn loaded(&self, name: &str) -> Option<ModuleHandle> {
        let module = unsafe { GetModuleHandleW(&HSTRING::from(name)) }.ok()?;
        ModuleHandle::new(module.0 as usize)
    }

    fn path(&self, module: ModuleHandle) -> Option<PathBuf> {
        let mut buf = vec![0u16; 1024];
        let len = unsafe { GetModuleFileNameW(Some(to_hmodule(module)), &mut buf) } as usize;
        if len == 0 {
            return None;
        }

        Some(PathBuf::from(String::from_utf16_lossy(&buf[..len])))
    }
}

fn with_dummy_hwnd<R>(f: impl FnOnce(HWND) -> anyhow::Result<R>) -> anyhow::Result<R> {
    extern "system" fn window_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
    }

    unsafe {
        let hinstance = HINSTANCE(GetModuleHandleW(PCWSTR::null())?.0);
        let class_name = CString::new(format!(
            "asdf-present-{} probe window class",
            hinstance.0 as usize
        ))?;
        if RegisterClassA(&WNDCLASSA {
            style: CS_OWNDC,
            hInstance: hinstance,
            lpszClassName: PCSTR(class_name.as_ptr() as _),
            lpfnWndProc: Some(window_proc),
            ..Default::default()
        }) == 0
        {
            bail!("RegisterClassA call failed");
        }
        defer!({
            _ = UnregisterClassA(PCSTR(class_name.as_ptr() as _), Some(hinstance));
        });

        let hwnd = CreateWindowExA(
            WINDOW_EX_STYLE(0),
            PCSTR(class_name.as_ptr() as _),
            s!("asdf-present probe window"),
            WS_POPUP,
            0,
            0,
            1,
            1,
            Some(HWND_MESSAGE),
            None,
            None,
            None,
        )?;
        defer!({
            _ = DestroyWindow(hwnd);
        });

        f(hwnd)
    }
}

/// Probe devices created on an invisible message only window.
#[derive(Debug, Default)]
pub struct Win32OffscreenDevices;

impl OffscreenDevices for Win32OffscreenDevices {
    #[tracing::instrument(skip(self))]
    fn dxgi_swapchain(&self) -> anyhow::Result<ComObject> {
        with_dummy_hwnd(|hwnd| unsafe {
            let factory = CreateDXGIFactory1::<IDXGIFactory1>()?;
            let adapter = factory.EnumAdapters1(0)?;

            let desc = DXGI_SWAP_CHAIN_DESC {
                BufferCount: 1,
                BufferDesc: DXGI_MODE_DESC {
                    Width: 1,
                    Height: 1,
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ..Default::default()
                },
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    ..Default::default()
                },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                OutputWindow: hwnd,
                Windowed: BOOL(1),
                SwapEffect: DXGI_SWAP_EFFECT_DISCARD,
                ..Default::default()
            };

            let mut swapchain = None;
            let mut device = None;
            D3D10CreateDeviceAndSwapChain(
                &adapter,
                D3D10_DRIVER_TYPE_HARDWARE,
                HMODULE(ptr::null_mut()),
                0,
                D3D10_SDK_VERSION,
                Some(&desc),
                Some(&mut swapchain),
                Some(&mut device),
            )?;
            let swapchain = swapchain.context("SwapChain creation failed")?;
            debug!("probe swapchain created");

            ComObject::from_raw(swapchain.into_raw()).context("null swapchain")
        })
    }

    #[tracing::instrument(skip(self))]
    fn d3d9_device(&self) -> anyhow::Result<ComObject> {
        with_dummy_hwnd(|hwnd| unsafe {
            let dx9ex = Direct3DCreate9Ex(D3D_SDK_VERSION).context("cannot create IDirect3D9")?;

            let mut device = None;
            dx9ex.CreateDeviceEx(
                D3DADAPTER_DEFAULT,
                D3DDEVTYPE_HAL,
                HWND(ptr::null_mut()),
                D3DCREATE_HARDWARE_VERTEXPROCESSING as _,
                &mut D3DPRESENT_PARAMETERS {
                    Windowed: BOOL(1),
                    SwapEffect: D3DSWAPEFFECT_DISCARD,
                    hDeviceWindow: hwnd,
                    ..Default::default()
                },
                ptr::null_mut(),
                &mut device,
            )?;
            let device = device.context("cannot create IDirect3DDevice9")?;
            debug!("probe d3d9 device created");

            ComObject::from_raw(device.into_raw()).context("null device")
        })
    }

    #[tracing::instrument(skip(self))]
    fn d3d12_command_queue(&self) -> anyhow::Result<ComObject> {
        unsafe {
            let mut device = None;
            D3D12CreateDevice::<_, ID3D12Device>(None, D3D_FEATURE_LEVEL_11_0, &mut device)?;
            let device = device.context("cannot create ID3D12Device")?;

            let queue =
                device.CreateCommandQueue::<ID3D12CommandQueue>(&D3D12_COMMAND_QUEUE_DESC {
                    Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                    Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                    ..Default::default()
                })?;
            debug!("probe d3d12 command queue created");

            ComObject::from_raw(queue.into_raw()).context("null command queue")
        }
    }
}
