use core::ffi::c_void;

use anyhow::Context;
use scopeguard::defer;
use tracing::debug;
use windows::{
    Win32::Graphics::{
        Direct3D::D3D_FEATURE_LEVEL_11_0,
        Direct3D11::*,
        Dxgi::{
            Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC},
            IDXGISwapChain,
        },
    },
    core::Interface,
};

use super::{Release, RenderDriver};
use crate::{
    frame::{Frame, NativeTarget},
    image::NativeTexture,
    types::Api,
};

struct RenderTarget {
    view: ID3D11RenderTargetView,
    size: (u32, u32),
}

pub struct Dx11Driver {
    swapchain: IDXGISwapChain,
    device: ID3D11Device1,
    cx: ID3D11DeviceContext1,
    /// Pipeline state used while the overlay draws, isolated from the host state.
    state: ID3DDeviceContextState,
    target: Option<RenderTarget>,
}

impl Dx11Driver {
    #[tracing::instrument]
    pub fn new(swapchain: *mut c_void) -> anyhow::Result<Self> {
        let swapchain = unsafe { IDXGISwapChain::from_raw_borrowed(&swapchain) }
            .cloned()
            .context("null IDXGISwapChain")?;

        unsafe {
            let device = swapchain.GetDevice::<ID3D11Device1>()?;
            let cx = device
                .GetImmediateContext1()
                .context("cannot get immediate context")?;

            let flag = if device.GetCreationFlags() & D3D11_CREATE_DEVICE_SINGLETHREADED.0 != 0 {
                D3D11_1_CREATE_DEVICE_CONTEXT_STATE_SINGLETHREADED.0 as u32
            } else {
                0
            };

            let mut state = None;
            device.CreateDeviceContextState(
                flag,
                &[D3D_FEATURE_LEVEL_11_0],
                D3D11_SDK_VERSION,
                &ID3D11Device::IID,
                None,
                Some(&mut state),
            )?;
            let state = state.context("CreateDeviceContextState failed")?;

            Ok(Self {
                swapchain,
                device,
                cx,
                state,
                target: None,
            })
        }
    }
}

impl RenderDriver for Dx11Driver {
    fn init(&mut self, _: &Frame<'_>) -> anyhow::Result<()> {
        unsafe {
            let back_buffer = self.swapchain.GetBuffer::<ID3D11Texture2D>(0)?;
            let mut desc = D3D11_TEXTURE2D_DESC::default();
            back_buffer.GetDesc(&mut desc);

            let mut view = None;
            self.device
                .CreateRenderTargetView(&back_buffer, None, Some(&mut view))?;
            let view = view.context("cannot create render target view")?;
            debug!("back buffer {}x{}", desc.Width, desc.Height);

            self.target = Some(RenderTarget {
                view,
                size: (desc.Width, desc.Height),
            });
        }

        Ok(())
    }

    fn release(&mut self, _: Release) {
        // back buffer references must be gone before ResizeBuffers
        self.target.take();
        unsafe { self.cx.Flush() };
    }

    fn render(
        &mut self,
        _: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        let Some(ref target) = self.target else {
            return Ok(());
        };

        if target.size.0 == 0 || target.size.1 == 0 {
            return Ok(());
        }

        let cx = &self.cx;
        let mut last_state = None;
        unsafe {
            cx.SwapDeviceContextState(&self.state, Some(&mut last_state));
        }
        let last_state = last_state.context("no device context state to restore")?;
        defer!(unsafe {
            cx.SwapDeviceContextState(&last_state, None);
        });

        unsafe {
            cx.OMSetRenderTargets(Some(&[Some(target.view.clone())]), None);
            cx.RSSetViewports(Some(&[D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: target.size.0 as _,
                Height: target.size.1 as _,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
        }
        defer!(unsafe { cx.OMSetRenderTargets(None, None) });

        draw(&NativeTarget {
            api: Api::Dx11,
            device: self.device.as_raw() as usize,
            context: cx.as_raw() as usize,
            render_target: target.view.as_raw() as u64,
            width: target.size.0,
            height: target.size.1,
        });

        Ok(())
    }

    fn create_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture> {
        let mut texture = None;
        let mut view = None;
        unsafe {
            self.device.CreateTexture2D(
                &D3D11_TEXTURE2D_DESC {
                    Width: width,
                    Height: height,
                    MipLevels: 1,
                    ArraySize: 1,
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    Usage: D3D11_USAGE_DEFAULT,
                    BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as _,
                    CPUAccessFlags: 0,
                    MiscFlags: 0,
                },
                Some(&D3D11_SUBRESOURCE_DATA {
                    pSysMem: pixels.as_ptr().cast(),
                    SysMemPitch: width * 4,
                    SysMemSlicePitch: 0,
                }),
                Some(&mut texture),
            )?;
            let texture = texture.context("cannot create texture")?;

            self.device
                .CreateShaderResourceView(&texture, None, Some(&mut view))?;
            let view = view.context("cannot create texture view")?;

            Ok(NativeTexture {
                handle: texture.into_raw() as u64,
                view: view.into_raw() as u64,
                width,
                height,
            })
        }
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        unsafe {
            drop(ID3D11ShaderResourceView::from_raw(texture.view as *mut c_void));
            drop(ID3D11Texture2D::from_raw(texture.handle as *mut c_void));
        }
    }
}

unsafe impl Send for Dx11Driver {}
