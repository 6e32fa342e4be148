use core::ffi::c_void;

use anyhow::Context;
use scopeguard::defer;
use tracing::debug;
use windows::{
    Win32::Graphics::{
        Direct3D10::*,
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
    view: ID3D10RenderTargetView,
    size: (u32, u32),
}

pub struct Dx10Driver {
    swapchain: IDXGISwapChain,
    device: ID3D10Device,
    state_block: ID3D10StateBlock,
    target: Option<RenderTarget>,
}

impl Dx10Driver {
    #[tracing::instrument]
    pub fn new(swapchain: *mut c_void) -> anyhow::Result<Self> {
        let swapchain = unsafe { IDXGISwapChain::from_raw_borrowed(&swapchain) }
            .cloned()
            .context("null IDXGISwapChain")?;

        unsafe {
            let device = swapchain.GetDevice::<ID3D10Device>()?;

            let mut mask = D3D10_STATE_BLOCK_MASK::default();
            D3D10StateBlockMaskEnableAll(&mut mask)?;
            let state_block = D3D10CreateStateBlock(&device, &mask)?;

            Ok(Self {
                swapchain,
                device,
                state_block,
                target: None,
            })
        }
    }
}

impl RenderDriver for Dx10Driver {
    fn init(&mut self, _: &Frame<'_>) -> anyhow::Result<()> {
        unsafe {
            let back_buffer = self.swapchain.GetBuffer::<ID3D10Texture2D>(0)?;
            let mut desc = D3D10_TEXTURE2D_DESC::default();
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
        self.target.take();
        unsafe { self.device.Flush() };
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

        let device = &self.device;
        let state_block = &self.state_block;
        unsafe {
            state_block.Capture()?;
        }
        defer!(unsafe {
            _ = state_block.Apply();
        });

        unsafe {
            device.ClearState();
            device.OMSetRenderTargets(Some(&[Some(target.view.clone())]), None);
            device.RSSetViewports(Some(&[D3D10_VIEWPORT {
                TopLeftX: 0,
                TopLeftY: 0,
                Width: target.size.0,
                Height: target.size.1,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
        }

        draw(&NativeTarget {
            api: Api::Dx10,
            device: device.as_raw() as usize,
            context: 0,
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
                &D3D10_TEXTURE2D_DESC {
                    Width: width,
                    Height: height,
                    MipLevels: 1,
                    ArraySize: 1,
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    Usage: D3D10_USAGE_DEFAULT,
                    BindFlags: D3D10_BIND_SHADER_RESOURCE.0 as _,
                    CPUAccessFlags: 0,
                    MiscFlags: 0,
                },
                Some(&D3D10_SUBRESOURCE_DATA {
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
            drop(ID3D10ShaderResourceView::from_raw(texture.view as *mut c_void));
            drop(ID3D10Texture2D::from_raw(texture.handle as *mut c_void));
        }
    }
}

unsafe impl Send for Dx10Driver {}
