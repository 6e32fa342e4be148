use core::{ffi::c_void, ptr};

use anyhow::Context;
use scopeguard::defer;
use tracing::debug;
use windows::{
    Win32::Graphics::Direct3D9::*,
    core::Interface,
};

use super::{Release, RenderDriver};
use crate::{
    frame::{Frame, NativeTarget},
    image::NativeTexture,
    types::Api,
};

struct RenderTarget {
    back_buffer: IDirect3DSurface9,
    state_block: IDirect3DStateBlock9,
    size: (u32, u32),
}

pub struct Dx9Driver {
    device: IDirect3DDevice9,
    /// Textures of Ex devices survive `ResetEx` in the default pool.
    pool: D3DPOOL,
    target: Option<RenderTarget>,
}

impl Dx9Driver {
    #[tracing::instrument]
    pub fn new(device: *mut c_void) -> anyhow::Result<Self> {
        let device = unsafe { IDirect3DDevice9::from_raw_borrowed(&device) }
            .cloned()
            .context("null IDirect3DDevice9")?;

        let pool = if device.cast::<IDirect3DDevice9Ex>().is_ok() {
            D3DPOOL_DEFAULT
        } else {
            D3DPOOL_MANAGED
        };

        Ok(Self {
            device,
            pool,
            target: None,
        })
    }
}

impl RenderDriver for Dx9Driver {
    fn init(&mut self, _: &Frame<'_>) -> anyhow::Result<()> {
        unsafe {
            let back_buffer = self
                .device
                .GetBackBuffer(0, 0, D3DBACKBUFFER_TYPE_MONO)
                .context("cannot get back buffer")?;

            let mut desc = D3DSURFACE_DESC::default();
            back_buffer.GetDesc(&mut desc)?;

            let state_block = self.device.CreateStateBlock(D3DSBT_ALL)?;
            debug!("back buffer {}x{}", desc.Width, desc.Height);

            self.target = Some(RenderTarget {
                back_buffer,
                state_block,
                size: (desc.Width, desc.Height),
            });
        }

        Ok(())
    }

    fn release(&mut self, _: Release) {
        // state blocks and back buffers must be gone before Reset
        self.target.take();
    }

    fn render(
        &mut self,
        frame: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        let &Frame::Dx9 { in_scene, .. } = frame else {
            return Ok(());
        };

        let Some(ref target) = self.target else {
            return Ok(());
        };

        if target.size.0 == 0 || target.size.1 == 0 {
            return Ok(());
        }

        unsafe {
            let device = &self.device;
            let state_block = &target.state_block;
            state_block.Capture()?;
            defer!({
                _ = state_block.Apply();
            });

            let last_target = device.GetRenderTarget(0).ok();
            defer!({
                if let Some(ref last_target) = last_target {
                    _ = device.SetRenderTarget(0, last_target);
                }
            });

            device.SetRenderTarget(0, &target.back_buffer)?;
            device.SetViewport(&D3DVIEWPORT9 {
                X: 0,
                Y: 0,
                Width: target.size.0,
                Height: target.size.1,
                MinZ: 0.0,
                MaxZ: 1.0,
            })?;
            // disable srgb gamma correction enabled in some games
            device.SetRenderState(D3DRS_SRGBWRITEENABLE, 0)?;

            if !in_scene {
                device.BeginScene()?;
            }
            defer!({
                if !in_scene {
                    _ = device.EndScene();
                }
            });

            draw(&NativeTarget {
                api: Api::Dx9,
                device: device.as_raw() as usize,
                context: 0,
                render_target: target.back_buffer.as_raw() as u64,
                width: target.size.0,
                height: target.size.1,
            });
        }

        Ok(())
    }

    fn create_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture> {
        let usage = if self.pool == D3DPOOL_DEFAULT {
            D3DUSAGE_DYNAMIC as u32
        } else {
            0
        };

        let mut texture = None;
        unsafe {
            self.device.CreateTexture(
                width,
                height,
                1,
                usage,
                D3DFMT_A8R8G8B8,
                self.pool,
                &mut texture,
                ptr::null_mut(),
            )?;
        }
        let texture = texture.context("cannot create texture")?;

        let flags = if self.pool == D3DPOOL_DEFAULT {
            D3DLOCK_DISCARD as u32
        } else {
            0
        };

        let mut rect = D3DLOCKED_RECT::default();
        unsafe {
            texture.LockRect(0, &mut rect, ptr::null(), flags)?;
            defer!({
                _ = texture.UnlockRect(0);
            });

            let line_size = width as usize * 4;
            for (y, line) in pixels.chunks_exact(line_size).enumerate() {
                let dest = rect
                    .pBits
                    .cast::<u8>()
                    .byte_offset(y as isize * rect.Pitch as isize);

                // rgba to bgra
                for (x, pixel) in line.chunks_exact(4).enumerate() {
                    dest.add(x * 4)
                        .cast::<[u8; 4]>()
                        .write([pixel[2], pixel[1], pixel[0], pixel[3]]);
                }
            }
        }

        Ok(NativeTexture {
            handle: texture.into_raw() as u64,
            view: 0,
            width,
            height,
        })
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        drop(unsafe { IDirect3DTexture9::from_raw(texture.handle as *mut c_void) });
    }
}

unsafe impl Send for Dx9Driver {}
